//! Relay signaling over a single control connection
//!
//! This module provides the client side of the relay protocol:
//! - Control frame codec
//! - Per-session negotiation state machines
//! - Session registry and request correlation
//! - The signaling session manager that multiplexes everything

pub mod signaling;
pub mod session;
pub mod registry;
pub mod correlator;
pub mod media_track;
pub mod media_transport;
pub mod peer_connection;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use signaling::{ControlFrame, Message, MessageType};
pub use session::{SessionRole, SessionState, TransportSession};
pub use manager::{ManagerEvent, SessionManager};
pub use media_track::{MediaStream, MediaTrack, TrackKind};
pub use media_transport::{MediaTransport, MediaTransportFactory, TransportEvent};

use std::error::Error;
use std::fmt;

/// Signaling and negotiation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRTCError {
    /// Control frame could not be decoded
    MalformedFrame(String),
    /// Frame references a session that is not registered
    UnknownSession(String),
    /// Reply carries a request id nobody is waiting for
    UnresolvedRequest(u64),
    /// Description or candidate rejected by the media transport
    NegotiationFailure(String),
    /// Media transport reported disconnection
    ConnectivityLoss(String),
    /// The control connection itself dropped
    ControlChannelLoss(String),
    /// Forward requested without a previously received stream
    MissingMediaStream,
    /// Session flow started before activation
    NotActivated,
    /// Activation attempted twice on one connection
    AlreadyActivated,
    /// Relay tried to reuse an id that is still registered
    DuplicateSession(String),
    /// Invalid state transition
    InvalidState(String),
    /// Bounded wait expired
    Timeout(String),
    /// Peer connection creation or control link failure
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track error
    MediaError(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            WebRTCError::UnknownSession(id) => write!(f, "Unknown session: {}", id),
            WebRTCError::UnresolvedRequest(id) => write!(f, "Unresolved request id: {}", id),
            WebRTCError::NegotiationFailure(msg) => write!(f, "Negotiation failed: {}", msg),
            WebRTCError::ConnectivityLoss(msg) => write!(f, "Connectivity lost: {}", msg),
            WebRTCError::ControlChannelLoss(msg) => write!(f, "Control channel lost: {}", msg),
            WebRTCError::MissingMediaStream => write!(f, "No received media stream to forward"),
            WebRTCError::NotActivated => write!(f, "Channel not activated"),
            WebRTCError::AlreadyActivated => write!(f, "Channel already activated"),
            WebRTCError::DuplicateSession(id) => write!(f, "Session already exists: {}", id),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            WebRTCError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
        }
    }
}

impl Error for WebRTCError {}

impl WebRTCError {
    /// Errors raised by the media transport while applying a description or
    /// candidate are negotiation failures from the session's point of view.
    pub(crate) fn into_negotiation_failure(self) -> WebRTCError {
        match self {
            WebRTCError::SdpError(msg) | WebRTCError::IceError(msg) | WebRTCError::MediaError(msg) => {
                WebRTCError::NegotiationFailure(msg)
            }
            other => other,
        }
    }
}
