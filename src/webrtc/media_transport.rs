//! Media transport seam
//!
//! The signaling core never touches ICE, DTLS or RTP directly. It drives one
//! [`MediaTransport`] per session through this trait and consumes the
//! transport's notifications as [`TransportEvent`]s on a channel, so the
//! session state machine advances only at explicit await points.

use super::media_track::{MediaTrack, TrackKind};
use super::signaling::IceCandidate;
use super::WebRTCError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Which half of an offer/answer exchange a description is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connectivity as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notification from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Locally gathered candidate to trickle to the relay
    Candidate(IceCandidate),
    /// Remote media arrived
    Track(MediaTrack),
    Connectivity(ConnectivityState),
}

/// One media transport negotiation
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Send a local track on this transport
    async fn add_track(&self, track: &MediaTrack) -> Result<(), WebRTCError>;

    /// Declare intent to receive media of the given kind
    async fn add_receiver(&self, kind: TrackKind) -> Result<(), WebRTCError>;

    async fn create_offer(&self) -> Result<String, WebRTCError>;

    async fn create_answer(&self) -> Result<String, WebRTCError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WebRTCError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WebRTCError>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError>;

    /// Wait for candidate gathering to finish and return the committed local
    /// description with every candidate embedded (non-trickle exchange)
    async fn gathered_local_description(&self) -> Result<String, WebRTCError>;

    /// Release every resource held by the transport
    async fn close(&self) -> Result<(), WebRTCError>;
}

/// Creates transports; events for the new transport go to `events`
#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn MediaTransport>, WebRTCError>;
}
