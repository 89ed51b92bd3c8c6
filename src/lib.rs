//! relay-signal - client-side signaling for relayed WebRTC
//!
//! Multiplexes push, pull, fetch and forward negotiations over one control
//! connection to a media relay.

pub mod config;
pub mod metrics;
pub mod transport;
pub mod webrtc;
pub mod capture;

// Re-exports
pub use config::{Config, VideoCodec, WebRTCConfig};
pub use metrics::Metrics;
pub use webrtc::{ManagerEvent, SessionManager, WebRTCError};
