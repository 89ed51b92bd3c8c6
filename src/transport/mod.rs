//! Transport layer for relay-signal
//!
//! The WebSocket control channel to the relay, the in-memory link the
//! session manager talks through, and the one-shot HTTP bootstrap.

pub mod link;
pub mod websocket;
pub mod http_fallback;

pub use link::{ControlLink, LinkEvent};
pub use http_fallback::{BootstrapRole, HttpBootstrap};
