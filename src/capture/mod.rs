//! Local media IO
//!
//! Stands in for camera capture and on-screen rendering: RTP arrives from
//! and leaves to local UDP ports.

mod udp_rtp;
pub use udp_rtp::{RtpStats, UdpRtpSink, UdpRtpSource};
