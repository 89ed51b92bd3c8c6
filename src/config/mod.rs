//! Configuration management for relay-signal

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Video codec carried by local and forwarded tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    #[default]
    VP8,
    VP9,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::VP8 => "vp8",
            VideoCodec::VP9 => "vp9",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
        }
    }

    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        match mime_type.to_ascii_lowercase().as_str() {
            "video/h264" => Some(VideoCodec::H264),
            "video/vp8" => Some(VideoCodec::VP8),
            "video/vp9" => Some(VideoCodec::VP9),
            _ => None,
        }
    }

    /// SDP fmtp line advertised for this codec
    pub fn fmtp(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relay endpoint and channel identity
    #[serde(default)]
    pub relay: RelayConfig,

    /// Signaling timeouts
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Local media IO
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Control channel WebSocket URL
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Channel to activate
    #[serde(default)]
    pub channel_id: String,

    /// Secret presented with the channel id
    #[serde(default)]
    pub channel_key: String,

    /// Client id; generated when empty
    #[serde(default)]
    pub client_id: String,

    /// Base URL of the HTTP broadcast/view endpoints
    #[serde(default)]
    pub http_base_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            channel_id: String::new(),
            channel_key: String::new(),
            client_id: String::new(),
            http_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_activation_timeout_ms")]
    pub activation_timeout_ms: u64,

    /// Bound on waiting for the relay's answer
    #[serde(default = "default_answer_timeout_ms")]
    pub answer_timeout_ms: u64,

    /// Bound on ICE connectivity after both descriptions are applied
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Wait for the relay to acknowledge ACTIVATE
    #[serde(default = "default_true")]
    pub await_activation_reply: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            activation_timeout_ms: default_activation_timeout_ms(),
            answer_timeout_ms: default_answer_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            await_activation_reply: true,
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN servers
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Ephemeral UDP port range for ICE host candidates ([min, max])
    #[serde(default = "default_udp_port_range")]
    pub udp_port_range: Option<[u16; 2]>,

    /// Request video on pull and fetch sessions
    #[serde(default = "default_true")]
    pub receive_video: bool,

    /// Request audio on pull and fetch sessions
    #[serde(default)]
    pub receive_audio: bool,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            udp_port_range: default_udp_port_range(),
            receive_video: true,
            receive_audio: false,
        }
    }
}

/// Local RTP endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaConfig {
    /// UDP address to receive RTP for push sessions (e.g. "127.0.0.1:5004")
    #[serde(default)]
    pub source_addr: Option<String>,

    /// UDP address to send received RTP to
    #[serde(default)]
    pub sink_addr: Option<String>,

    /// Codec of the RTP arriving on `source_addr`
    #[serde(default)]
    pub codec: VideoCodec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !(self.relay.url.starts_with("ws://") || self.relay.url.starts_with("wss://")) {
            return Err("Relay url must be a ws:// or wss:// URL".into());
        }

        if self.relay.channel_id.is_empty() {
            return Err("Relay channel_id must be set".into());
        }

        if let Some(ref base) = self.relay.http_base_url {
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                return Err("Relay http_base_url must be an http:// or https:// URL".into());
            }
        }

        if self.signaling.activation_timeout_ms == 0
            || self.signaling.answer_timeout_ms == 0
            || self.signaling.connect_timeout_ms == 0
        {
            return Err("Signaling timeouts must be non-zero".into());
        }

        if let Some([min, max]) = self.webrtc.udp_port_range {
            if min == 0 || min > max {
                return Err("WebRTC udp_port_range must be [min, max] with 0 < min <= max".into());
            }
        }

        if !self.webrtc.receive_video && !self.webrtc.receive_audio {
            return Err("WebRTC must receive video, audio or both".into());
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("Every ICE server needs at least one url".into());
            }
        }

        for addr in [&self.media.source_addr, &self.media.sink_addr].into_iter().flatten() {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(format!("Media address {} must be in ip:port format", addr).into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.relay.channel_id = "c1".to_string();
        cfg
    }

    #[test]
    fn validate_requires_channel() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let mut cfg = valid();
        cfg.webrtc.udp_port_range = Some([49172, 49152]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_receiving_nothing() {
        let mut cfg = valid();
        cfg.webrtc.receive_video = false;
        assert!(cfg.validate().is_err());
        cfg.webrtc.receive_audio = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_media_address() {
        let mut cfg = valid();
        cfg.media.sink_addr = Some("localhost".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_file_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [relay]
            url = "wss://relay.example/ws"
            channel_id = "c1"

            [signaling]
            answer_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signaling.answer_timeout_ms, 500);
        assert_eq!(cfg.signaling.connect_timeout_ms, default_connect_timeout_ms());
        assert_eq!(cfg.webrtc.udp_port_range, Some([49152, 49172]));
        assert_eq!(cfg.webrtc.ice_servers.len(), 3);
        assert!(cfg.webrtc.receive_video);
        assert_eq!(cfg.media.codec, VideoCodec::VP8);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = Config::load(&PathBuf::from("/nonexistent/relay-signal.toml")).unwrap();
        assert_eq!(cfg.relay.url, default_relay_url());
        assert_eq!(cfg.logging.level, "info");
    }
}

fn default_true() -> bool {
    true
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_activation_timeout_ms() -> u64 { 10_000 }
fn default_answer_timeout_ms() -> u64 { 15_000 }
fn default_connect_timeout_ms() -> u64 { 20_000 }

fn default_ice_servers() -> Vec<IceServerConfig> {
    ["stun1", "stun2", "stun3"]
        .iter()
        .map(|host| IceServerConfig {
            urls: vec![format!("stun:{}.l.google.com:19302", host)],
            username: None,
            credential: None,
        })
        .collect()
}

fn default_udp_port_range() -> Option<[u16; 2]> {
    Some([49152, 49172])
}

fn default_log_level() -> String {
    "info".to_string()
}
