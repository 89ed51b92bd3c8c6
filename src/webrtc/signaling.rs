//! Relay control protocol
//!
//! Every frame on the control channel is a JSON envelope
//! `{"type": ..., "requestId"?: n, "payload": {...}}`. The envelope is decoded
//! into a loose [`Payload`] first and then validated into a typed [`Message`]
//! so dispatch can match exhaustively on it.

use super::WebRTCError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of control message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Activate,
    Push,
    Pull,
    Fetch,
    Forward,
    Forwarding,
    /// Candidate/answer exchange (older relays call it `EXCHANGE`)
    #[serde(alias = "EXCHANGE")]
    Signal,
    Forwarded,
    Failed,
    Disconnected,
    Clear,
    Closed,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Activate => "ACTIVATE",
            MessageType::Push => "PUSH",
            MessageType::Pull => "PULL",
            MessageType::Fetch => "FETCH",
            MessageType::Forward => "FORWARD",
            MessageType::Forwarding => "FORWARDING",
            MessageType::Signal => "SIGNAL",
            MessageType::Forwarded => "FORWARDED",
            MessageType::Failed => "FAILED",
            MessageType::Disconnected => "DISCONNECTED",
            MessageType::Clear => "CLEAR",
            MessageType::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inner discriminator of a `SIGNAL` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Candidate,
    Answer,
}

/// Wire payload; every field is optional on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<SignalType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    request_id: Option<u64>,
    #[serde(default)]
    payload: Payload,
}

/// Channel identity presented on activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub channel_id: String,
    pub channel_key: String,
    pub client_id: String,
}

/// ICE candidate as exchanged with browsers (`RTCIceCandidateInit` JSON)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Session description carried by PUSH and PULL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    /// Absent on replies correlated purely by request id
    pub session_id: Option<String>,
    pub sdp: String,
}

/// Body of FETCH and FORWARD; the relay may or may not include an offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub session_id: Option<String>,
    pub sdp: Option<String>,
}

/// Candidate or answer for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Candidate(IceCandidate),
    Answer(String),
}

/// Typed control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Outbound carries the identity; the relay's acknowledgement may be empty
    Activate(Option<ChannelIdentity>),
    Push(Description),
    Pull(Description),
    Fetch(Negotiation),
    Forward(Negotiation),
    Forwarding(String),
    Signal { session_id: String, signal: Signal },
    Forwarded(String),
    Failed { session_id: Option<String>, reason: Option<String> },
    Disconnected(String),
    Clear(Option<String>),
    Closed(String),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Activate(_) => MessageType::Activate,
            Message::Push(_) => MessageType::Push,
            Message::Pull(_) => MessageType::Pull,
            Message::Fetch(_) => MessageType::Fetch,
            Message::Forward(_) => MessageType::Forward,
            Message::Forwarding(_) => MessageType::Forwarding,
            Message::Signal { .. } => MessageType::Signal,
            Message::Forwarded(_) => MessageType::Forwarded,
            Message::Failed { .. } => MessageType::Failed,
            Message::Disconnected(_) => MessageType::Disconnected,
            Message::Clear(_) => MessageType::Clear,
            Message::Closed(_) => MessageType::Closed,
        }
    }

    /// Get the session ID if present
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::Activate(_) => None,
            Message::Push(d) | Message::Pull(d) => d.session_id.as_deref(),
            Message::Fetch(n) | Message::Forward(n) => n.session_id.as_deref(),
            Message::Forwarding(id)
            | Message::Forwarded(id)
            | Message::Disconnected(id)
            | Message::Closed(id) => Some(id),
            Message::Signal { session_id, .. } => Some(session_id),
            Message::Failed { session_id, .. } | Message::Clear(session_id) => session_id.as_deref(),
        }
    }

    /// Create an answer signal
    pub fn answer(session_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Message::Signal {
            session_id: session_id.into(),
            signal: Signal::Answer(sdp.into()),
        }
    }

    /// Create a candidate signal
    pub fn candidate(session_id: impl Into<String>, candidate: IceCandidate) -> Self {
        Message::Signal {
            session_id: session_id.into(),
            signal: Signal::Candidate(candidate),
        }
    }

    /// Create a failure notification
    pub fn failed(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Message::Failed {
            session_id: Some(session_id.into()),
            reason: Some(reason.into()),
        }
    }

    fn into_payload(self) -> Result<Payload, WebRTCError> {
        let mut payload = Payload::default();
        match self {
            Message::Activate(identity) => {
                if let Some(identity) = identity {
                    payload.channel_id = Some(identity.channel_id);
                    payload.channel_key = Some(identity.channel_key);
                    payload.client_id = Some(identity.client_id);
                }
            }
            Message::Push(d) | Message::Pull(d) => {
                payload.session_id = d.session_id;
                payload.sdp = Some(d.sdp);
            }
            Message::Fetch(n) | Message::Forward(n) => {
                payload.session_id = n.session_id;
                payload.sdp = n.sdp;
            }
            Message::Forwarding(id)
            | Message::Forwarded(id)
            | Message::Disconnected(id)
            | Message::Closed(id) => payload.session_id = Some(id),
            Message::Signal { session_id, signal } => {
                payload.session_id = Some(session_id);
                match signal {
                    Signal::Candidate(candidate) => {
                        let data = serde_json::to_string(&candidate).map_err(|e| {
                            WebRTCError::MalformedFrame(format!("Failed to serialize candidate: {}", e))
                        })?;
                        payload.signal_type = Some(SignalType::Candidate);
                        payload.signal_data = Some(data);
                    }
                    Signal::Answer(sdp) => {
                        payload.signal_type = Some(SignalType::Answer);
                        payload.signal_data = Some(sdp);
                    }
                }
            }
            Message::Failed { session_id, reason } => {
                payload.session_id = session_id;
                payload.reason = reason;
            }
            Message::Clear(session_id) => payload.session_id = session_id,
        }
        Ok(payload)
    }

    fn from_payload(kind: MessageType, payload: Payload) -> Result<Self, WebRTCError> {
        let Payload {
            session_id,
            sdp,
            signal_type,
            signal_data,
            channel_id,
            channel_key,
            client_id,
            reason,
        } = payload;

        let require_session = |session_id: Option<String>| {
            session_id
                .filter(|id| !id.is_empty())
                .ok_or_else(|| WebRTCError::MalformedFrame(format!("{} without sessionId", kind)))
        };

        let message = match kind {
            MessageType::Activate => {
                let identity = match (channel_id, client_id) {
                    (Some(channel_id), Some(client_id)) => Some(ChannelIdentity {
                        channel_id,
                        channel_key: channel_key.unwrap_or_default(),
                        client_id,
                    }),
                    _ => None,
                };
                Message::Activate(identity)
            }
            MessageType::Push | MessageType::Pull => {
                let sdp = sdp.ok_or_else(|| WebRTCError::MalformedFrame(format!("{} without sdp", kind)))?;
                let description = Description { session_id, sdp };
                if kind == MessageType::Push {
                    Message::Push(description)
                } else {
                    Message::Pull(description)
                }
            }
            MessageType::Fetch | MessageType::Forward => {
                if session_id.is_none() && sdp.is_none() {
                    return Err(WebRTCError::MalformedFrame(format!("{} without sessionId or sdp", kind)));
                }
                let negotiation = Negotiation { session_id, sdp };
                if kind == MessageType::Fetch {
                    Message::Fetch(negotiation)
                } else {
                    Message::Forward(negotiation)
                }
            }
            MessageType::Signal => {
                let session_id = require_session(session_id)?;
                let data = signal_data
                    .ok_or_else(|| WebRTCError::MalformedFrame("SIGNAL without signalData".to_string()))?;
                let signal = match signal_type {
                    Some(SignalType::Candidate) => {
                        let candidate: IceCandidate = serde_json::from_str(&data).map_err(|e| {
                            WebRTCError::MalformedFrame(format!("Invalid candidate data: {}", e))
                        })?;
                        Signal::Candidate(candidate)
                    }
                    Some(SignalType::Answer) => Signal::Answer(data),
                    None => {
                        return Err(WebRTCError::MalformedFrame("SIGNAL without signalType".to_string()))
                    }
                };
                Message::Signal { session_id, signal }
            }
            MessageType::Forwarding => Message::Forwarding(require_session(session_id)?),
            MessageType::Forwarded => Message::Forwarded(require_session(session_id)?),
            MessageType::Disconnected => Message::Disconnected(require_session(session_id)?),
            MessageType::Closed => Message::Closed(require_session(session_id)?),
            MessageType::Failed => Message::Failed { session_id, reason },
            MessageType::Clear => Message::Clear(session_id),
        };
        Ok(message)
    }
}

/// One decoded control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub request_id: Option<u64>,
    pub message: Message,
}

impl ControlFrame {
    /// Create a frame that expects a correlated reply
    pub fn request(request_id: u64, message: Message) -> Self {
        Self {
            request_id: Some(request_id),
            message,
        }
    }

    /// Create a frame that expects no reply
    pub fn notify(message: Message) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.message.kind()
    }

    /// Serialize to a JSON text frame
    pub fn encode(&self) -> Result<String, WebRTCError> {
        let envelope = Envelope {
            kind: self.message.kind(),
            request_id: self.request_id,
            payload: self.message.clone().into_payload()?,
        };
        serde_json::to_string(&envelope)
            .map_err(|e| WebRTCError::MalformedFrame(format!("Failed to serialize frame: {}", e)))
    }

    /// Parse a control frame from JSON text
    pub fn decode(text: &str) -> Result<Self, WebRTCError> {
        let envelope: Envelope = serde_json::from_str(text.trim())
            .map_err(|e| WebRTCError::MalformedFrame(format!("Invalid control frame: {}", e)))?;
        let message = Message::from_payload(envelope.kind, envelope.payload)?;
        Ok(Self {
            request_id: envelope.request_id,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_push_answer() {
        let text = r#"{"type": "PUSH", "payload": {"sessionId": "s1", "sdp": "v=0\r\n..."}}"#;
        let frame = ControlFrame::decode(text).unwrap();
        assert_eq!(frame.request_id, None);
        match frame.message {
            Message::Push(d) => {
                assert_eq!(d.session_id.as_deref(), Some("s1"));
                assert!(d.sdp.starts_with("v=0"));
            }
            other => panic!("Expected Push, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let text = r#"{"type": "CLASSIFIED", "payload": {}}"#;
        assert!(matches!(ControlFrame::decode(text), Err(WebRTCError::MalformedFrame(_))));
        assert!(matches!(ControlFrame::decode("not json"), Err(WebRTCError::MalformedFrame(_))));
    }

    #[test]
    fn test_exchange_alias_decodes_as_signal() {
        let text = r#"{"type": "EXCHANGE", "payload": {"sessionId": "s2", "signalType": "answer", "signalData": "v=0"}}"#;
        let frame = ControlFrame::decode(text).unwrap();
        assert_eq!(frame.kind(), MessageType::Signal);
        assert_eq!(frame.message, Message::answer("s2", "v=0"));
    }

    #[test]
    fn test_signal_requires_session_id() {
        let text = r#"{"type": "SIGNAL", "payload": {"signalType": "answer", "signalData": "v=0"}}"#;
        assert!(matches!(ControlFrame::decode(text), Err(WebRTCError::MalformedFrame(_))));
    }

    #[test]
    fn test_candidate_travels_as_json_text() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        let frame = ControlFrame::notify(Message::candidate("s3", candidate.clone()));
        let json = frame.encode().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "SIGNAL");
        assert_eq!(value["payload"]["signalType"], "candidate");
        assert!(value["payload"]["signalData"].as_str().unwrap().contains("sdpMLineIndex"));
        assert!(value.get("requestId").is_none());

        let decoded = ControlFrame::decode(&json).unwrap();
        assert_eq!(decoded.message, Message::candidate("s3", candidate));
    }

    #[test]
    fn test_activate_request_carries_identity() {
        let identity = ChannelIdentity {
            channel_id: "c1".to_string(),
            channel_key: "k1".to_string(),
            client_id: "u1".to_string(),
        };
        let json = ControlFrame::request(7, Message::Activate(Some(identity))).encode().unwrap();
        assert!(json.contains(r#""requestId":7"#));
        assert!(json.contains(r#""channelId":"c1""#));
        assert!(json.contains(r#""channelKey":"k1""#));
        assert!(json.contains(r#""clientId":"u1""#));

        let ack = ControlFrame::decode(r#"{"type": "ACTIVATE", "requestId": 7}"#).unwrap();
        assert_eq!(ack, ControlFrame::request(7, Message::Activate(None)));
    }

    #[test]
    fn test_fetch_needs_session_or_sdp() {
        let empty = r#"{"type": "FETCH", "payload": {}}"#;
        assert!(ControlFrame::decode(empty).is_err());

        let fetch = ControlFrame::decode(r#"{"type": "FETCH", "payload": {"sessionId": "s2"}}"#).unwrap();
        assert_eq!(
            fetch.message,
            Message::Fetch(Negotiation { session_id: Some("s2".to_string()), sdp: None })
        );
    }

    #[test]
    fn test_clear_without_session_clears_all() {
        let frame = ControlFrame::decode(r#"{"type": "CLEAR"}"#).unwrap();
        assert_eq!(frame.message, Message::Clear(None));
        assert_eq!(frame.message.session_id(), None);
    }
}
