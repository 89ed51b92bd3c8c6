//! WebRTC PeerConnection transport
//!
//! Implements [`MediaTransport`] on top of webrtc-rs. Every session gets its
//! own `RTCPeerConnection`; ICE candidates, remote tracks and connection
//! state changes are forwarded to the session driver as [`TransportEvent`]s.

use super::media_track::{MediaTrack, TrackKind};
use super::media_transport::{ConnectivityState, MediaTransport, MediaTransportFactory, SdpKind, TransportEvent};
use super::signaling::IceCandidate;
use super::WebRTCError;
use crate::config::{VideoCodec, WebRTCConfig};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

/// Upper bound on waiting for ICE gathering in non-trickle exchanges
const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates one webrtc-rs peer connection per session
pub struct WebRtcTransportFactory {
    config: WebRTCConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut setting_engine = SettingEngine::default();
        if let Some([min, max]) = self.config.udp_port_range {
            let ephemeral = EphemeralUDP::new(min, max)
                .map_err(|e| WebRTCError::ConnectionFailed(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Interceptors for RTCP feedback (NACK, reports)
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: build_ice_servers(&self.config),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl MediaTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn MediaTransport>, WebRTCError> {
        let peer_connection = self.create_peer_connection().await?;
        let transport = WebRtcTransport {
            session_id: session_id.to_string(),
            peer_connection,
            tasks: Mutex::new(Vec::new()),
        };
        transport.setup_callbacks(events);
        debug!("Session {} peer connection created", session_id);
        Ok(Box::new(transport))
    }
}

/// One peer connection driven through [`MediaTransport`]
pub struct WebRtcTransport {
    session_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Outbound track pumps, aborted on close
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcTransport {
    fn setup_callbacks(&self, events: mpsc::UnboundedSender<TransportEvent>) {
        let session_id = self.session_id.clone();
        let tx = events.clone();
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    debug!("Session {} ICE gathering complete", session_id);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::Candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Session {} failed to serialize candidate: {}", session_id, e),
                }
            })
        }));

        let session_id = self.session_id.clone();
        let tx = events.clone();
        self.peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                info!("Session {} peer connection state: {}", session_id, state);
                let _ = tx.send(TransportEvent::Connectivity(connectivity_from(state)));
            })
        }));

        let session_id = self.session_id.clone();
        self.peer_connection.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let tx = events.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                let track = received_track(&remote);
                info!(
                    "Session {} remote {} track {} ({})",
                    session_id,
                    track.kind(),
                    track.id(),
                    track.mime_type()
                );
                tokio::spawn(read_remote_track(session_id, remote, track.clone()));
                let _ = tx.send(TransportEvent::Track(track));
            })
        }));
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), WebRTCError> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            capability_for(track.kind(), track.mime_type()),
            track.id().to_string(),
            track.stream_id().to_string(),
        ));
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add track {}: {}", track.id(), e)))?;

        // Drain RTCP so interceptors keep working
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        let pump = tokio::spawn(pump_local_track(self.session_id.clone(), track.subscribe(), local));
        self.tasks.lock().extend([rtcp, pump]);
        Ok(())
    }

    async fn add_receiver(&self, kind: TrackKind) -> Result<(), WebRTCError> {
        let codec_type = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        self.peer_connection
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} transceiver: {}", kind, e)))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WebRTCError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, WebRTCError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WebRTCError> {
        let description = session_description(kind, sdp)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WebRTCError> {
        let description = session_description(kind, sdp)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn gathered_local_description(&self) -> Result<String, WebRTCError> {
        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        if timeout(GATHER_TIMEOUT, gathering_complete.recv()).await.is_err() {
            warn!("Session {}: ICE gathering did not complete in {:?}", self.session_id, GATHER_TIMEOUT);
        }
        self.peer_connection
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| WebRTCError::InvalidState(format!("session {}: no local description", self.session_id)))
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.peer_connection
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}

fn session_description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, WebRTCError> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP offer: {}", e))),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP answer: {}", e))),
    }
}

fn connectivity_from(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

/// Codec capability for a local track
fn capability_for(kind: TrackKind, mime_type: &str) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: if mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
                "minptime=10;useinbandfec=1".to_string()
            } else {
                String::new()
            },
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: VideoCodec::from_mime_type(mime_type)
                .map(|codec| codec.fmtp().to_string())
                .unwrap_or_default(),
            rtcp_feedback: vec![],
        },
    }
}

fn build_ice_servers(config: &WebRTCConfig) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn received_track(remote: &TrackRemote) -> MediaTrack {
    let kind = match remote.kind() {
        RTPCodecType::Audio => TrackKind::Audio,
        _ => TrackKind::Video,
    };
    MediaTrack::new(
        remote.id(),
        remote.stream_id(),
        kind,
        remote.codec().capability.mime_type,
    )
}

/// Publish every RTP packet of a remote track until the connection ends
async fn read_remote_track(session_id: String, remote: Arc<TrackRemote>, track: MediaTrack) {
    let mut packets: u64 = 0;
    loop {
        let packet = match remote.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!("Session {} track {} ended: {}", session_id, track.id(), e);
                break;
            }
        };
        match packet.marshal() {
            Ok(raw) => {
                packets += 1;
                track.publish(raw);
            }
            Err(e) => debug!("Session {} failed to re-marshal RTP: {}", session_id, e),
        }
    }
    info!("Session {} track {} relayed {} packets", session_id, track.id(), packets);
}

/// Write packets published on a local track into the peer connection
async fn pump_local_track(
    session_id: String,
    mut packets: broadcast::Receiver<Bytes>,
    local: Arc<TrackLocalStaticRTP>,
) {
    let mut forwarded: u64 = 0;
    loop {
        match packets.recv().await {
            Ok(packet) => {
                if let Err(e) = local.write(&packet).await {
                    debug!("Session {} RTP write failed: {}", session_id, e);
                    continue;
                }
                forwarded += 1;
                if forwarded == 1 || forwarded % 2000 == 0 {
                    debug!("Session {} sent RTP #{}: {} bytes", session_id, forwarded, packet.len());
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Session {} RTP receiver lagged by {} packets", session_id, n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServerConfig;

    #[test]
    fn test_connectivity_mapping() {
        assert_eq!(connectivity_from(RTCPeerConnectionState::Connected), ConnectivityState::Connected);
        assert_eq!(connectivity_from(RTCPeerConnectionState::Disconnected), ConnectivityState::Disconnected);
        assert_eq!(connectivity_from(RTCPeerConnectionState::Unspecified), ConnectivityState::New);
    }

    #[test]
    fn test_ice_servers_from_config() {
        let config = WebRTCConfig {
            ice_servers: vec![IceServerConfig {
                urls: vec!["turn:turn.example:3478?transport=udp".to_string()],
                username: Some("user".to_string()),
                credential: Some("secret".to_string()),
            }],
            ..WebRTCConfig::default()
        };
        let servers = build_ice_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential, "secret");

        let defaults = build_ice_servers(&WebRTCConfig::default());
        assert_eq!(defaults[0].urls, vec!["stun:stun1.l.google.com:19302".to_string()]);
        assert!(defaults[0].username.is_empty());
    }

    #[test]
    fn test_capability_for_video_codecs() {
        let h264 = capability_for(TrackKind::Video, "video/H264");
        assert_eq!(h264.clock_rate, 90000);
        assert!(h264.sdp_fmtp_line.contains("packetization-mode=1"));

        let opus = capability_for(TrackKind::Audio, MIME_TYPE_OPUS);
        assert_eq!((opus.clock_rate, opus.channels), (48000, 2));
    }
}
