//! One-shot HTTP bootstrap against the relay
//!
//! Before a control channel exists a client can still publish or view a
//! channel with a single `POST {base}/broadcast` or `POST {base}/view`. The
//! offer carries every gathered candidate and the response body is the
//! relay's SDP answer in plain text; nothing trickles.

use crate::webrtc::media_transport::{MediaTransportFactory, TransportEvent};
use crate::webrtc::registry::generate_session_id;
use crate::webrtc::{MediaStream, SessionRole, SessionState, TrackKind, TransportSession, WebRTCError};
use log::{debug, info};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

/// Header carrying the channel secret
const CHANNEL_KEY_HEADER: &str = "channel-key";

/// Which bootstrap endpoint to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapRole {
    /// Publish local media (`/broadcast`)
    Broadcast,
    /// Receive the channel's media (`/view`)
    View,
}

impl BootstrapRole {
    fn path(&self) -> &'static str {
        match self {
            BootstrapRole::Broadcast => "broadcast",
            BootstrapRole::View => "view",
        }
    }

    fn session_role(&self) -> SessionRole {
        match self {
            BootstrapRole::Broadcast => SessionRole::Push,
            BootstrapRole::View => SessionRole::Pull,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct BootstrapRequest<'a> {
    user_id: &'a str,
    sdp: &'a str,
    channel_id: &'a str,
}

/// Session opened over HTTP; the caller drives it from `events`
pub struct BootstrapSession {
    pub session: TransportSession,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[derive(Clone)]
pub struct HttpBootstrap {
    http: Client,
    base_url: String,
    channel_id: String,
    channel_key: String,
    user_id: String,
}

impl HttpBootstrap {
    pub fn new(
        base_url: impl Into<String>,
        channel_id: impl Into<String>,
        channel_key: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            channel_id: channel_id.into(),
            channel_key: channel_key.into(),
            user_id: user_id.into(),
        }
    }

    fn endpoint(&self, role: BootstrapRole) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), role.path())
    }

    fn request<'a>(&'a self, sdp: &'a str) -> BootstrapRequest<'a> {
        BootstrapRequest {
            user_id: &self.user_id,
            sdp,
            channel_id: &self.channel_id,
        }
    }

    /// POST an offer and return the SDP answer
    pub async fn exchange(&self, role: BootstrapRole, offer: &str) -> Result<String, WebRTCError> {
        let url = self.endpoint(role);
        debug!("POST {} ({} byte offer)", url, offer.len());
        let res = self
            .http
            .post(&url)
            .header(CHANNEL_KEY_HEADER, &self.channel_key)
            .json(&self.request(offer))
            .send()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("POST {} failed: {}", url, e)))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to read {} response: {}", url, e)))?;
        if !status.is_success() {
            return Err(WebRTCError::ConnectionFailed(format!(
                "POST {} returned {}: {}",
                url,
                status,
                body.trim()
            )));
        }
        if body.trim().is_empty() {
            return Err(WebRTCError::SdpError(format!("POST {} returned an empty answer", url)));
        }
        Ok(body)
    }

    /// Negotiate a complete session through the bootstrap endpoint
    ///
    /// `media` is required for [`BootstrapRole::Broadcast`]; `receive` lists
    /// the kinds requested by [`BootstrapRole::View`].
    pub async fn open(
        &self,
        role: BootstrapRole,
        factory: &dyn MediaTransportFactory,
        media: Option<MediaStream>,
        receive: &[TrackKind],
    ) -> Result<BootstrapSession, WebRTCError> {
        let media = match (role, media) {
            (BootstrapRole::Broadcast, Some(stream)) if !stream.is_empty() => Some(stream),
            (BootstrapRole::Broadcast, _) => {
                return Err(WebRTCError::MediaError("broadcast needs at least one local track".to_string()))
            }
            (BootstrapRole::View, _) => None,
        };

        let id = generate_session_id();
        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = factory.create(&id, events_tx).await?;
        let (state_tx, _) = watch::channel(SessionState::New);
        let mut session = TransportSession::new(id, role.session_role(), transport, state_tx);

        match self.negotiate(role, &mut session, media, receive).await {
            Ok(()) => {
                info!("Bootstrap {} session {} connecting", role.path(), session.id());
                Ok(BootstrapSession { session, events })
            }
            Err(e) => {
                session.close(SessionState::Failed).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        role: BootstrapRole,
        session: &mut TransportSession,
        media: Option<MediaStream>,
        receive: &[TrackKind],
    ) -> Result<(), WebRTCError> {
        if let Some(stream) = media {
            session.attach_media(stream).await?;
        }
        let receive = match role {
            BootstrapRole::Broadcast => &[][..],
            BootstrapRole::View => receive,
        };
        session.create_offer(receive).await?;
        let offer = session.gathered_local_description().await?;
        let answer = self.exchange(role, &offer).await?;
        session.apply_remote_answer(&answer).await?;
        Ok(())
    }
}
