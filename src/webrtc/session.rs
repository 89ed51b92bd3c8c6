//! Transport session state machine
//!
//! A [`TransportSession`] wraps one media transport negotiation (a push,
//! pull, fetch or forward leg). It owns the description state and the queue
//! of remote candidates that arrive before the session may apply them.
//!
//! ```text
//! NEW -> OFFERING -> AWAITING_REMOTE -> CONNECTING -> CONNECTED
//!                                            |            |
//!                                            +--> FAILED <+--> CLOSED
//! ```

use super::media_track::{MediaStream, TrackKind};
use super::media_transport::{ConnectivityState, MediaTransport, SdpKind};
use super::signaling::{IceCandidate, MessageType};
use super::WebRTCError;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use tokio::sync::watch;

/// Purpose of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Send local media to the relay
    Push,
    /// Receive relay media
    Pull,
    /// Receive media sourced across relay hops
    Fetch,
    /// Re-send previously received media
    Forward,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Push => "push",
            SessionRole::Pull => "pull",
            SessionRole::Fetch => "fetch",
            SessionRole::Forward => "forward",
        }
    }

    /// Roles whose transport carries media towards us
    pub fn receives_media(&self) -> bool {
        matches!(self, SessionRole::Pull | SessionRole::Fetch)
    }

    /// Control message type that opens this role
    pub fn message_type(&self) -> MessageType {
        match self {
            SessionRole::Push => MessageType::Push,
            SessionRole::Pull => MessageType::Pull,
            SessionRole::Fetch => MessageType::Fetch,
            SessionRole::Forward => MessageType::Forward,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing generated yet
    New,
    /// Local description being generated
    Offering,
    /// Local description sent, remote one outstanding
    AwaitingRemote,
    /// Both descriptions applied, ICE in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Negotiation or connectivity failed (no automatic retry)
    Failed,
    /// Closed by transport, relay or shutdown
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// Remote candidates are held back until the session is connecting
    fn queues_candidates(&self) -> bool {
        matches!(
            self,
            SessionState::New | SessionState::Offering | SessionState::AwaitingRemote
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (New, Offering) => true,
            (Offering, AwaitingRemote) => true,
            (AwaitingRemote, Connecting) => true,
            (Connecting, Connected) => true,
            (from, Failed) | (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Input delivered to a session by the dispatcher, in relay order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Answer to our offer
    RemoteAnswer(String),
    Candidate(IceCandidate),
    /// Relay closed or cleared the session
    Close,
    /// Relay reported the session failed
    Fail(Option<String>),
}

/// Description applied on one side of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A single negotiated media transport
pub struct TransportSession {
    id: String,
    role: SessionRole,
    state: SessionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    transport: Box<dyn MediaTransport>,
    state_tx: watch::Sender<SessionState>,
    created_at: Instant,
}

impl TransportSession {
    /// Create a new session; state changes are published on `state_tx`
    pub fn new(
        id: String,
        role: SessionRole,
        transport: Box<dyn MediaTransport>,
        state_tx: watch::Sender<SessionState>,
    ) -> Self {
        state_tx.send_replace(SessionState::New);
        Self {
            id,
            role,
            state: SessionState::New,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            transport,
            state_tx,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn set_state(&mut self, next: SessionState) -> Result<(), WebRTCError> {
        if !self.state.can_transition_to(next) {
            return Err(WebRTCError::InvalidState(format!(
                "session {}: {:?} -> {:?}",
                self.id, self.state, next
            )));
        }
        debug!("Session {} state change: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// Attach every track of `stream` to the transport for sending
    pub async fn attach_media(&mut self, stream: MediaStream) -> Result<(), WebRTCError> {
        if self.state != SessionState::New {
            return Err(WebRTCError::InvalidState(format!(
                "session {}: media must be attached before negotiation",
                self.id
            )));
        }
        for track in stream.tracks() {
            self.transport.add_track(track).await?;
        }
        debug!("Session {} attached {} track(s)", self.id, stream.len());
        Ok(())
    }

    /// Generate and commit a local offer; `receive` declares receive-only media
    pub async fn create_offer(&mut self, receive: &[TrackKind]) -> Result<String, WebRTCError> {
        self.set_state(SessionState::Offering)?;
        for kind in receive {
            self.transport.add_receiver(*kind).await?;
        }
        let sdp = self.transport.create_offer().await?;
        self.transport.set_local_description(SdpKind::Offer, &sdp).await?;
        self.local_description = Some(SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.clone(),
        });
        self.set_state(SessionState::AwaitingRemote)?;
        Ok(sdp)
    }

    /// Apply a relay offer, then generate and commit the answer
    ///
    /// The session ends in `AwaitingRemote` with the remote description
    /// already present; call [`enter_connecting`](Self::enter_connecting)
    /// once the answer has been sent.
    pub async fn create_answer(&mut self, offer: &str) -> Result<String, WebRTCError> {
        self.set_state(SessionState::Offering)?;
        self.transport
            .set_remote_description(SdpKind::Offer, offer)
            .await
            .map_err(WebRTCError::into_negotiation_failure)?;
        self.remote_description = Some(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.to_string(),
        });
        let sdp = self.transport.create_answer().await?;
        self.transport.set_local_description(SdpKind::Answer, &sdp).await?;
        self.local_description = Some(SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.clone(),
        });
        self.set_state(SessionState::AwaitingRemote)?;
        Ok(sdp)
    }

    /// Local description with all gathered candidates, for exchanges that
    /// cannot trickle
    pub async fn gathered_local_description(&self) -> Result<String, WebRTCError> {
        if self.local_description.is_none() {
            return Err(WebRTCError::InvalidState(format!(
                "session {}: no local description",
                self.id
            )));
        }
        self.transport.gathered_local_description().await
    }

    /// Apply the relay's answer to our offer
    ///
    /// Returns `Ok(false)` if a remote description was already set in this
    /// round; the duplicate is ignored.
    pub async fn apply_remote_answer(&mut self, sdp: &str) -> Result<bool, WebRTCError> {
        if self.remote_description.is_some() {
            warn!("Session {} already has a remote description, ignoring answer", self.id);
            return Ok(false);
        }
        if self.state != SessionState::AwaitingRemote {
            return Err(WebRTCError::InvalidState(format!(
                "session {}: answer received in state {:?}",
                self.id, self.state
            )));
        }
        self.transport
            .set_remote_description(SdpKind::Answer, sdp)
            .await
            .map_err(WebRTCError::into_negotiation_failure)?;
        self.remote_description = Some(SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.to_string(),
        });
        self.enter_connecting().await?;
        Ok(true)
    }

    /// Move to `Connecting` and flush queued candidates in arrival order
    pub async fn enter_connecting(&mut self) -> Result<usize, WebRTCError> {
        if self.remote_description.is_none() {
            return Err(WebRTCError::InvalidState(format!(
                "session {}: no remote description",
                self.id
            )));
        }
        self.set_state(SessionState::Connecting)?;
        self.flush_candidates().await
    }

    /// Queue or apply a remote candidate
    ///
    /// Returns `Ok(true)` when applied immediately, `Ok(false)` when queued.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<bool, WebRTCError> {
        if self.state.queues_candidates() {
            self.pending_candidates.push_back(candidate);
            debug!(
                "Session {} queued candidate ({} pending)",
                self.id,
                self.pending_candidates.len()
            );
            return Ok(false);
        }
        if self.state.is_terminal() {
            return Err(WebRTCError::InvalidState(format!(
                "session {}: candidate after {:?}",
                self.id, self.state
            )));
        }
        self.transport
            .add_candidate(&candidate)
            .await
            .map_err(WebRTCError::into_negotiation_failure)?;
        Ok(true)
    }

    async fn flush_candidates(&mut self) -> Result<usize, WebRTCError> {
        let mut applied = 0;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.transport
                .add_candidate(&candidate)
                .await
                .map_err(WebRTCError::into_negotiation_failure)?;
            applied += 1;
        }
        if applied > 0 {
            debug!("Session {} flushed {} queued candidate(s)", self.id, applied);
        }
        Ok(applied)
    }

    /// Fold a transport connectivity report into the session state
    ///
    /// Returns the new state when the report caused a transition.
    pub fn on_connectivity(&mut self, report: ConnectivityState) -> Option<SessionState> {
        let next = match (self.state, report) {
            (SessionState::Connecting, ConnectivityState::Connected) => SessionState::Connected,
            (SessionState::Connecting | SessionState::Connected, ConnectivityState::Failed) => {
                SessionState::Failed
            }
            (
                SessionState::Connected,
                ConnectivityState::Disconnected | ConnectivityState::Closed,
            ) => SessionState::Closed,
            (SessionState::Connecting, ConnectivityState::Closed) => SessionState::Failed,
            (state, report) => {
                debug!("Session {} ignoring {:?} while {:?}", self.id, report, state);
                return None;
            }
        };
        self.set_state(next).ok().map(|_| next)
    }

    /// Force a terminal state and release the transport
    pub async fn close(&mut self, terminal: SessionState) {
        debug_assert!(terminal.is_terminal());
        if !self.state.is_terminal() {
            let _ = self.set_state(terminal);
        }
        if !self.pending_candidates.is_empty() {
            debug!(
                "Session {} dropping {} unapplied candidate(s)",
                self.id,
                self.pending_candidates.len()
            );
            self.pending_candidates.clear();
        }
        if let Err(e) = self.transport.close().await {
            warn!("Session {} transport close failed: {}", self.id, e);
        }
        info!(
            "Session {} ({}) closed as {:?} after {:?}",
            self.id,
            self.role,
            self.state,
            self.created_at.elapsed()
        );
    }
}
