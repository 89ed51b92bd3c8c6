//! Signaling session manager
//!
//! Owns the control link, the session registry and the pending-request
//! table. Inbound frames are dispatched one at a time in arrival order; each
//! session runs in its own driver task fed by an ordered input queue, so a
//! negotiation waiting on its transport never stalls its siblings.
//!
//! Lock order is activation before correlator. No lock is held across an
//! await point.

use super::correlator::RequestCorrelator;
use super::media_track::{MediaStream, MediaTrack, TrackKind};
use super::media_transport::{MediaTransportFactory, TransportEvent};
use super::registry::{SessionHandle, SessionRegistry};
use super::session::{SessionInput, SessionRole, SessionState, TransportSession};
use super::signaling::{ChannelIdentity, ControlFrame, Description, Message, MessageType, Negotiation, Signal};
use super::WebRTCError;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::transport::link::{ControlLink, LinkEvent};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Buffered manager events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long shutdown waits for each session to reach a terminal state
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Session manager tuning
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub activation_timeout: Duration,
    /// Bound on AWAITING_REMOTE
    pub answer_timeout: Duration,
    /// Bound on CONNECTING
    pub connect_timeout: Duration,
    /// Wait for the relay to acknowledge ACTIVATE before reporting activation
    pub await_activation_reply: bool,
    /// Media kinds requested by pull and offering fetch sessions
    pub receive: Vec<TrackKind>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(10),
            answer_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(20),
            await_activation_reply: true,
            receive: vec![TrackKind::Video],
        }
    }
}

impl SessionManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        let mut receive = Vec::new();
        if config.webrtc.receive_video {
            receive.push(TrackKind::Video);
        }
        if config.webrtc.receive_audio {
            receive.push(TrackKind::Audio);
        }
        Self {
            activation_timeout: Duration::from_millis(config.signaling.activation_timeout_ms),
            answer_timeout: Duration::from_millis(config.signaling.answer_timeout_ms),
            connect_timeout: Duration::from_millis(config.signaling.connect_timeout_ms),
            await_activation_reply: config.signaling.await_activation_reply,
            receive,
        }
    }
}

/// Notification published to manager subscribers
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Channel activation acknowledged (reported once)
    Activated,
    StateChanged {
        session_id: String,
        role: SessionRole,
        state: SessionState,
    },
    /// Remote media arrived on a pull or fetch session
    ///
    /// `relayed` tracks are republished on the earlier track of the same
    /// kind, which already delivered a `StreamReceived`.
    StreamReceived {
        session_id: String,
        track: MediaTrack,
        relayed: bool,
    },
    Forwarding(String),
    Forwarded(String),
    /// Relay reported a failure
    RelayFailure {
        session_id: Option<String>,
        reason: Option<String>,
    },
    /// A closed pull was replaced by a fresh one
    PullRestarted { previous: String, session_id: String },
    /// Control channel gone, every session closed
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Idle,
    /// Request id when a reply is awaited
    Pending(Option<u64>),
    Active,
}

/// How a session begins negotiating
enum Start {
    Offer { media: Option<MediaStream> },
    Answer { offer: String, media: Option<MediaStream> },
}

/// Outstanding correlated request of one session
struct PendingReply {
    request_id: u64,
    rx: oneshot::Receiver<ControlFrame>,
}

/// Why a session driver stopped
struct Ending {
    state: SessionState,
    reason: Option<String>,
    /// Tell the relay how the session ended
    report: bool,
    /// Re-initiate if the session was a pull
    restart: bool,
}

impl Ending {
    fn failed(error: WebRTCError) -> Self {
        Self {
            state: SessionState::Failed,
            reason: Some(error.to_string()),
            report: true,
            restart: false,
        }
    }

    /// The relay already knows
    fn quiet(state: SessionState, reason: Option<String>) -> Self {
        Self {
            state,
            reason,
            report: false,
            restart: false,
        }
    }

    fn transport_closed() -> Self {
        Self {
            state: SessionState::Closed,
            reason: None,
            report: true,
            restart: true,
        }
    }
}

struct Inner {
    identity: ChannelIdentity,
    config: SessionManagerConfig,
    link: ControlLink,
    factory: Arc<dyn MediaTransportFactory>,
    registry: Mutex<SessionRegistry>,
    correlator: Mutex<RequestCorrelator>,
    activation: Mutex<Activation>,
    /// Media received on pull/fetch sessions, source of every forward
    received: RwLock<Option<MediaStream>>,
    events: broadcast::Sender<ManagerEvent>,
    shutting_down: AtomicBool,
    metrics: Arc<Metrics>,
}

/// Multiplexes every session of one channel over one control link
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        identity: ChannelIdentity,
        config: SessionManagerConfig,
        link: ControlLink,
        factory: Arc<dyn MediaTransportFactory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                identity,
                config,
                link,
                factory,
                registry: Mutex::new(SessionRegistry::new()),
                correlator: Mutex::new(RequestCorrelator::new()),
                activation: Mutex::new(Activation::Idle),
                received: RwLock::new(None),
                events,
                shutting_down: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn is_activated(&self) -> bool {
        *self.inner.activation.lock() == Activation::Active
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Present the channel identity to the relay
    pub async fn activate(&self) -> Result<(), WebRTCError> {
        let message = Message::Activate(Some(self.inner.identity.clone()));

        if !self.inner.config.await_activation_reply {
            {
                let mut activation = self.inner.activation.lock();
                if *activation != Activation::Idle {
                    return Err(WebRTCError::AlreadyActivated);
                }
                *activation = Activation::Pending(None);
            }
            if let Err(e) = self.notify(message) {
                self.reset_activation();
                return Err(e);
            }
            self.mark_activated();
            return Ok(());
        }

        let (request_id, reply) = {
            let mut activation = self.inner.activation.lock();
            if *activation != Activation::Idle {
                return Err(WebRTCError::AlreadyActivated);
            }
            let (request_id, reply) = self.inner.correlator.lock().register(MessageType::Activate);
            *activation = Activation::Pending(Some(request_id));
            (request_id, reply)
        };

        if let Err(e) = self.send_frame(ControlFrame::request(request_id, message)) {
            self.inner.correlator.lock().forget(request_id);
            self.reset_activation();
            return Err(e);
        }
        info!("Activating channel {} as {}", self.inner.identity.channel_id, self.inner.identity.client_id);

        match tokio::time::timeout(self.inner.config.activation_timeout, reply).await {
            Ok(Ok(frame)) => match frame.message {
                Message::Failed { reason, .. } => {
                    self.reset_activation();
                    Err(WebRTCError::ConnectionFailed(
                        reason.unwrap_or_else(|| "activation rejected".to_string()),
                    ))
                }
                _ => {
                    self.mark_activated();
                    Ok(())
                }
            },
            Ok(Err(_)) => {
                self.reset_activation();
                Err(WebRTCError::ControlChannelLoss("activation request dropped".to_string()))
            }
            Err(_) => {
                self.inner.correlator.lock().forget(request_id);
                self.reset_activation();
                Err(WebRTCError::Timeout(format!(
                    "no ACTIVATE reply within {:?}",
                    self.inner.config.activation_timeout
                )))
            }
        }
    }

    fn reset_activation(&self) {
        let mut activation = self.inner.activation.lock();
        if *activation != Activation::Active {
            *activation = Activation::Idle;
        }
    }

    fn mark_activated(&self) {
        let first = {
            let mut activation = self.inner.activation.lock();
            let first = *activation != Activation::Active;
            *activation = Activation::Active;
            first
        };
        if first {
            info!("Channel {} activated", self.inner.identity.channel_id);
            self.emit(ManagerEvent::Activated);
        }
    }

    fn ensure_ready(&self) -> Result<(), WebRTCError> {
        if self.is_shutting_down() {
            return Err(WebRTCError::ControlChannelLoss("manager shut down".to_string()));
        }
        if !self.is_activated() {
            return Err(WebRTCError::NotActivated);
        }
        Ok(())
    }

    /// Send local media to the relay; returns the new session id
    pub fn push(&self, stream: MediaStream) -> Result<String, WebRTCError> {
        self.ensure_ready()?;
        if stream.is_empty() {
            return Err(WebRTCError::MediaError("no tracks to push".to_string()));
        }
        self.spawn_session(SessionRole::Push, None, Start::Offer { media: Some(stream) })
    }

    /// Receive relay media; returns the new session id
    pub fn pull(&self) -> Result<String, WebRTCError> {
        self.ensure_ready()?;
        self.spawn_session(SessionRole::Pull, None, Start::Offer { media: None })
    }

    /// Re-send the received stream to the relay; returns the new session id
    pub fn forward(&self) -> Result<String, WebRTCError> {
        self.ensure_ready()?;
        let media = self.received_stream().ok_or(WebRTCError::MissingMediaStream)?;
        self.spawn_session(SessionRole::Forward, None, Start::Offer { media: Some(media) })
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.inner.registry.lock().get(session_id).map(SessionHandle::state)
    }

    pub fn watch_session(&self, session_id: &str) -> Option<watch::Receiver<SessionState>> {
        self.inner.registry.lock().get(session_id).map(SessionHandle::watch_state)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.registry.lock().ids()
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.correlator.lock().len()
    }

    /// Stream assembled from tracks received on pull and fetch sessions
    pub fn received_stream(&self) -> Option<MediaStream> {
        self.inner.received.read().clone().filter(|stream| !stream.is_empty())
    }

    /// Process inbound link events until the control connection closes
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<LinkEvent>) -> Result<(), WebRTCError> {
        let reason = loop {
            match inbound.recv().await {
                Some(LinkEvent::Message(text)) => self.handle_text(&text),
                Some(LinkEvent::Closed(reason)) => {
                    break reason.unwrap_or_else(|| "closed by relay".to_string());
                }
                None => break "link reader stopped".to_string(),
            }
        };

        if self.is_shutting_down() {
            debug!("Control channel closed after shutdown: {}", reason);
            return Ok(());
        }
        warn!("Control channel lost: {}", reason);
        self.shutdown().await;
        Err(WebRTCError::ControlChannelLoss(reason))
    }

    /// Close every session and drop every pending request
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = {
            let mut registry = self.inner.registry.lock();
            let sessions = registry.drain();
            self.inner.metrics.active_sessions.set(0);
            sessions
        };
        let dropped = self.inner.correlator.lock().clear();
        info!("Shutting down {} session(s), dropping {} pending request(s)", sessions.len(), dropped);

        let mut watchers = Vec::with_capacity(sessions.len());
        for (session_id, handle) in sessions {
            handle.send(SessionInput::Close);
            watchers.push((session_id, handle.watch_state()));
        }
        for (session_id, mut state) in watchers {
            let closed = matches!(
                tokio::time::timeout(SHUTDOWN_GRACE, state.wait_for(|s| s.is_terminal())).await,
                Ok(Ok(_))
            );
            if !closed {
                warn!("Session {} did not close within {:?}", session_id, SHUTDOWN_GRACE);
            }
        }
        self.emit(ManagerEvent::ChannelClosed);
    }

    /// Decode and dispatch one inbound text frame
    pub fn handle_text(&self, text: &str) {
        let frame = match ControlFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding control frame: {}", e);
                self.inner.metrics.malformed_frames.inc();
                return;
            }
        };
        self.inner
            .metrics
            .frames_received
            .with_label_values(&[frame.kind().as_str()])
            .inc();
        self.dispatch(frame);
    }

    fn dispatch(&self, frame: ControlFrame) {
        if let Some(request_id) = frame.request_id {
            if self.inner.correlator.lock().resolve(request_id, frame.clone()) {
                return;
            }
            if frame.message.session_id().is_none() {
                debug!("Dropping {}: {}", frame.kind(), WebRTCError::UnresolvedRequest(request_id));
                return;
            }
        }

        match frame.message {
            Message::Activate(_) => self.on_activate_notice(),
            Message::Push(description) | Message::Pull(description) => match description.session_id {
                Some(session_id) => self.route(&session_id, SessionInput::RemoteAnswer(description.sdp)),
                None => debug!("Ignoring uncorrelated answer without sessionId"),
            },
            Message::Fetch(negotiation) => self.on_relay_negotiation(SessionRole::Fetch, negotiation),
            Message::Forward(negotiation) => self.on_relay_negotiation(SessionRole::Forward, negotiation),
            Message::Signal { session_id, signal } => {
                let input = match signal {
                    Signal::Candidate(candidate) => SessionInput::Candidate(candidate),
                    Signal::Answer(sdp) => SessionInput::RemoteAnswer(sdp),
                };
                self.route(&session_id, input);
            }
            Message::Forwarding(session_id) => {
                info!("Relay forwarding session {}", session_id);
                self.emit(ManagerEvent::Forwarding(session_id));
            }
            Message::Forwarded(session_id) => {
                info!("Relay forwarded session {}", session_id);
                self.emit(ManagerEvent::Forwarded(session_id));
            }
            Message::Failed { session_id, reason } => self.on_relay_failure(session_id, reason),
            Message::Disconnected(session_id) | Message::Closed(session_id) => {
                self.close_by_relay(&session_id, true)
            }
            Message::Clear(Some(session_id)) => self.close_by_relay(&session_id, false),
            Message::Clear(None) => self.clear_all(),
        }
    }

    fn on_activate_notice(&self) {
        let pending = match *self.inner.activation.lock() {
            Activation::Pending(Some(request_id)) => Some(request_id),
            _ => None,
        };
        match pending {
            Some(request_id) => {
                let ack = ControlFrame::request(request_id, Message::Activate(None));
                self.inner.correlator.lock().resolve(request_id, ack);
            }
            None => debug!("Ignoring unsolicited ACTIVATE"),
        }
    }

    fn on_relay_negotiation(&self, role: SessionRole, negotiation: Negotiation) {
        let Negotiation { session_id, sdp } = negotiation;
        let Some(session_id) = session_id else {
            warn!("Relay {} without sessionId ignored", role);
            return;
        };

        if self.inner.registry.lock().contains(&session_id) {
            match sdp {
                Some(sdp) => self.route(&session_id, SessionInput::RemoteAnswer(sdp)),
                None => warn!("Repeated {} for session {} ignored", role, session_id),
            }
            return;
        }

        let media = if role == SessionRole::Forward {
            match self.received_stream() {
                Some(media) => Some(media),
                None => {
                    warn!("Cannot forward session {}: {}", session_id, WebRTCError::MissingMediaStream);
                    let failed = Message::failed(session_id.as_str(), WebRTCError::MissingMediaStream.to_string());
                    if let Err(e) = self.notify(failed) {
                        warn!("Failed to report forward failure: {}", e);
                    }
                    return;
                }
            }
        } else {
            None
        };

        let start = match sdp {
            Some(offer) => Start::Answer { offer, media },
            None => Start::Offer { media },
        };
        if let Err(e) = self.spawn_session(role, Some(session_id), start) {
            warn!("Relay {} rejected: {}", role, e);
        }
    }

    fn on_relay_failure(&self, session_id: Option<String>, reason: Option<String>) {
        warn!(
            "Relay reported failure for {}: {}",
            session_id.as_deref().unwrap_or("<channel>"),
            reason.as_deref().unwrap_or("no reason given")
        );
        self.emit(ManagerEvent::RelayFailure {
            session_id: session_id.clone(),
            reason: reason.clone(),
        });
        let Some(session_id) = session_id else {
            return;
        };
        match self.take_session(&session_id) {
            Some(handle) => {
                handle.send(SessionInput::Fail(reason));
            }
            None => self.unknown_session(&session_id),
        }
    }

    fn close_by_relay(&self, session_id: &str, restart: bool) {
        let Some(handle) = self.take_session(session_id) else {
            self.unknown_session(session_id);
            return;
        };
        info!("Relay closed {} session {}", handle.role(), session_id);
        handle.send(SessionInput::Close);
        if restart && handle.role() == SessionRole::Pull && !self.is_shutting_down() {
            self.restart_pull(session_id);
        }
    }

    fn clear_all(&self) {
        let sessions = {
            let mut registry = self.inner.registry.lock();
            let sessions = registry.drain();
            self.inner.metrics.active_sessions.set(0);
            sessions
        };
        info!("Relay cleared {} session(s)", sessions.len());
        for (_, handle) in sessions {
            handle.send(SessionInput::Close);
        }
    }

    fn take_session(&self, session_id: &str) -> Option<SessionHandle> {
        let mut registry = self.inner.registry.lock();
        let handle = registry.remove(session_id);
        self.inner.metrics.active_sessions.set(registry.len() as i64);
        handle
    }

    fn route(&self, session_id: &str, input: SessionInput) {
        let handle = self.inner.registry.lock().get(session_id).cloned();
        match handle {
            Some(handle) => {
                if !handle.send(input) {
                    debug!("Session {} driver already finished", session_id);
                }
            }
            None => self.unknown_session(session_id),
        }
    }

    fn unknown_session(&self, session_id: &str) {
        warn!("{}", WebRTCError::UnknownSession(session_id.to_string()));
        self.inner.metrics.unknown_session_frames.inc();
    }

    fn restart_pull(&self, previous: &str) {
        match self.spawn_session(SessionRole::Pull, None, Start::Offer { media: None }) {
            Ok(session_id) => {
                info!("Re-initiated pull {} after {} closed", session_id, previous);
                self.inner.metrics.pull_restarts.inc();
                self.emit(ManagerEvent::PullRestarted {
                    previous: previous.to_string(),
                    session_id,
                });
            }
            Err(e) => error!("Failed to re-initiate pull after {}: {}", previous, e),
        }
    }

    /// Register the session now so later frames route to it, then drive it
    fn spawn_session(&self, role: SessionRole, session_id: Option<String>, start: Start) -> Result<String, WebRTCError> {
        let (handle, inputs, state_tx) = SessionHandle::channel(role);
        let token = handle.token();
        let session_id = {
            let mut registry = self.inner.registry.lock();
            // shutdown() raises the flag before draining under this lock
            if self.is_shutting_down() {
                return Err(WebRTCError::ControlChannelLoss("session manager shut down".to_string()));
            }
            let session_id = match session_id {
                Some(session_id) => {
                    registry.adopt(&session_id, handle)?;
                    session_id
                }
                None => registry.create(handle),
            };
            self.inner.metrics.active_sessions.set(registry.len() as i64);
            session_id
        };
        self.inner.metrics.sessions_opened.with_label_values(&[role.as_str()]).inc();
        info!("Starting {} session {}", role, session_id);

        let manager = self.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            manager.drive(id, role, token, start, inputs, state_tx).await;
        });
        Ok(session_id)
    }

    async fn drive(
        self,
        session_id: String,
        role: SessionRole,
        token: u64,
        start: Start,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
        state_tx: watch::Sender<SessionState>,
    ) {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let transport = match self.inner.factory.create(&session_id, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Session {} transport creation failed: {}", session_id, e);
                state_tx.send_replace(SessionState::Failed);
                self.emit(ManagerEvent::StateChanged {
                    session_id: session_id.clone(),
                    role,
                    state: SessionState::Failed,
                });
                self.release(&session_id, role, token, SessionState::Failed);
                if let Err(e) = self.notify(Message::failed(session_id.as_str(), e.to_string())) {
                    debug!("Could not report session {} failure: {}", session_id, e);
                }
                return;
            }
        };

        let mut session = TransportSession::new(session_id.clone(), role, transport, state_tx);
        let mut last_state = SessionState::New;
        let mut reply = None;

        let opened = tokio::time::timeout(
            self.inner.config.answer_timeout,
            self.open(&mut session, start, &mut reply),
        )
        .await;
        self.publish_state(&session, &mut last_state);

        let ending = match opened {
            Ok(Ok(())) => {
                self.run_session(&mut session, &mut inputs, &mut events, &mut reply, &mut last_state)
                    .await
            }
            Ok(Err(e)) => {
                warn!("Session {} negotiation failed: {}", session_id, e);
                Ending::failed(e)
            }
            Err(_) => Ending::failed(WebRTCError::Timeout(format!(
                "local description not ready within {:?}",
                self.inner.config.answer_timeout
            ))),
        };

        self.finish(session, token, reply, ending, &mut last_state).await;
    }

    /// Generate and send the local description
    async fn open(
        &self,
        session: &mut TransportSession,
        start: Start,
        reply: &mut Option<PendingReply>,
    ) -> Result<(), WebRTCError> {
        match start {
            Start::Offer { media } => {
                if let Some(media) = media {
                    session.attach_media(media).await?;
                }
                let receive: &[TrackKind] = if session.role().receives_media() {
                    &self.inner.config.receive
                } else {
                    &[]
                };
                let sdp = session.create_offer(receive).await?;
                let session_id = Some(session.id().to_string());
                match session.role() {
                    SessionRole::Push => {
                        *reply = Some(self.send_request(Message::Push(Description { session_id, sdp }))?);
                    }
                    SessionRole::Pull => {
                        *reply = Some(self.send_request(Message::Pull(Description { session_id, sdp }))?);
                    }
                    SessionRole::Forward => {
                        let negotiation = Negotiation {
                            session_id,
                            sdp: Some(sdp),
                        };
                        *reply = Some(self.send_request(Message::Forward(negotiation))?);
                    }
                    SessionRole::Fetch => {
                        self.notify(Message::Fetch(Negotiation {
                            session_id,
                            sdp: Some(sdp),
                        }))?;
                    }
                }
            }
            Start::Answer { offer, media } => {
                if let Some(media) = media {
                    session.attach_media(media).await?;
                }
                let sdp = session.create_answer(&offer).await?;
                self.notify(Message::answer(session.id(), sdp))?;
                session.enter_connecting().await?;
            }
        }
        Ok(())
    }

    async fn run_session(
        &self,
        session: &mut TransportSession,
        inputs: &mut mpsc::UnboundedReceiver<SessionInput>,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        reply: &mut Option<PendingReply>,
        last_state: &mut SessionState,
    ) -> Ending {
        let mut events_open = true;
        let mut phase = (session.state(), Instant::now());

        loop {
            self.publish_state(session, last_state);
            if session.state() != phase.0 {
                phase = (session.state(), Instant::now());
            }
            let limit = match phase.0 {
                SessionState::AwaitingRemote => Some(self.inner.config.answer_timeout),
                SessionState::Connecting => Some(self.inner.config.connect_timeout),
                _ => None,
            };
            let deadline = phase.1 + limit.unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SessionInput::RemoteAnswer(sdp)) => {
                        self.forget_reply(reply);
                        if let Err(e) = session.apply_remote_answer(&sdp).await {
                            warn!("Session {} rejected answer: {}", session.id(), e);
                            return Ending::failed(e);
                        }
                    }
                    Some(SessionInput::Candidate(candidate)) => {
                        if let Err(e) = session.add_remote_candidate(candidate).await {
                            warn!("Session {} rejected candidate: {}", session.id(), e);
                            return Ending::failed(e);
                        }
                    }
                    Some(SessionInput::Fail(reason)) => return Ending::quiet(SessionState::Failed, reason),
                    Some(SessionInput::Close) | None => return Ending::quiet(SessionState::Closed, None),
                },

                frame = next_reply(reply) => {
                    *reply = None;
                    let Some(frame) = frame else {
                        continue;
                    };
                    match frame.message {
                        Message::Failed { reason, .. } => return Ending::quiet(SessionState::Failed, reason),
                        message => match answer_sdp(message) {
                            Some(sdp) => {
                                if let Err(e) = session.apply_remote_answer(&sdp).await {
                                    warn!("Session {} rejected answer: {}", session.id(), e);
                                    return Ending::failed(e);
                                }
                            }
                            None => warn!("Session {} reply carried no answer", session.id()),
                        },
                    }
                }

                event = events.recv(), if events_open => match event {
                    Some(TransportEvent::Candidate(candidate)) => {
                        if let Err(e) = self.notify(Message::candidate(session.id(), candidate)) {
                            debug!("Session {} candidate not sent: {}", session.id(), e);
                        }
                    }
                    Some(TransportEvent::Track(track)) => {
                        info!("Session {} received {} track {}", session.id(), track.kind(), track.id());
                        let relayed = session.role().receives_media() && self.attach_received(track.clone());
                        self.emit(ManagerEvent::StreamReceived {
                            session_id: session.id().to_string(),
                            track,
                            relayed,
                        });
                    }
                    Some(TransportEvent::Connectivity(report)) => match session.on_connectivity(report) {
                        Some(SessionState::Failed) => {
                            return Ending::failed(WebRTCError::ConnectivityLoss(format!("transport {:?}", report)));
                        }
                        Some(SessionState::Closed) => return Ending::transport_closed(),
                        _ => {}
                    },
                    None => {
                        debug!("Session {} transport event channel closed", session.id());
                        events_open = false;
                    }
                },

                _ = tokio::time::sleep_until(deadline), if limit.is_some() => {
                    return Ending::failed(WebRTCError::Timeout(format!(
                        "{:?} longer than {:?}",
                        phase.0,
                        limit.unwrap_or_default()
                    )));
                }
            }
        }
    }

    async fn finish(
        &self,
        mut session: TransportSession,
        token: u64,
        reply: Option<PendingReply>,
        ending: Ending,
        last_state: &mut SessionState,
    ) {
        let session_id = session.id().to_string();
        let role = session.role();
        if let Some(pending) = reply {
            self.inner.correlator.lock().forget(pending.request_id);
        }
        let removed = self.release(&session_id, role, token, ending.state);

        session.close(ending.state).await;
        self.publish_state(&session, last_state);
        let state = session.state();

        if ending.report && !self.is_shutting_down() {
            let message = match state {
                SessionState::Failed => Message::failed(
                    session_id.as_str(),
                    ending.reason.unwrap_or_else(|| "session failed".to_string()),
                ),
                _ => Message::Closed(session_id.clone()),
            };
            if let Err(e) = self.notify(message) {
                debug!("Could not report session {} end: {}", session_id, e);
            }
        } else if let Some(reason) = ending.reason {
            debug!("Session {} ended: {}", session_id, reason);
        }

        if removed
            && ending.restart
            && role == SessionRole::Pull
            && state == SessionState::Closed
            && !self.is_shutting_down()
        {
            self.restart_pull(&session_id);
        }
    }

    /// Drop the registry entry if it still belongs to this driver
    fn release(&self, session_id: &str, role: SessionRole, token: u64, state: SessionState) -> bool {
        let removed = {
            let mut registry = self.inner.registry.lock();
            let removed = registry.remove_if_token(session_id, token).is_some();
            self.inner.metrics.active_sessions.set(registry.len() as i64);
            removed
        };
        if state == SessionState::Failed {
            self.inner.metrics.sessions_failed.with_label_values(&[role.as_str()]).inc();
        }
        removed
    }

    fn forget_reply(&self, reply: &mut Option<PendingReply>) {
        if let Some(pending) = reply.take() {
            self.inner.correlator.lock().forget(pending.request_id);
        }
    }

    /// Make a received track available to forward sessions
    ///
    /// A track of a kind already present is relayed into the existing one, so
    /// forwards keep flowing across pull re-initiations. Returns whether the
    /// track was relayed.
    fn attach_received(&self, track: MediaTrack) -> bool {
        let mut received = self.inner.received.write();
        let stream = received.get_or_insert_with(MediaStream::default);
        let existing = stream.tracks().iter().find(|t| t.kind() == track.kind()).cloned();
        match existing {
            Some(existing) if existing.id() == track.id() => false,
            Some(existing) => {
                debug!("Relaying {} track {} into {}", track.kind(), track.id(), existing.id());
                let mut packets = track.subscribe();
                tokio::spawn(async move {
                    loop {
                        match packets.recv().await {
                            Ok(packet) => {
                                existing.publish(packet);
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("Track relay into {} lagged by {} packets", existing.id(), n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                true
            }
            None => {
                stream.add_track(track);
                false
            }
        }
    }

    fn publish_state(&self, session: &TransportSession, last: &mut SessionState) {
        let state = session.state();
        if state != *last {
            *last = state;
            self.emit(ManagerEvent::StateChanged {
                session_id: session.id().to_string(),
                role: session.role(),
                state,
            });
        }
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn send_request(&self, message: Message) -> Result<PendingReply, WebRTCError> {
        let (request_id, rx) = self.inner.correlator.lock().register(message.kind());
        if let Err(e) = self.send_frame(ControlFrame::request(request_id, message)) {
            self.inner.correlator.lock().forget(request_id);
            return Err(e);
        }
        Ok(PendingReply { request_id, rx })
    }

    fn notify(&self, message: Message) -> Result<(), WebRTCError> {
        self.send_frame(ControlFrame::notify(message))
    }

    fn send_frame(&self, frame: ControlFrame) -> Result<(), WebRTCError> {
        let text = frame.encode()?;
        self.inner.link.send(text)?;
        self.inner
            .metrics
            .frames_sent
            .with_label_values(&[frame.kind().as_str()])
            .inc();
        Ok(())
    }
}

async fn next_reply(reply: &mut Option<PendingReply>) -> Option<ControlFrame> {
    match reply {
        Some(pending) => (&mut pending.rx).await.ok(),
        None => std::future::pending().await,
    }
}

/// Extract the relay's answer from a reply of any negotiation type
fn answer_sdp(message: Message) -> Option<String> {
    match message {
        Message::Push(description) | Message::Pull(description) => Some(description.sdp),
        Message::Fetch(negotiation) | Message::Forward(negotiation) => negotiation.sdp,
        Message::Signal {
            signal: Signal::Answer(sdp),
            ..
        } => Some(sdp),
        _ => None,
    }
}
