//! Scripted media transport and control link used by unit tests

use super::manager::{SessionManager, SessionManagerConfig};
use super::media_track::{MediaTrack, TrackKind};
use super::media_transport::{MediaTransport, MediaTransportFactory, SdpKind, TransportEvent};
use super::signaling::{ChannelIdentity, ControlFrame, IceCandidate};
use super::WebRTCError;
use crate::metrics::Metrics;
use crate::transport::link::{ControlLink, LinkEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    AddTrack(String),
    AddReceiver(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind, String),
    SetRemote(SdpKind, String),
    AddCandidate(String),
    Close,
}

/// Everything one fake transport was asked to do
#[derive(Default)]
pub(crate) struct TransportLog {
    calls: Mutex<Vec<Call>>,
    reject_remote: AtomicBool,
    closed: AtomicBool,
}

impl TransportLog {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn reject_remote(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

pub(crate) struct FakeTransport {
    session_id: String,
    log: Arc<TransportLog>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeTransport {
    pub(crate) fn new(session_id: &str, log: Arc<TransportLog>) -> Self {
        Self {
            session_id: session_id.to_string(),
            log,
            gate: None,
        }
    }

    async fn wait_gate(&self) {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), WebRTCError> {
        self.log.record(Call::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn add_receiver(&self, kind: TrackKind) -> Result<(), WebRTCError> {
        self.log.record(Call::AddReceiver(kind));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WebRTCError> {
        self.wait_gate().await;
        self.log.record(Call::CreateOffer);
        Ok(format!("offer-{}", self.session_id))
    }

    async fn create_answer(&self) -> Result<String, WebRTCError> {
        self.wait_gate().await;
        self.log.record(Call::CreateAnswer);
        Ok(format!("answer-{}", self.session_id))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WebRTCError> {
        self.log.record(Call::SetLocal(kind, sdp.to_string()));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WebRTCError> {
        if self.log.reject_remote.load(Ordering::SeqCst) {
            return Err(WebRTCError::SdpError(format!("rejected {:?}", kind)));
        }
        self.log.record(Call::SetRemote(kind, sdp.to_string()));
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), WebRTCError> {
        self.log.record(Call::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn gathered_local_description(&self) -> Result<String, WebRTCError> {
        self.log
            .calls()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Call::SetLocal(_, sdp) => Some(format!("{}+candidates", sdp)),
                _ => None,
            })
            .ok_or_else(|| WebRTCError::InvalidState("no local description".to_string()))
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.log.record(Call::Close);
        self.log.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out fake transports and keeping their logs and event senders
#[derive(Default)]
pub(crate) struct FakeFactory {
    logs: Mutex<HashMap<String, Arc<TransportLog>>>,
    events: Mutex<HashMap<String, mpsc::UnboundedSender<TransportEvent>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    reject_remote: AtomicBool,
}

impl FakeFactory {
    pub(crate) fn log(&self, session_id: &str) -> Arc<TransportLog> {
        self.logs
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| panic!("no transport for {}", session_id))
    }

    /// Log of the single transport created so far
    pub(crate) fn only_log(&self) -> Arc<TransportLog> {
        let logs = self.logs.lock();
        assert_eq!(logs.len(), 1, "expected exactly one transport");
        logs.values().next().cloned().expect("one transport")
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.logs.lock().len()
    }

    pub(crate) fn emit(&self, session_id: &str, event: TransportEvent) {
        let events = self.events.lock();
        let tx = events
            .get(session_id)
            .unwrap_or_else(|| panic!("no transport for {}", session_id));
        tx.send(event).expect("session driver gone");
    }

    /// Hold offer/answer generation until `release` is called
    pub(crate) fn hold_negotiation(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub(crate) fn reject_remote(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaTransportFactory for FakeFactory {
    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn MediaTransport>, WebRTCError> {
        let log = Arc::new(TransportLog::default());
        if self.reject_remote.load(Ordering::SeqCst) {
            log.reject_remote();
        }
        self.logs.lock().insert(session_id.to_string(), log.clone());
        self.events.lock().insert(session_id.to_string(), events);
        let mut transport = FakeTransport::new(session_id, log);
        transport.gate = self.gate.lock().clone();
        Ok(Box::new(transport))
    }
}

/// Manager wired to a fake factory and an in-memory control link
pub(crate) struct Harness {
    pub manager: SessionManager,
    pub factory: Arc<FakeFactory>,
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<LinkEvent>,
    inbound_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl Harness {
    pub(crate) fn new(config: SessionManagerConfig) -> Self {
        let factory = Arc::new(FakeFactory::default());
        let (link, outbound) = ControlLink::channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let identity = ChannelIdentity {
            channel_id: "c1".to_string(),
            channel_key: "k1".to_string(),
            client_id: "u1".to_string(),
        };
        let manager = SessionManager::new(
            identity,
            config,
            link,
            factory.clone(),
            Arc::new(Metrics::new()),
        );
        Self {
            manager,
            factory,
            outbound,
            inbound,
            inbound_rx: Some(inbound_rx),
        }
    }

    /// Spawn the dispatch loop over the inbound link events
    pub(crate) fn spawn_run(&mut self) -> tokio::task::JoinHandle<Result<(), WebRTCError>> {
        let manager = self.manager.clone();
        let inbound_rx = self.inbound_rx.take().expect("run loop already spawned");
        tokio::spawn(async move { manager.run(inbound_rx).await })
    }

    /// Feed one relay frame straight into dispatch
    pub(crate) fn relay(&self, text: &str) {
        self.manager.handle_text(text);
    }

    pub(crate) async fn next_frame(&mut self) -> ControlFrame {
        let text = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("control link closed");
        ControlFrame::decode(&text).expect("manager sent a malformed frame")
    }

    pub(crate) async fn assert_silent(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(150), self.outbound.recv()).await;
        if let Ok(Some(text)) = next {
            panic!("unexpected outbound frame: {}", text);
        }
    }

    /// Complete the activation handshake with a correlated reply
    pub(crate) async fn activate(&mut self) {
        let manager = self.manager.clone();
        let pending = tokio::spawn(async move { manager.activate().await });
        let frame = self.next_frame().await;
        let request_id = frame.request_id.expect("activation carries a request id");
        self.relay(&format!(r#"{{"type": "ACTIVATE", "requestId": {}}}"#, request_id));
        pending.await.expect("activation task panicked").expect("activation failed");
    }
}

pub(crate) fn fast_config() -> SessionManagerConfig {
    SessionManagerConfig {
        activation_timeout: Duration::from_secs(2),
        answer_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        ..SessionManagerConfig::default()
    }
}
