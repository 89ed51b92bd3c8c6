//! Session registry
//!
//! Maps session ids to the handles the dispatcher uses to reach each
//! session's driver. The registry never owns a [`TransportSession`]
//! itself; the driver task does.
//!
//! [`TransportSession`]: super::session::TransportSession

use super::session::{SessionInput, SessionRole, SessionState};
use super::WebRTCError;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Length of locally generated session ids
const SESSION_ID_LEN: usize = 8;

/// Generate a short random session id
pub fn generate_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}

/// Dispatcher-side handle of one session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    role: SessionRole,
    inputs: mpsc::UnboundedSender<SessionInput>,
    state: watch::Receiver<SessionState>,
    token: u64,
}

impl SessionHandle {
    /// Create a handle plus the receiving ends its driver consumes
    pub fn channel(
        role: SessionRole,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SessionInput>,
        watch::Sender<SessionState>,
    ) {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::New);
        let handle = Self {
            role,
            inputs,
            state,
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        };
        (handle, inputs_rx, state_tx)
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Identity of this handle, distinct even when a relay reuses an id
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Deliver an input; `false` if the driver has already finished
    pub fn send(&self, input: SessionInput) -> bool {
        self.inputs.send(input).is_ok()
    }
}

/// Session id to handle mapping
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locally initiated session under a fresh id
    pub fn create(&mut self, handle: SessionHandle) -> String {
        let mut id = generate_session_id();
        while self.sessions.contains_key(&id) {
            id = generate_session_id();
        }
        debug!("Registered {} session {}", handle.role(), id);
        self.sessions.insert(id.clone(), handle);
        id
    }

    /// Register a relay initiated session under the relay's id
    pub fn adopt(&mut self, session_id: &str, handle: SessionHandle) -> Result<(), WebRTCError> {
        if self.sessions.contains_key(session_id) {
            return Err(WebRTCError::DuplicateSession(session_id.to_string()));
        }
        debug!("Adopted {} session {}", handle.role(), session_id);
        self.sessions.insert(session_id.to_string(), handle);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionHandle> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove(&mut self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.remove(session_id)
    }

    /// Remove `session_id` only while it still refers to the handle with `token`
    pub fn remove_if_token(&mut self, session_id: &str, token: u64) -> Option<SessionHandle> {
        match self.sessions.get(session_id) {
            Some(handle) if handle.token == token => self.sessions.remove(session_id),
            _ => None,
        }
    }

    /// Take every session out of the registry
    pub fn drain(&mut self) -> Vec<(String, SessionHandle)> {
        self.sessions.drain().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
