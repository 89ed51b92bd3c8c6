//! Request/reply correlation
//!
//! Outbound requests get a monotonically increasing id; a reply carrying that
//! id completes the waiter exactly once. Replies for ids nobody is waiting on
//! are logged and dropped.

use super::signaling::{ControlFrame, MessageType};
use log::{debug, warn};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

struct PendingRequest {
    kind: MessageType,
    completion: oneshot::Sender<ControlFrame>,
    issued_at: Instant,
}

pub struct RequestCorrelator {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate an id for an outbound request of `kind`
    pub fn register(&mut self, kind: MessageType) -> (u64, oneshot::Receiver<ControlFrame>) {
        let id = self.next_id;
        self.next_id += 1;
        let (completion, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                completion,
                issued_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Complete the waiter for `request_id`; `false` if nobody was waiting
    pub fn resolve(&mut self, request_id: u64, frame: ControlFrame) -> bool {
        let Some(pending) = self.pending.remove(&request_id) else {
            warn!("Reply {} for unknown request id {}", frame.kind(), request_id);
            return false;
        };
        debug!(
            "Resolved {} request {} with {} after {:?}",
            pending.kind,
            request_id,
            frame.kind(),
            pending.issued_at.elapsed()
        );
        if pending.completion.send(frame).is_err() {
            debug!("Waiter for request {} already gone", request_id);
        }
        true
    }

    /// Stop waiting for `request_id`; the waiter sees a closed channel
    pub fn forget(&mut self, request_id: u64) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Drop every outstanding request
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::signaling::Message;

    fn ack(id: u64) -> ControlFrame {
        ControlFrame::request(id, Message::Activate(None))
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut correlator = RequestCorrelator::new();
        let (a, _ra) = correlator.register(MessageType::Push);
        let (b, _rb) = correlator.register(MessageType::Pull);
        correlator.forget(a);
        let (c, _rc) = correlator.register(MessageType::Pull);
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let mut correlator = RequestCorrelator::new();
        let (id, rx) = correlator.register(MessageType::Activate);
        assert!(correlator.resolve(id, ack(id)));
        assert!(!correlator.resolve(id, ack(id)));
        assert_eq!(rx.await.unwrap(), ack(id));
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_unknown_reply_is_ignored() {
        let mut correlator = RequestCorrelator::new();
        let (_id, _rx) = correlator.register(MessageType::Push);
        assert!(!correlator.resolve(99, ack(99)));
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_closes_waiter() {
        let mut correlator = RequestCorrelator::new();
        let (id, rx) = correlator.register(MessageType::Pull);
        assert!(correlator.forget(id));
        assert!(rx.await.is_err());
        assert!(!correlator.forget(id));
    }

    #[test]
    fn test_clear_reports_dropped_count() {
        let mut correlator = RequestCorrelator::new();
        let _a = correlator.register(MessageType::Push);
        let _b = correlator.register(MessageType::Pull);
        assert_eq!(correlator.clear(), 2);
        assert_eq!(correlator.len(), 0);
    }
}
