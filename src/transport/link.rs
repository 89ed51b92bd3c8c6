//! In-process ends of the relay control connection
//!
//! The session manager talks to the relay through a [`ControlLink`] (an
//! outbound queue drained by a writer task) and consumes a stream of
//! [`LinkEvent`]s produced by the reader task.

use crate::webrtc::WebRTCError;
use tokio::sync::mpsc;

/// Inbound notification from the control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One text frame
    Message(String),
    /// The connection is gone, with a reason if one was given
    Closed(Option<String>),
}

/// Sending half of the control connection
#[derive(Debug, Clone)]
pub struct ControlLink {
    outbound: mpsc::UnboundedSender<String>,
}

impl ControlLink {
    /// Create a link whose frames can be read from the returned receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }

    /// Queue one text frame for the writer
    pub fn send(&self, text: String) -> Result<(), WebRTCError> {
        self.outbound
            .send(text)
            .map_err(|_| WebRTCError::ControlChannelLoss("writer task stopped".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_after_writer_gone_fails() {
        let (link, mut rx) = ControlLink::channel();
        link.send("one".to_string()).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("one"));

        drop(rx);
        assert!(link.is_closed());
        assert!(matches!(
            link.send("two".to_string()),
            Err(WebRTCError::ControlChannelLoss(_))
        ));
    }
}
