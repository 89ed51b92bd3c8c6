//! WebSocket control connection to the relay
//!
//! Connects as a client, then splits the socket: a writer task drains the
//! [`ControlLink`] queue (plus keepalive pings and pongs) into the socket and
//! a reader task turns inbound frames into [`LinkEvent`]s.

use super::link::{ControlLink, LinkEvent};
use crate::webrtc::WebRTCError;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Interval between keepalive pings
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Open the control connection
pub async fn connect(url: &str) -> Result<(ControlLink, mpsc::UnboundedReceiver<LinkEvent>), WebRTCError> {
    let (ws_stream, response) = connect_async(url)
        .await
        .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to connect to {}: {}", url, e)))?;
    info!("Control channel connected to {} (HTTP {})", url, response.status());

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (link, mut outbound_rx) = ControlLink::channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

    // Writer: link frames, pongs and keepalive pings
    tokio::spawn(async move {
        let mut ping = time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            let msg = tokio::select! {
                text = outbound_rx.recv() => match text {
                    Some(text) => Message::Text(text),
                    None => {
                        debug!("Control link dropped, closing socket");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(msg) = control_rx.recv() => msg,
                _ = ping.tick() => Message::Ping(Vec::new()),
            };
            if let Err(e) = ws_sender.send(msg).await {
                warn!("Control channel write failed: {}", e);
                break;
            }
        }
    });

    // Reader: text frames to the manager, close to a LinkEvent
    tokio::spawn(async move {
        let reason = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    if inbound_tx.send(LinkEvent::Message(text)).is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if inbound_tx.send(LinkEvent::Message(text)).is_err() {
                            break None;
                        }
                    }
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = control_tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    break Some(
                        frame
                            .map(|f| format!("closed by relay ({}): {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by relay".to_string()),
                    );
                }
                Some(Err(e)) => {
                    error!("Control channel error: {}", e);
                    break Some(e.to_string());
                }
                None => break Some("connection ended".to_string()),
            }
        };
        let _ = inbound_tx.send(LinkEvent::Closed(reason));
    });

    Ok((link, inbound_rx))
}
