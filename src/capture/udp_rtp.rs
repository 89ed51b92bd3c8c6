//! UDP RTP media endpoints
//!
//! [`UdpRtpSource`] reads RTP packets from a local UDP port (e.g. a
//! `gst-launch ... ! udpsink` or `ffmpeg -f rtp` pipeline) and publishes them
//! into a [`MediaTrack`]. [`UdpRtpSink`] does the reverse for received tracks.

use crate::config::VideoCodec;
use crate::webrtc::media_track::rtp_util;
use crate::webrtc::{MediaStream, MediaTrack, TrackKind, WebRTCError};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 1500;

/// Packet counters for one endpoint
#[derive(Debug, Default, Clone)]
pub struct RtpStats {
    pub packets: u64,
    pub bytes: u64,
    /// Datagrams that were not RTP
    pub dropped: u64,
    pub last_sequence: Option<u16>,
}

impl RtpStats {
    fn record(&mut self, packet: &[u8]) {
        self.packets += 1;
        self.bytes += packet.len() as u64;
        self.last_sequence = rtp_util::get_sequence(packet);
    }
}

/// Local RTP feed for push sessions
pub struct UdpRtpSource {
    track: MediaTrack,
    local_addr: SocketAddr,
    stats: Arc<Mutex<RtpStats>>,
    task: JoinHandle<()>,
}

impl UdpRtpSource {
    /// Bind `addr` and start publishing every RTP datagram into a new video track
    pub async fn bind(addr: &str, codec: VideoCodec) -> Result<Self, WebRTCError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to bind RTP source {}: {}", addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| WebRTCError::MediaError(format!("RTP source address: {}", e)))?;

        let track = MediaTrack::new(
            format!("video-{}", codec.as_str()),
            "relay-signal",
            TrackKind::Video,
            codec.mime_type(),
        );
        let stats = Arc::new(Mutex::new(RtpStats::default()));
        let task = tokio::spawn(read_datagrams(socket, track.clone(), stats.clone()));
        info!("RTP source listening on {} ({})", local_addr, codec.mime_type());

        Ok(Self {
            track,
            local_addr,
            stats,
            task,
        })
    }

    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    /// Stream holding the source track, ready to push
    pub fn stream(&self) -> MediaStream {
        MediaStream::new(vec![self.track.clone()])
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> RtpStats {
        self.stats.lock().clone()
    }
}

impl Drop for UdpRtpSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_datagrams(socket: UdpSocket, track: MediaTrack, stats: Arc<Mutex<RtpStats>>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("RTP source read failed: {}", e);
                break;
            }
        };
        let packet = &buf[..n];
        if !rtp_util::is_rtp(packet) {
            stats.lock().dropped += 1;
            continue;
        }
        stats.lock().record(packet);
        track.publish(Bytes::copy_from_slice(packet));
    }
}

/// Forwards received tracks to a local UDP address
pub struct UdpRtpSink {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    stats: Arc<Mutex<RtpStats>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpRtpSink {
    pub async fn connect(target: &str) -> Result<Self, WebRTCError> {
        let target: SocketAddr = target
            .parse()
            .map_err(|e| WebRTCError::MediaError(format!("Invalid RTP sink address {}: {}", target, e)))?;
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to bind RTP sink socket: {}", e)))?;
        info!("RTP sink sending to {}", target);
        Ok(Self {
            socket: Arc::new(socket),
            target,
            stats: Arc::new(Mutex::new(RtpStats::default())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start forwarding every packet of `track`
    ///
    /// The forwarding task ends once every clone of the track is dropped.
    pub fn attach(&self, track: &MediaTrack) {
        debug!("RTP sink attached {} track {}", track.kind(), track.id());
        let task = tokio::spawn(write_datagrams(
            self.socket.clone(),
            self.target,
            track.id().to_string(),
            track.subscribe(),
            self.stats.clone(),
        ));
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    pub fn stats(&self) -> RtpStats {
        self.stats.lock().clone()
    }
}

impl Drop for UdpRtpSink {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn write_datagrams(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    track_id: String,
    mut packets: broadcast::Receiver<Bytes>,
    stats: Arc<Mutex<RtpStats>>,
) {
    loop {
        match packets.recv().await {
            Ok(packet) => {
                if let Err(e) = socket.send_to(&packet, target).await {
                    warn!("RTP sink write to {} failed: {}", target, e);
                    continue;
                }
                stats.lock().record(&packet);
            }
            Err(RecvError::Lagged(n)) => {
                warn!("RTP sink lagged behind track {} by {} packets", track_id, n);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("RTP sink detached track {}", track_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn rtp_packet(seq: u16) -> Vec<u8> {
        let mut packet = vec![0x80, 97];
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 42]);
        packet.extend_from_slice(b"payload");
        packet
    }

    #[tokio::test]
    async fn test_source_publishes_rtp_only() {
        let source = UdpRtpSource::bind("127.0.0.1:0", VideoCodec::VP8).await.unwrap();
        assert_eq!(source.track().mime_type(), "video/VP8");
        let mut packets = source.track().subscribe();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not rtp", source.local_addr()).await.unwrap();
        sender.send_to(&rtp_packet(7), source.local_addr()).await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), packets.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rtp_util::get_sequence(&packet), Some(7));

        let stats = source.stats();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.last_sequence, Some(7));
    }

    #[tokio::test]
    async fn test_sink_forwards_track_packets() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink = UdpRtpSink::connect(&receiver.local_addr().unwrap().to_string())
            .await
            .unwrap();
        let track = MediaTrack::new("v0", "s0", TrackKind::Video, "video/VP8");
        sink.attach(&track);
        track.publish(Bytes::from(rtp_packet(3)));

        let mut buf = [0u8; MAX_DATAGRAM];
        let n = tokio::time::timeout(Duration::from_secs(2), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rtp_util::get_sequence(&buf[..n]), Some(3));
    }

    #[tokio::test]
    async fn test_sink_task_ends_with_track() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink = UdpRtpSink::connect(&receiver.local_addr().unwrap().to_string())
            .await
            .unwrap();
        let track = MediaTrack::new("v0", "s0", TrackKind::Video, "video/VP8");
        sink.attach(&track);
        drop(track);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !sink.tasks.lock().iter().all(|task| task.is_finished()) {
            assert!(tokio::time::Instant::now() < deadline, "sink task outlived its track");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Finished tasks are pruned on the next attach
        let next = MediaTrack::new("v1", "s1", TrackKind::Video, "video/VP8");
        sink.attach(&next);
        assert_eq!(sink.tasks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_rejects_bad_address() {
        assert!(UdpRtpSink::connect("nowhere").await.is_err());
    }
}
