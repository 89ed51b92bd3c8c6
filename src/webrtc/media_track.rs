//! Shared media handles
//!
//! A [`MediaTrack`] is a fan-out of raw RTP packets: whoever produces media
//! (a capture source, or a remote track received on a pull/fetch session)
//! publishes into it, and every transport the track is attached to
//! subscribes. A [`MediaStream`] is a cheap, clonable set of tracks, so a
//! stream received on one session can be re-sent on a forward session
//! without copying anything.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Packets buffered per subscriber before it starts lagging
const TRACK_CHANNEL_CAPACITY: usize = 512;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One media track; clones share the same packet channel
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    stream_id: String,
    kind: TrackKind,
    mime_type: String,
    packets: broadcast::Sender<Bytes>,
}

impl MediaTrack {
    pub fn new(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        kind: TrackKind,
        mime_type: impl Into<String>,
    ) -> Self {
        let (packets, _) = broadcast::channel(TRACK_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                stream_id: stream_id.into(),
                kind,
                mime_type: mime_type.into(),
                packets,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn mime_type(&self) -> &str {
        &self.inner.mime_type
    }

    /// Publish one RTP packet; returns the number of subscribers reached
    pub fn publish(&self, packet: Bytes) -> usize {
        self.inner.packets.send(packet).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.packets.subscribe()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("mime_type", &self.inner.mime_type)
            .finish()
    }
}

/// A set of tracks that travel together
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return;
        }
        self.tracks.push(track);
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }
}

/// RTP packet parser utilities
pub mod rtp_util {
    /// Check the version bits of an RTP header
    pub fn is_rtp(packet: &[u8]) -> bool {
        packet.len() >= 12 && (packet[0] >> 6) == 2
    }

    /// Extract sequence number from RTP packet
    pub fn get_sequence(packet: &[u8]) -> Option<u16> {
        if packet.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([packet[2], packet[3]]))
    }

    /// Extract SSRC from RTP packet
    pub fn get_ssrc(packet: &[u8]) -> Option<u32> {
        if packet.len() < 12 {
            return None;
        }
        Some(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]))
    }

    /// Extract payload type from RTP packet
    pub fn get_payload_type(packet: &[u8]) -> Option<u8> {
        if packet.len() < 2 {
            return None;
        }
        Some(packet[1] & 0x7F)
    }
}

#[cfg(test)]
mod tests {
    use super::rtp_util::*;
    use super::*;

    #[test]
    fn test_rtp_parsing() {
        // V=2, M=1, PT=96, seq=1, ts=0
        let packet = [
            0x80, 0xE0,
            0x00, 0x01,
            0x00, 0x00, 0x00, 0x00,
            0x12, 0x34, 0x56, 0x78,
            0x00, 0x01, 0x02,
        ];

        assert!(is_rtp(&packet));
        assert_eq!(get_sequence(&packet), Some(1));
        assert_eq!(get_ssrc(&packet), Some(0x12345678));
        assert_eq!(get_payload_type(&packet), Some(96));
        assert!(!is_rtp(&[0x00, 0x01]));
    }

    #[tokio::test]
    async fn test_cloned_tracks_share_packets() {
        let track = MediaTrack::new("v0", "stream", TrackKind::Video, "video/VP8");
        let forwarded = track.clone();
        let mut rx = forwarded.subscribe();

        assert_eq!(track.publish(Bytes::from_static(b"rtp")), 1);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"rtp"));
    }

    #[test]
    fn test_stream_ignores_duplicate_track_ids() {
        let track = MediaTrack::new("v0", "stream", TrackKind::Video, "video/VP8");
        let mut stream = MediaStream::default();
        stream.add_track(track.clone());
        stream.add_track(track);
        assert_eq!(stream.len(), 1);
    }
}
