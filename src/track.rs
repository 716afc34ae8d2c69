//! Per-track packet buffering and the subscription that groups tracks
//! together. Sits above `Webrtc`: tracks are populated by whatever reads
//! RTP/RTCP off the peer connection and are drained by application code
//! through `receive_msg`/`await_msg`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::AdaptiveRingBuffer;
use crate::cancel::CloseSignal;
use crate::config::TrackConfigure;
use crate::select::Selected;
use crate::sync::StateNotifier;

/// The media kind a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Which cache `receive_msg` should pop from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
    /// Whichever cache holds the older (lower-sequence) packet.
    Any,
}

/// A packet with the per-track sequence number assigned at insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u64,
    pub payload: bytes::Bytes,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrackStatistics {
    pub rtp_received: u64,
    pub rtp_dropped: u64,
    pub rtcp_received: u64,
    pub rtcp_dropped: u64,
}

/// Rebase sequences once the running counter nears overflow, so arithmetic
/// on sequence numbers never wraps silently.
const SEQUENCE_REBASE_THRESHOLD: u64 = (u32::MAX as u64) - (1 << 16);

struct Caches {
    rtp: AdaptiveRingBuffer<Packet>,
    rtcp: AdaptiveRingBuffer<Packet>,
}

/// One remote or local media track, bound to a WebRTC media section by
/// `bind_id == mid`.
pub struct Track {
    pub kind: TrackKind,
    pub pub_id: String,
    pub global_id: String,
    pub bind_id: String,
    pub rid: Option<String>,
    pub stream_id: String,
    pub labels: HashMap<String, String>,
    bound: std::sync::atomic::AtomicBool,
    next_seq: AtomicU64,
    caches: Mutex<Caches>,
    statistics: Mutex<TrackStatistics>,
    /// Bumped on every insert and on every bound/unbound transition so
    /// `await_msg` callers can wake and recheck.
    activity: StateNotifier<u64>,
    activity_counter: AtomicU64,
}

impl Track {
    pub fn new(
        kind: TrackKind,
        pub_id: impl Into<String>,
        global_id: impl Into<String>,
        bind_id: impl Into<String>,
        stream_id: impl Into<String>,
        cfg: &TrackConfigure,
    ) -> Self {
        Self {
            kind,
            pub_id: pub_id.into(),
            global_id: global_id.into(),
            bind_id: bind_id.into(),
            rid: None,
            stream_id: stream_id.into(),
            labels: HashMap::new(),
            bound: std::sync::atomic::AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            caches: Mutex::new(Caches {
                rtp: AdaptiveRingBuffer::new(cfg.rtp_cap_segments, cfg.rtp_min_segments, cfg.rtp_max_segments),
                rtcp: AdaptiveRingBuffer::new(cfg.rtcp_cap_segments, cfg.rtcp_min_segments, cfg.rtcp_max_segments),
            }),
            statistics: Mutex::new(TrackStatistics::default()),
            activity: StateNotifier::new(0),
            activity_counter: AtomicU64::new(0),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn set_bound(&self, bound: bool) {
        self.bound.store(bound, Ordering::Release);
        self.bump_activity();
    }

    pub fn statistics(&self) -> TrackStatistics {
        *self.statistics.lock()
    }

    fn bump_activity(&self) {
        let v = self.activity_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.activity.set(v);
    }

    /// Assign this track's next sequence number, rebasing both caches once
    /// the counter approaches `u32::MAX` so downstream consumers never see
    /// it wrap.
    fn next_sequence(&self, caches: &mut Caches) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if seq >= SEQUENCE_REBASE_THRESHOLD {
            rebase(caches, seq);
            self.next_seq.store(0, Ordering::SeqCst);
            return 0;
        }
        seq
    }

    /// Insert an incoming packet, dropping the oldest on overflow.
    pub fn insert(&self, kind: PacketKind, payload: bytes::Bytes) {
        debug_assert_ne!(kind, PacketKind::Any, "invariant violated: insert requires a concrete cache");
        let mut caches = self.caches.lock();
        let seq = self.next_sequence(&mut caches);
        let packet = Packet { seq, payload };
        let mut stats = self.statistics.lock();
        match kind {
            PacketKind::Rtp => {
                let before = caches.rtp.dropped_count();
                caches.rtp.enqueue(packet, true);
                stats.rtp_received += 1;
                stats.rtp_dropped += caches.rtp.dropped_count() - before;
            }
            PacketKind::Rtcp => {
                let before = caches.rtcp.dropped_count();
                caches.rtcp.enqueue(packet, true);
                stats.rtcp_received += 1;
                stats.rtcp_dropped += caches.rtcp.dropped_count() - before;
            }
            PacketKind::Any => unreachable!(),
        }
        drop(caches);
        drop(stats);
        self.bump_activity();
    }

    /// Pop one packet. `Any` picks whichever cache's head has the lower
    /// sequence number, so interleaved readers see roughly arrival order.
    pub fn receive_msg(&self, kind: PacketKind) -> Option<Packet> {
        let mut caches = self.caches.lock();
        match kind {
            PacketKind::Rtp => caches.rtp.dequeue(),
            PacketKind::Rtcp => caches.rtcp.dequeue(),
            PacketKind::Any => match (caches.rtp.peek().map(|p| p.seq), caches.rtcp.peek().map(|p| p.seq)) {
                (Some(rtp_seq), Some(rtcp_seq)) if rtcp_seq < rtp_seq => caches.rtcp.dequeue(),
                (Some(_), _) => caches.rtp.dequeue(),
                (None, Some(_)) => caches.rtcp.dequeue(),
                (None, None) => None,
            },
        }
    }

    /// Suspend until a packet of `kind` is available, the track is
    /// unbound, or `closer` fires.
    pub async fn await_msg(&self, kind: PacketKind, closer: &CloseSignal) -> Selected<Option<Packet>> {
        loop {
            if let Some(packet) = self.receive_msg(kind) {
                return Selected::Completed(Some(packet));
            }
            if !self.is_bound() {
                return Selected::Completed(None);
            }
            let target = self.activity_counter.load(Ordering::SeqCst);
            match self.activity.wait_for(|v| *v != target, closer).await {
                Selected::Completed(_) => continue,
                Selected::Cancelled => return Selected::Cancelled,
            }
        }
    }
}

fn rebase(caches: &mut Caches, high_watermark: u64) {
    let min = [caches.rtp.peek().map(|p| p.seq), caches.rtcp.peek().map(|p| p.seq)]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(high_watermark);
    for cache in [&mut caches.rtp, &mut caches.rtcp] {
        // One slot per held element is all this temporary buffer needs;
        // max_segments is sized one past that so the ceiling never bites.
        let max_segments = cache.len().max(1) + 1;
        let mut rebased = AdaptiveRingBuffer::new(1, 1, max_segments);
        while let Some(mut packet) = cache.dequeue() {
            packet.seq -= min;
            let _ = rebased.enqueue(packet, true);
        }
        *cache = rebased;
    }
}

/// A server-confirmed grant of media tracks to a subscriber.
pub struct Subscription {
    pub sub_id: String,
    pub pub_id: String,
    pub tracks: Vec<Arc<Track>>,
}

impl Subscription {
    pub fn new(sub_id: impl Into<String>, pub_id: impl Into<String>, tracks: Vec<Arc<Track>>) -> Self {
        Self {
            sub_id: sub_id.into(),
            pub_id: pub_id.into(),
            tracks,
        }
    }

    pub fn track_by_bind_id(&self, bind_id: &str) -> Option<&Arc<Track>> {
        self.tracks.iter().find(|t| t.bind_id == bind_id)
    }

    pub fn all_bound(&self) -> bool {
        self.tracks.iter().all(|t| t.is_bound())
    }

    /// Unbind every track, waking any in-flight `await_msg` callers.
    pub fn close(&self) {
        for track in &self.tracks {
            track.set_bound(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> TrackConfigure {
        TrackConfigure {
            rtp_cap_segments: 4,
            rtp_min_segments: 1,
            rtp_max_segments: 3,
            rtcp_cap_segments: 4,
            rtcp_min_segments: 1,
            rtcp_max_segments: 3,
        }
    }

    #[test]
    fn insert_and_receive_preserve_fifo_order() {
        let track = Track::new(TrackKind::Video, "pub1", "g1", "mid0", "stream1", &test_cfg());
        track.insert(PacketKind::Rtp, bytes::Bytes::from_static(b"a"));
        track.insert(PacketKind::Rtp, bytes::Bytes::from_static(b"b"));
        let first = track.receive_msg(PacketKind::Rtp).unwrap();
        let second = track.receive_msg(PacketKind::Rtp).unwrap();
        assert_eq!(first.payload, bytes::Bytes::from_static(b"a"));
        assert_eq!(second.payload, bytes::Bytes::from_static(b"b"));
        assert_eq!(first.seq + 1, second.seq);
    }

    #[test]
    fn any_picks_the_lower_sequence_head() {
        let track = Track::new(TrackKind::Audio, "pub1", "g1", "mid0", "stream1", &test_cfg());
        track.insert(PacketKind::Rtp, bytes::Bytes::from_static(b"rtp0"));
        track.insert(PacketKind::Rtcp, bytes::Bytes::from_static(b"rtcp1"));
        let first = track.receive_msg(PacketKind::Any).unwrap();
        assert_eq!(first.payload, bytes::Bytes::from_static(b"rtp0"));
        let second = track.receive_msg(PacketKind::Any).unwrap();
        assert_eq!(second.payload, bytes::Bytes::from_static(b"rtcp1"));
    }

    #[test]
    fn dropped_packets_are_counted_in_statistics() {
        let track = Track::new(TrackKind::Video, "pub1", "g1", "mid0", "stream1", &test_cfg());
        for i in 0..16 {
            track.insert(PacketKind::Rtp, bytes::Bytes::from(vec![i as u8]));
        }
        let stats = track.statistics();
        assert_eq!(stats.rtp_received, 16);
        assert!(stats.rtp_dropped > 0);
    }

    #[tokio::test]
    async fn await_msg_wakes_on_insert() {
        let track = Arc::new(Track::new(TrackKind::Video, "pub1", "g1", "mid0", "stream1", &test_cfg()));
        let closer = CloseSignal::new();
        let t2 = track.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            t2.insert(PacketKind::Rtp, bytes::Bytes::from_static(b"late"));
        });
        track.set_bound(true);
        let result = track.await_msg(PacketKind::Rtp, &closer).await;
        assert_eq!(result, Selected::Completed(Some(Packet { seq: 0, payload: bytes::Bytes::from_static(b"late") })));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn await_msg_returns_none_when_unbound_and_empty() {
        let track = Track::new(TrackKind::Video, "pub1", "g1", "mid0", "stream1", &test_cfg());
        let closer = CloseSignal::new();
        let result = track.await_msg(PacketKind::Rtp, &closer).await;
        assert_eq!(result, Selected::Completed(None));
    }

    #[tokio::test]
    async fn await_msg_cancelled_by_closer() {
        let track = Track::new(TrackKind::Video, "pub1", "g1", "mid0", "stream1", &test_cfg());
        track.set_bound(true);
        let closer = CloseSignal::new();
        closer.close("done");
        let result = track.await_msg(PacketKind::Rtp, &closer).await;
        assert_eq!(result, Selected::Cancelled);
    }

    #[test]
    fn subscription_tracks_are_found_by_bind_id() {
        let track = Arc::new(Track::new(TrackKind::Audio, "pub1", "g1", "mid-audio", "stream1", &test_cfg()));
        let sub = Subscription::new("sub1", "pub1", vec![track.clone()]);
        assert!(sub.track_by_bind_id("mid-audio").is_some());
        assert!(sub.track_by_bind_id("mid-video").is_none());
        assert!(!sub.all_bound());
        track.set_bound(true);
        assert!(sub.all_bound());
    }
}
