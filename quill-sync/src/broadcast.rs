//! Fan-out of encoded frames to every connection attached to a session.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, and the
//! sender never waits on a slow peer. Each subscriber buffers up to
//! `capacity` frames; a peer that falls further behind loses the oldest ones
//! (reported as lag) instead of stalling the session.
//!
//! Frames are tagged with the connection that caused them so the receiving
//! side can suppress echoes of its own document deltas.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

/// Identifies one attached connection.
pub type ConnectionId = Uuid;

/// A frame queued for delivery.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection whose input produced this frame. `None` delivers to everyone,
    /// including that connection.
    pub origin: Option<ConnectionId>,
    pub frame: Arc<Vec<u8>>,
}

impl Outbound {
    /// Whether `conn` should receive this frame.
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.origin != Some(conn)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub subscribers: usize,
}

/// Lock-free counters, read via [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_lagged: AtomicU64::new(0),
        }
    }
}

/// Broadcast channel for a single document session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }

    /// Queue `frame` for every subscriber. Never blocks.
    ///
    /// Returns the number of subscribers the frame was queued for; having
    /// none is not an error.
    pub fn send(&self, origin: Option<ConnectionId>, frame: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Outbound {
                origin,
                frame: Arc::new(frame),
            })
            .unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub(crate) fn record_lag(&self, skipped: u64) {
        self.stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
