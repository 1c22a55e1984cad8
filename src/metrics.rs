//! Per-node counters.
//!
//! [`NetworkMetrics`] is constructed by the caller and handed to the node,
//! so several nodes in one process never share counters by accident.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NetworkMetrics {
    pub duplicate_messages_received: AtomicU64,
    pub outgoing_messages_filtered: AtomicU64,
    pub stale_messages_dropped: AtomicU64,
    pub slow_peers_disconnected: AtomicU64,
    pub broadcast_queue_full: AtomicU64,
    pub peer_queue_full: AtomicU64,
    pub handshake_rejections: AtomicU64,
    pub dial_failures: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// Point-in-time copy of [`NetworkMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub duplicate_messages_received: u64,
    pub outgoing_messages_filtered: u64,
    pub stale_messages_dropped: u64,
    pub slow_peers_disconnected: u64,
    pub broadcast_queue_full: u64,
    pub peer_queue_full: u64,
    pub handshake_rejections: u64,
    pub dial_failures: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            duplicate_messages_received: load(&self.duplicate_messages_received),
            outgoing_messages_filtered: load(&self.outgoing_messages_filtered),
            stale_messages_dropped: load(&self.stale_messages_dropped),
            slow_peers_disconnected: load(&self.slow_peers_disconnected),
            broadcast_queue_full: load(&self.broadcast_queue_full),
            peer_queue_full: load(&self.peer_queue_full),
            handshake_rejections: load(&self.handshake_rejections),
            dial_failures: load(&self.dial_failures),
            messages_received: load(&self.messages_received),
            messages_sent: load(&self.messages_sent),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = NetworkMetrics::new();
        NetworkMetrics::incr(&metrics.messages_sent);
        NetworkMetrics::incr(&metrics.messages_sent);
        NetworkMetrics::add(&metrics.bytes_sent, 100);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.dial_failures, 0);
    }
}
