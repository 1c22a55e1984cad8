//! # Message Deduplication Filter
//!
//! A bounded, time-windowed approximate set of message digests.
//!
//! The filter keeps `bucket_count` hash sets of at most `bucket_size`
//! digests each. Inserts go into the current bucket; when it fills up (or
//! the optional rotation interval elapses) the oldest bucket is cleared and
//! becomes current. Memory is therefore bounded by
//! `bucket_count * bucket_size` digests no matter how much traffic passes.
//!
//! Membership is exact within the retained buckets: a digest is never
//! reported as seen unless it was inserted, and it is forgotten only once
//! its bucket rotates out.
//!
//! Two independent layers use this type:
//!
//! | Layer | Owner | Question answered |
//! |-------|-------|-------------------|
//! | Inbound | Network | "Did we already hand this to a handler?" |
//! | Outgoing | Peer | "Did this peer tell us it already has this?" |

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::protocol::Tag;

pub type Digest = [u8; 32];

/// Unsalted digest of a message, stable across nodes. Used for digest-skip
/// announcements, which must match on both ends.
pub fn message_digest(tag: Tag, data: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag.as_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

struct FilterState {
    buckets: Vec<HashSet<Digest>>,
    current: usize,
    rotated_at: Instant,
}

pub struct MessageFilter {
    state: Mutex<FilterState>,
    bucket_size: usize,
    rotation_interval: Option<Duration>,
    /// Per-instance salt so that inbound digests cannot be precomputed by
    /// a peer trying to poison the filter.
    nonce: [u8; 32],
}

impl MessageFilter {
    /// Create a filter with `bucket_count` buckets of `bucket_size` digests.
    /// Both values are clamped to at least one.
    pub fn new(bucket_count: usize, bucket_size: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_size = bucket_size.max(1);
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            state: Mutex::new(FilterState {
                buckets: (0..bucket_count)
                    .map(|_| HashSet::with_capacity(bucket_size))
                    .collect(),
                current: 0,
                rotated_at: Instant::now(),
            }),
            bucket_size,
            rotation_interval: None,
            nonce,
        }
    }

    /// Also rotate buckets on a timer, so entries age out under light
    /// traffic too.
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = Some(interval);
        self
    }

    pub fn rotation_interval(&self) -> Option<Duration> {
        self.rotation_interval
    }

    /// Check a received message against the filter using the salted digest.
    ///
    /// Returns true if the message was already present. With `add`, an
    /// absent message is recorded; with `promote`, a message found in an
    /// older bucket is copied into the current one.
    pub fn check_incoming_message(&self, tag: Tag, data: &[u8], add: bool, promote: bool) -> bool {
        let mut hasher = blake3::Hasher::new_keyed(&self.nonce);
        hasher.update(tag.as_bytes());
        hasher.update(data);
        let digest = *hasher.finalize().as_bytes();
        self.check_digest(&digest, add, promote)
    }

    /// Core membership test. See [`check_incoming_message`](Self::check_incoming_message).
    pub fn check_digest(&self, digest: &Digest, add: bool, promote: bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.maybe_rotate_on_time(&mut state);

        let current = state.current;
        if state.buckets[current].contains(digest) {
            return true;
        }
        let found_older = state
            .buckets
            .iter()
            .enumerate()
            .any(|(i, bucket)| i != current && bucket.contains(digest));
        if found_older {
            if promote {
                self.insert(&mut state, *digest);
            }
            return true;
        }
        if add {
            self.insert(&mut state, *digest);
        }
        false
    }

    /// Record `digest`; returns true if it was already present.
    pub fn seen(&self, digest: &Digest) -> bool {
        self.check_digest(digest, true, false)
    }

    /// Query without inserting.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.check_digest(digest, false, false)
    }

    /// Number of digests currently retained across all buckets.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.buckets.iter().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound on retained digests.
    pub fn capacity(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.buckets.len() * self.bucket_size
    }

    fn insert(&self, state: &mut FilterState, digest: Digest) {
        let current = state.current;
        state.buckets[current].insert(digest);
        if state.buckets[current].len() >= self.bucket_size {
            Self::rotate(state);
        }
    }

    fn maybe_rotate_on_time(&self, state: &mut FilterState) {
        if let Some(interval) = self.rotation_interval
            && state.rotated_at.elapsed() >= interval
        {
            Self::rotate(state);
        }
    }

    fn rotate(state: &mut FilterState) {
        state.current = (state.current + 1) % state.buckets.len();
        let current = state.current;
        state.buckets[current].clear();
        state.rotated_at = Instant::now();
    }
}

impl std::fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFilter")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tags;

    fn digest(n: u32) -> Digest {
        let mut d = [0u8; 32];
        d[..4].copy_from_slice(&n.to_be_bytes());
        d
    }

    #[test]
    fn seen_records_and_contains_does_not() {
        let filter = MessageFilter::new(3, 10);
        assert!(!filter.contains(&digest(1)));
        assert!(!filter.seen(&digest(1)));
        assert!(filter.seen(&digest(1)));
        assert!(filter.contains(&digest(1)));
        assert!(!filter.contains(&digest(2)));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn memory_is_bounded_by_bucket_geometry() {
        let filter = MessageFilter::new(4, 8);
        for n in 0..10_000 {
            filter.seen(&digest(n));
        }
        assert!(filter.len() <= filter.capacity());
        assert_eq!(filter.capacity(), 32);
    }

    #[test]
    fn oldest_bucket_is_forgotten_after_rotation() {
        let filter = MessageFilter::new(2, 4);
        // Fill bucket 0; the fourth insert rotates to bucket 1.
        for n in 0..4 {
            filter.seen(&digest(n));
        }
        assert!(filter.contains(&digest(0)));
        // Fill bucket 1; rotating back to bucket 0 clears it.
        for n in 4..8 {
            filter.seen(&digest(n));
        }
        assert!(!filter.contains(&digest(0)));
        assert!(filter.contains(&digest(5)));
    }

    #[test]
    fn promote_keeps_hot_digests_alive() {
        let filter = MessageFilter::new(2, 4);
        for n in 0..4 {
            filter.seen(&digest(n));
        }
        // digest(0) is in the older bucket now; promote copies it forward.
        assert!(filter.check_digest(&digest(0), true, true));
        for n in 4..7 {
            filter.seen(&digest(n));
        }
        assert!(filter.contains(&digest(0)));
    }

    #[test]
    fn time_based_rotation() {
        let filter = MessageFilter::new(1, 100).with_rotation_interval(Duration::from_millis(10));
        filter.seen(&digest(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!filter.contains(&digest(1)));
    }

    #[test]
    fn incoming_digests_are_salted_per_instance() {
        let a = MessageFilter::new(2, 16);
        let b = MessageFilter::new(2, 16);
        assert!(!a.check_incoming_message(tags::AGREEMENT_VOTE, b"vote", true, true));
        assert!(a.check_incoming_message(tags::AGREEMENT_VOTE, b"vote", true, true));
        assert!(!a.check_incoming_message(tags::PROPOSAL_PAYLOAD, b"vote", true, true));
        assert!(!b.check_incoming_message(tags::AGREEMENT_VOTE, b"vote", true, true));
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn unsalted_digest_is_stable() {
        assert_eq!(
            message_digest(tags::TXN, b"payload"),
            message_digest(tags::TXN, b"payload")
        );
        assert_ne!(
            message_digest(tags::TXN, b"payload"),
            message_digest(tags::AGREEMENT_VOTE, b"payload")
        );
    }
}
