//! Handshake replay cache.
//!
//! Every verified handshake is remembered by hash until its timestamp leaves
//! the freshness window, so a captured handshake cannot open a second
//! session. When the cache is full the oldest entry is evicted and its
//! timestamp becomes a floor: handshakes stamped at or below it are refused.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::core::HASH_SIZE;
use crate::crypto::hash;

/// Recently verified handshakes.
#[derive(Debug)]
pub struct ReplayCache {
    seen: HashSet<[u8; HASH_SIZE]>,
    /// Insertion order, with each handshake's timestamp.
    order: VecDeque<([u8; HASH_SIZE], u64)>,
    capacity: usize,
    floor: u64,
}

impl ReplayCache {
    /// Cache holding at most `capacity` handshakes.
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            floor: 0,
        }
    }

    /// Whether `handshake`, stamped `timestamp`, was already accepted.
    pub fn is_replay(&self, handshake: &[u8], timestamp: u64) -> bool {
        timestamp <= self.floor || self.seen.contains(&hash(handshake))
    }

    /// Record a verified handshake.
    ///
    /// Returns false if it was already recorded. Entries older than
    /// `max_age` at `now_ms` are pruned first.
    pub fn insert(&mut self, handshake: &[u8], timestamp: u64, now_ms: u64, max_age: Duration) -> bool {
        if timestamp <= self.floor {
            return false;
        }
        let digest = hash(handshake);
        if self.seen.contains(&digest) {
            return false;
        }

        let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        while let Some(&(oldest, stamped)) = self.order.front() {
            if now_ms.saturating_sub(stamped) <= max_age {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&oldest);
        }
        if self.order.len() >= self.capacity {
            if let Some((evicted, stamped)) = self.order.pop_front() {
                self.seen.remove(&evicted);
                self.floor = self.floor.max(stamped);
            }
        }

        self.seen.insert(digest);
        self.order.push_back((digest, timestamp));
        true
    }

    /// Handshakes remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;
    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_second_copy_is_a_replay() {
        let mut cache = ReplayCache::new(8);
        assert!(!cache.is_replay(b"handshake", NOW));
        assert!(cache.insert(b"handshake", NOW, NOW, WINDOW));

        assert!(cache.is_replay(b"handshake", NOW));
        assert!(!cache.insert(b"handshake", NOW, NOW, WINDOW));
        assert!(!cache.is_replay(b"another", NOW));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_entries_are_pruned() {
        let mut cache = ReplayCache::new(8);
        cache.insert(b"old", NOW, NOW, WINDOW);

        let later = NOW + WINDOW.as_millis() as u64 + 1;
        assert!(cache.insert(b"new", later, later, WINDOW));
        assert_eq!(cache.len(), 1);
        assert!(!cache.is_replay(b"old", NOW + 1));
    }

    #[test]
    fn test_eviction_raises_the_floor() {
        let mut cache = ReplayCache::new(2);
        cache.insert(b"one", NOW, NOW, WINDOW);
        cache.insert(b"two", NOW + 1, NOW, WINDOW);
        cache.insert(b"three", NOW + 2, NOW, WINDOW);

        assert_eq!(cache.len(), 2);
        // Evicted, but still refused by its timestamp.
        assert!(cache.is_replay(b"one", NOW));
        assert!(!cache.insert(b"one", NOW, NOW, WINDOW));
        assert!(!cache.is_replay(b"four", NOW + 3));
    }
}
