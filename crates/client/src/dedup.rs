//! Bounded recent-event cache for cross-relay deduplication.
//!
//! Several relays usually push the same event within a short window; the
//! first arrival wins and later copies are dropped. The cache is a FIFO
//! over event ids, not an event store: old entries are evicted once
//! capacity is reached, which is safe because dedup only matters for
//! concurrently in-flight delivery, not historical correctness.

use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity.max(1)),
            seen: HashSet::with_capacity(capacity.max(1)),
        }
    }

    /// Record an event id. Returns `true` if this is its first sighting
    /// (deliver), `false` if it is a duplicate (drop).
    pub fn insert(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.order.push_back(event_id.to_string());
        self.seen.insert(event_id.to_string());
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(4096)
    }
}
