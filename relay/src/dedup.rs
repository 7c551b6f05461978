//! Bounded duplicate-suppression cache sitting between the gateway reader
//! and the raw event queue. Remembers the fingerprints of recently accepted
//! events in arrival order; a key falls out once the cache reaches capacity
//! or its retention window elapses, whichever comes first.

use crate::event::{DedupKey, RewardEvent};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub struct DedupCache {
    capacity: usize,
    retention: Duration,
    /// Insertion-ordered fingerprints; the paired instant is a generation
    /// marker so stale queue entries for a re-inserted key are skipped
    order: VecDeque<(DedupKey, Instant)>,
    seen: HashMap<DedupKey, Instant>,
}

impl DedupCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity,
            retention,
            order: VecDeque::with_capacity(capacity),
            seen: HashMap::with_capacity(capacity),
        }
    }

    /// Returns true when the event has not been seen within the retention
    /// window and records it; false means it is a duplicate and should drop
    pub fn accept(&mut self, event: &RewardEvent) -> bool {
        self.accept_at(event, Instant::now())
    }

    fn accept_at(&mut self, event: &RewardEvent, now: Instant) -> bool {
        self.expire(now);

        let key = event.dedup_key();
        match self.seen.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now);
                self.order.push_back((key, now));
                while self.order.len() > self.capacity {
                    self.evict_front();
                }
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.duration_since(*inserted) < self.retention {
                break;
            }
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        if let Some((key, inserted)) = self.order.pop_front() {
            // Only remove the map entry if it belongs to this generation
            if self.seen.get(&key) == Some(&inserted) {
                self.seen.remove(&key);
            }
        }
    }
}
