use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub sender: String,
    pub msg_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Drop,
}

/// Bounded memory of recently admitted `(sender, msgId)` keys.
///
/// Bounded by count and by age; the oldest key always goes first.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    ttl: Duration,
    order: VecDeque<(DedupKey, Instant)>,
    seen: HashSet<DedupKey>,
}

impl DedupWindow {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::with_capacity(capacity.min(4096)),
        }
    }

    pub fn admit(&mut self, sender: &str, msg_id: &str, now: Instant) -> Admission {
        self.evict_expired(now);
        let key = DedupKey {
            sender: sender.to_string(),
            msg_id: msg_id.to_string(),
        };
        if self.seen.contains(&key) {
            return Admission::Drop;
        }
        while self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back((key, now));
        Admission::Admit
    }

    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((_, admitted_at)) = self.order.front() {
            if now.saturating_duration_since(*admitted_at) < self.ttl {
                break;
            }
            if let Some((key, _)) = self.order.pop_front() {
                self.seen.remove(&key);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
