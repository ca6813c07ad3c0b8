//! Per-area ttl countdown queue.
//!
//! A min-heap ordered by expiry instant. Entries are never removed when a
//! value is replaced; stale entries are detected at pop time by comparing
//! `(version, originator_id, ttl_version)` against the live map.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::types::{Value, TTL_INFINITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlEntry {
    pub expiry: Instant,
    pub key: String,
    pub version: i64,
    pub originator_id: String,
    pub ttl_version: i64,
}

impl TtlEntry {
    /// True when the queue entry still describes the stored value.
    pub fn matches(&self, value: &Value) -> bool {
        self.version == value.version
            && self.originator_id == value.originator_id
            && self.ttl_version == value.ttl_version
    }
}

impl Ord for TtlEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for TtlEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TtlQueue {
    heap: BinaryHeap<Reverse<TtlEntry>>,
}

impl TtlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `value` for expiry. Values with infinite ttl are not queued.
    /// Returns the new entry's expiry iff it became the earliest one, in
    /// which case the area timer must be rescheduled.
    pub fn push(&mut self, now: Instant, key: &str, value: &Value) -> Option<Instant> {
        if value.ttl_ms == TTL_INFINITY {
            return None;
        }
        let expiry = now + std::time::Duration::from_millis(value.ttl_ms.max(0) as u64);
        let earliest = self
            .heap
            .peek()
            .map_or(true, |Reverse(top)| expiry <= top.expiry);
        self.heap.push(Reverse(TtlEntry {
            expiry,
            key: key.to_string(),
            version: value.version,
            originator_id: value.originator_id.clone(),
            ttl_version: value.ttl_version,
        }));
        earliest.then_some(expiry)
    }

    /// Pop every entry due at `now` or earlier.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TtlEntry> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.expiry > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            expired.push(entry);
        }
        expired
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(top)| top.expiry)
    }

    /// Remaining lifetime of the queue entry tracking exactly this stored
    /// value, if any. Heap order is irrelevant here so the scan is over
    /// the raw entries.
    pub fn remaining_ttl_ms(&self, now: Instant, key: &str, value: &Value) -> Option<i64> {
        self.heap
            .iter()
            .filter(|Reverse(e)| e.key == key && e.matches(value))
            .map(|Reverse(e)| e.expiry.saturating_duration_since(now).as_millis() as i64)
            .max()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn value(version: i64, ttl_ms: i64, ttl_version: i64) -> Value {
        Value::new(version, "node-a", Some(b"v".to_vec()), ttl_ms, ttl_version)
    }

    #[test]
    fn test_earliest_entry_requests_reschedule() {
        let mut queue = TtlQueue::new();
        let now = Instant::now();
        assert!(queue.push(now, "k1", &value(1, 5_000, 0)).is_some());
        // Later expiry does not displace the head.
        assert!(queue.push(now, "k2", &value(1, 9_000, 0)).is_none());
        // Earlier expiry does.
        assert!(queue.push(now, "k3", &value(1, 1_000, 0)).is_some());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_infinite_ttl_not_queued() {
        let mut queue = TtlQueue::new();
        let now = Instant::now();
        assert!(queue.push(now, "k", &value(1, TTL_INFINITY, 0)).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_expired_in_order() {
        let mut queue = TtlQueue::new();
        let now = Instant::now();
        queue.push(now, "slow", &value(1, 8_000, 0));
        queue.push(now, "fast", &value(1, 1_000, 0));

        let due = queue.pop_expired(now + Duration::from_millis(2_000));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "fast");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stale_entry_detected_by_match() {
        let stored = value(2, 5_000, 3);
        let mut queue = TtlQueue::new();
        let now = Instant::now();
        queue.push(now, "k", &value(2, 5_000, 2));

        let due = queue.pop_expired(now + Duration::from_millis(6_000));
        assert_eq!(due.len(), 1);
        // Refresh bumped ttl_version; the popped entry no longer matches.
        assert!(!due[0].matches(&stored));
    }

    #[test]
    fn test_remaining_ttl_tracks_live_entry() {
        let mut queue = TtlQueue::new();
        let now = Instant::now();
        let v = value(1, 10_000, 0);
        queue.push(now, "k", &v);

        let remaining = queue
            .remaining_ttl_ms(now + Duration::from_millis(4_000), "k", &v)
            .unwrap();
        assert!(remaining <= 6_000 && remaining > 5_000);
        assert!(queue
            .remaining_ttl_ms(now, "k", &value(9, 10_000, 0))
            .is_none());
    }
}
