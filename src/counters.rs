//! Per-area counters exposed through the store's monitoring surface.
//!
//! Lock-free: every field is an `AtomicU64` bumped with relaxed ordering
//! from the owning area task and read by snapshot callers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AreaCounters {
    pub received_publications: AtomicU64,
    pub received_key_vals: AtomicU64,
    pub updated_key_vals: AtomicU64,
    pub received_redundant_publications: AtomicU64,
    pub looped_publications: AtomicU64,
    pub expired_key_vals: AtomicU64,
    pub sent_publications: AtomicU64,
    pub sent_key_vals: AtomicU64,
    pub rate_limit_suppress: AtomicU64,
    pub num_full_sync: AtomicU64,
    pub num_full_sync_success: AtomicU64,
    pub num_full_sync_failure: AtomicU64,
    pub full_sync_duration_ms_sum: AtomicU64,
    pub num_finalized_sync: AtomicU64,
    pub num_finalized_sync_success: AtomicU64,
    pub num_finalized_sync_failure: AtomicU64,
    pub num_flood_pub: AtomicU64,
    pub num_flood_pub_success: AtomicU64,
    pub num_flood_pub_failure: AtomicU64,
    pub num_flood_peers: AtomicU64,
    pub num_client_connection_failure: AtomicU64,
    pub num_missing_keys: AtomicU64,
    pub num_dual_messages: AtomicU64,
}

impl AreaCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Flat snapshot. `num_keys`/`num_peers` are live gauges the area
    /// fills in itself; `full_sync_duration_ms_avg` is derived here.
    pub fn snapshot(&self, num_keys: usize, num_peers: usize) -> BTreeMap<String, i64> {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed) as i64;

        let mut out = BTreeMap::new();
        out.insert("num_keys".to_string(), num_keys as i64);
        out.insert("num_peers".to_string(), num_peers as i64);
        out.insert(
            "received_publications".to_string(),
            read(&self.received_publications),
        );
        out.insert(
            "received_key_vals".to_string(),
            read(&self.received_key_vals),
        );
        out.insert("updated_key_vals".to_string(), read(&self.updated_key_vals));
        out.insert(
            "received_redundant_publications".to_string(),
            read(&self.received_redundant_publications),
        );
        out.insert(
            "looped_publications".to_string(),
            read(&self.looped_publications),
        );
        out.insert("expired_key_vals".to_string(), read(&self.expired_key_vals));
        out.insert("sent_publications".to_string(), read(&self.sent_publications));
        out.insert("sent_key_vals".to_string(), read(&self.sent_key_vals));
        out.insert(
            "rate_limit_suppress".to_string(),
            read(&self.rate_limit_suppress),
        );
        out.insert("num_full_sync".to_string(), read(&self.num_full_sync));
        out.insert(
            "num_full_sync_success".to_string(),
            read(&self.num_full_sync_success),
        );
        out.insert(
            "num_full_sync_failure".to_string(),
            read(&self.num_full_sync_failure),
        );
        let sync_successes = read(&self.num_full_sync_success);
        let avg = if sync_successes > 0 {
            read(&self.full_sync_duration_ms_sum) / sync_successes
        } else {
            0
        };
        out.insert("full_sync_duration_ms_avg".to_string(), avg);
        out.insert(
            "num_finalized_sync".to_string(),
            read(&self.num_finalized_sync),
        );
        out.insert(
            "num_finalized_sync_success".to_string(),
            read(&self.num_finalized_sync_success),
        );
        out.insert(
            "num_finalized_sync_failure".to_string(),
            read(&self.num_finalized_sync_failure),
        );
        out.insert("num_flood_pub".to_string(), read(&self.num_flood_pub));
        out.insert(
            "num_flood_pub_success".to_string(),
            read(&self.num_flood_pub_success),
        );
        out.insert(
            "num_flood_pub_failure".to_string(),
            read(&self.num_flood_pub_failure),
        );
        out.insert("num_flood_peers".to_string(), read(&self.num_flood_peers));
        out.insert(
            "num_client_connection_failure".to_string(),
            read(&self.num_client_connection_failure),
        );
        out.insert("num_missing_keys".to_string(), read(&self.num_missing_keys));
        out.insert("num_dual_messages".to_string(), read(&self.num_dual_messages));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_contains_contract_keys() {
        let counters = AreaCounters::new();
        AreaCounters::bump(&counters.received_publications);
        AreaCounters::add(&counters.received_key_vals, 5);

        let snap = counters.snapshot(3, 2);
        assert_eq!(snap["num_keys"], 3);
        assert_eq!(snap["num_peers"], 2);
        assert_eq!(snap["received_publications"], 1);
        assert_eq!(snap["received_key_vals"], 5);
        for key in [
            "updated_key_vals",
            "looped_publications",
            "expired_key_vals",
            "sent_publications",
            "rate_limit_suppress",
            "full_sync_duration_ms_avg",
            "num_full_sync_success",
            "num_full_sync_failure",
            "num_flood_pub_success",
            "num_flood_pub_failure",
            "num_client_connection_failure",
            "num_missing_keys",
            "num_flood_peers",
        ] {
            assert!(snap.contains_key(key), "missing counter {key}");
        }
    }

    #[test]
    fn test_full_sync_duration_avg() {
        let counters = AreaCounters::new();
        AreaCounters::add(&counters.full_sync_duration_ms_sum, 30);
        AreaCounters::add(&counters.num_full_sync_success, 2);
        let snap = counters.snapshot(0, 0);
        assert_eq!(snap["full_sync_duration_ms_avg"], 15);
    }
}
