//! Pure key-value reconciliation and dump helpers.
//!
//! `merge_key_values` is the single conflict-resolution point of the
//! store: every inbound publication, full-sync response and local
//! advertisement funnels through it. It is total — bad input is skipped,
//! never an error.

use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::debug;

use crate::ttl::TtlQueue;
use crate::types::{KeyVals, KvFilters, Publication, Value, TTL_INFINITY};

/// Deterministic fingerprint over `(version, originator_id, payload)`.
pub fn generate_hash(version: i64, originator_id: &str, payload: Option<&[u8]>) -> i64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_be_bytes());
    hasher.update(originator_id.as_bytes());
    match payload {
        Some(bytes) => {
            hasher.update(&[1]);
            hasher.update(bytes);
        }
        None => hasher.update(&[0]),
    }
    i64::from(hasher.finalize())
}

/// Fill in `value.hash` when the sender omitted it.
pub fn ensure_hash(value: &mut Value) {
    if value.hash.is_none() {
        value.hash = Some(generate_hash(
            value.version,
            &value.originator_id,
            value.payload.as_deref(),
        ));
    }
}

enum MergeDecision {
    Skip,
    UpdateAll,
    UpdateTtl,
}

fn decide(current: Option<&Value>, incoming: &Value) -> MergeDecision {
    let Some(current) = current else {
        // A ttl refresh cannot create a key.
        return if incoming.payload.is_some() {
            MergeDecision::UpdateAll
        } else {
            MergeDecision::Skip
        };
    };

    if incoming.version < current.version {
        return MergeDecision::Skip;
    }
    if incoming.version > current.version {
        return if incoming.payload.is_some() {
            MergeDecision::UpdateAll
        } else {
            MergeDecision::Skip
        };
    }

    // Same version: originator is the next tiebreaker.
    match incoming.originator_id.cmp(&current.originator_id) {
        std::cmp::Ordering::Greater if incoming.payload.is_some() => {
            return MergeDecision::UpdateAll
        }
        std::cmp::Ordering::Equal => {}
        _ => return MergeDecision::Skip,
    }

    // Same (version, originator).
    match (&incoming.payload, &current.payload) {
        (Some(inc), Some(cur)) => {
            if inc > cur {
                MergeDecision::UpdateAll
            } else if inc == cur && incoming.ttl_version > current.ttl_version {
                MergeDecision::UpdateTtl
            } else {
                MergeDecision::Skip
            }
        }
        // TTL refresh of an identical value: hashes must agree before the
        // refresh is accepted.
        (None, Some(_)) => {
            let hashes_agree = match (incoming.hash, current.hash) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            };
            if hashes_agree && incoming.ttl_version > current.ttl_version {
                MergeDecision::UpdateTtl
            } else {
                MergeDecision::Skip
            }
        }
        _ => MergeDecision::Skip,
    }
}

/// Merge `incoming` into `kv`, returning the subset that changed the map.
///
/// Full replacements appear in the delta with their payload; ttl-only
/// updates appear payload-less, carrying the refreshed ttl fields on the
/// stored value's identity.
pub fn merge_key_values(
    kv: &mut BTreeMap<String, Value>,
    incoming: KeyVals,
    filters: Option<&KvFilters>,
) -> KeyVals {
    let mut delta = KeyVals::new();

    for (key, mut value) in incoming {
        if let Some(filters) = filters {
            if !filters.matches(&key, &value) {
                debug!(key, "merge skipped by filter");
                continue;
            }
        }
        if !value.ttl_is_valid() {
            debug!(key, ttl_ms = value.ttl_ms, "merge skipped invalid ttl");
            continue;
        }

        match decide(kv.get(&key), &value) {
            MergeDecision::Skip => {}
            MergeDecision::UpdateAll => {
                ensure_hash(&mut value);
                kv.insert(key.clone(), value.clone());
                delta.insert(key, value);
            }
            MergeDecision::UpdateTtl => {
                let stored = kv
                    .get_mut(&key)
                    .expect("ttl update decided against an existing entry");
                stored.ttl_ms = value.ttl_ms;
                stored.ttl_version = value.ttl_version;
                delta.insert(key, stored.without_payload());
            }
        }
    }

    delta
}

/// Filtered full dump of the map. With `do_not_publish_value` the
/// payloads are stripped (metadata plus hash only).
pub fn dump_all_with_filter(
    area: &str,
    kv: &BTreeMap<String, Value>,
    filters: &KvFilters,
    do_not_publish_value: bool,
) -> Publication {
    let mut publication = Publication::new(area);
    for (key, value) in kv {
        if !filters.matches(key, value) {
            continue;
        }
        let value = if do_not_publish_value {
            value.without_payload()
        } else {
            value.clone()
        };
        publication.key_vals.insert(key.clone(), value);
    }
    publication
}

/// Filtered digest dump: every value stripped to metadata plus hash.
pub fn dump_hash_with_filter(
    area: &str,
    kv: &BTreeMap<String, Value>,
    filters: &KvFilters,
) -> Publication {
    dump_all_with_filter(area, kv, filters, true)
}

enum DigestOrder {
    Newer,
    Older,
    InSync,
    /// Same `(version, originator)` but hashes disagree; payloads cannot
    /// be ordered from a digest, so both sides exchange full values.
    Unknown,
}

fn compare_with_digest(mine: &Value, digest: &Value) -> DigestOrder {
    match mine.version.cmp(&digest.version) {
        std::cmp::Ordering::Greater => return DigestOrder::Newer,
        std::cmp::Ordering::Less => return DigestOrder::Older,
        std::cmp::Ordering::Equal => {}
    }
    match mine.originator_id.cmp(&digest.originator_id) {
        std::cmp::Ordering::Greater => return DigestOrder::Newer,
        std::cmp::Ordering::Less => return DigestOrder::Older,
        std::cmp::Ordering::Equal => {}
    }
    let hashes_agree = match (mine.hash, digest.hash) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    };
    if !hashes_agree {
        return DigestOrder::Unknown;
    }
    match mine.ttl_version.cmp(&digest.ttl_version) {
        std::cmp::Ordering::Greater => DigestOrder::Newer,
        std::cmp::Ordering::Less => DigestOrder::Older,
        std::cmp::Ordering::Equal => DigestOrder::InSync,
    }
}

/// Compute the set difference against a requester's digests (three-way
/// full-sync, responder side).
///
/// `key_vals` carries full values the requester is missing or holds stale;
/// `to_be_updated_keys` names keys where the requester's digest wins and
/// the responder wants the full value shipped back.
pub fn dump_difference(area: &str, my_key_vals: KeyVals, digests: &KeyVals) -> Publication {
    let mut publication = Publication::new(area);
    let mut to_request: Vec<String> = Vec::new();

    // Keys the requester holds that we have never seen.
    for key in digests.keys() {
        if !my_key_vals.contains_key(key) {
            to_request.push(key.clone());
        }
    }

    for (key, mine) in my_key_vals {
        match digests.get(&key) {
            None => {
                publication.key_vals.insert(key, mine);
            }
            Some(digest) => match compare_with_digest(&mine, digest) {
                DigestOrder::Newer => {
                    publication.key_vals.insert(key, mine);
                }
                DigestOrder::Older => to_request.push(key),
                DigestOrder::InSync => {}
                DigestOrder::Unknown => {
                    to_request.push(key.clone());
                    publication.key_vals.insert(key, mine);
                }
            },
        }
    }

    to_request.sort_unstable();
    publication.to_be_updated_keys = Some(to_request);
    publication
}

/// Rewrite every finite ttl in `publication` to the remaining lifetime of
/// its countdown entry minus `ttl_decrement_ms`, dropping keys that are
/// about to expire or are no longer tracked. Guarantees ttl decreases
/// monotonically hop by hop.
pub fn update_publication_ttl(
    queue: &TtlQueue,
    ttl_decrement_ms: i64,
    publication: &mut Publication,
) {
    let now = Instant::now();
    publication.key_vals.retain(|key, value| {
        if value.ttl_ms == TTL_INFINITY {
            return true;
        }
        match queue.remaining_ttl_ms(now, key, value) {
            Some(remaining) if remaining > ttl_decrement_ms => {
                value.ttl_ms = remaining - ttl_decrement_ms;
                true
            }
            _ => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(version: i64, originator: &str, payload: Option<&[u8]>, ttl_version: i64) -> Value {
        Value::new(
            version,
            originator,
            payload.map(<[u8]>::to_vec),
            60_000,
            ttl_version,
        )
    }

    fn hashed(mut v: Value) -> Value {
        ensure_hash(&mut v);
        v
    }

    #[test]
    fn test_higher_version_wins() {
        let mut kv = BTreeMap::new();
        kv.insert("k".to_string(), hashed(value(3, "z", Some(b"old"), 0)));

        let incoming = KeyVals::from([("k".to_string(), value(4, "a", Some(b"new"), 0))]);
        let delta = merge_key_values(&mut kv, incoming, None);

        assert_eq!(delta.len(), 1);
        assert_eq!(kv["k"].payload.as_deref(), Some(b"new".as_ref()));
        assert_eq!(kv["k"].version, 4);
    }

    #[test]
    fn test_lower_version_skipped() {
        let mut kv = BTreeMap::new();
        kv.insert("k".to_string(), hashed(value(5, "a", Some(b"cur"), 0)));

        let delta = merge_key_values(
            &mut kv,
            KeyVals::from([("k".to_string(), value(4, "z", Some(b"stale"), 9))]),
            None,
        );
        assert!(delta.is_empty());
        assert_eq!(kv["k"].payload.as_deref(), Some(b"cur".as_ref()));
    }

    #[test]
    fn test_originator_tiebreak() {
        let mut kv = BTreeMap::new();
        kv.insert("k".to_string(), hashed(value(2, "alpha", Some(b"a"), 0)));

        let delta = merge_key_values(
            &mut kv,
            KeyVals::from([("k".to_string(), value(2, "beta", Some(b"b"), 0))]),
            None,
        );
        assert_eq!(delta.len(), 1);
        assert_eq!(kv["k"].originator_id, "beta");
    }

    #[test]
    fn test_ttl_refresh_updates_ttl_only() {
        let mut kv = BTreeMap::new();
        let stored = hashed(value(2, "a", Some(b"p"), 5));
        kv.insert("k".to_string(), stored.clone());

        let mut refresh = value(2, "a", None, 7);
        refresh.ttl_ms = 30_000;
        refresh.hash = stored.hash;

        let delta = merge_key_values(&mut kv, KeyVals::from([("k".to_string(), refresh)]), None);

        assert_eq!(kv["k"].payload.as_deref(), Some(b"p".as_ref()));
        assert_eq!(kv["k"].ttl_version, 7);
        assert_eq!(kv["k"].ttl_ms, 30_000);
        let d = &delta["k"];
        assert!(d.payload.is_none());
        assert_eq!(d.ttl_version, 7);
    }

    #[test]
    fn test_ttl_refresh_cannot_create_key() {
        let mut kv = BTreeMap::new();
        let delta = merge_key_values(
            &mut kv,
            KeyVals::from([("ghost".to_string(), value(1, "a", None, 1))]),
            None,
        );
        assert!(delta.is_empty());
        assert!(kv.is_empty());
    }

    #[test]
    fn test_invalid_ttl_skipped() {
        let mut kv = BTreeMap::new();
        let mut bad = value(1, "a", Some(b"x"), 0);
        bad.ttl_ms = 0;
        let delta = merge_key_values(&mut kv, KeyVals::from([("k".to_string(), bad)]), None);
        assert!(delta.is_empty());
        assert!(kv.is_empty());
    }

    #[test]
    fn test_merge_monotonicity() {
        // The surviving value is the maximum of everything ever merged,
        // whatever the arrival order.
        let candidates = vec![
            value(1, "a", Some(b"one"), 0),
            value(3, "a", Some(b"three"), 0),
            value(2, "z", Some(b"two"), 4),
            value(3, "b", Some(b"three-b"), 0),
        ];
        let mut forward = BTreeMap::new();
        for v in &candidates {
            merge_key_values(
                &mut forward,
                KeyVals::from([("k".to_string(), v.clone())]),
                None,
            );
        }
        let mut reverse = BTreeMap::new();
        for v in candidates.iter().rev() {
            merge_key_values(
                &mut reverse,
                KeyVals::from([("k".to_string(), v.clone())]),
                None,
            );
        }
        assert_eq!(forward["k"].payload, reverse["k"].payload);
        assert_eq!(forward["k"].originator_id, "b");
        assert_eq!(forward["k"].version, 3);
    }

    #[test]
    fn test_merge_respects_filter() {
        let filters = KvFilters::new(vec!["adj:".to_string()], Default::default());
        let mut kv = BTreeMap::new();
        let delta = merge_key_values(
            &mut kv,
            KeyVals::from([
                ("adj:1".to_string(), value(1, "a", Some(b"x"), 0)),
                ("prefix:1".to_string(), value(1, "a", Some(b"y"), 0)),
            ]),
            Some(&filters),
        );
        assert_eq!(delta.len(), 1);
        assert!(kv.contains_key("adj:1"));
        assert!(!kv.contains_key("prefix:1"));
    }

    #[test]
    fn test_hash_regenerated_on_merge() {
        let mut kv = BTreeMap::new();
        merge_key_values(
            &mut kv,
            KeyVals::from([("k".to_string(), value(1, "a", Some(b"x"), 0))]),
            None,
        );
        let expected = generate_hash(1, "a", Some(b"x"));
        assert_eq!(kv["k"].hash, Some(expected));
    }

    #[test]
    fn test_dump_difference_splits_both_directions() {
        let mine = KeyVals::from([
            ("both-mine-newer".to_string(), hashed(value(5, "a", Some(b"x"), 0))),
            ("both-theirs-newer".to_string(), hashed(value(1, "a", Some(b"x"), 0))),
            ("only-mine".to_string(), hashed(value(1, "a", Some(b"x"), 0))),
            ("in-sync".to_string(), hashed(value(2, "a", Some(b"x"), 1))),
        ]);
        let digests = KeyVals::from([
            (
                "both-mine-newer".to_string(),
                hashed(value(4, "a", Some(b"x"), 0)).without_payload(),
            ),
            (
                "both-theirs-newer".to_string(),
                hashed(value(3, "a", Some(b"x"), 0)).without_payload(),
            ),
            (
                "in-sync".to_string(),
                hashed(value(2, "a", Some(b"x"), 1)).without_payload(),
            ),
            (
                "only-theirs".to_string(),
                hashed(value(1, "a", Some(b"x"), 0)).without_payload(),
            ),
        ]);

        let pub_ = dump_difference("area", mine, &digests);
        assert!(pub_.key_vals.contains_key("both-mine-newer"));
        assert!(pub_.key_vals.contains_key("only-mine"));
        assert!(!pub_.key_vals.contains_key("in-sync"));
        let to_request = pub_.to_be_updated_keys.unwrap();
        assert!(to_request.contains(&"both-theirs-newer".to_string()));
        assert!(to_request.contains(&"only-theirs".to_string()));
        assert!(!to_request.contains(&"in-sync".to_string()));
    }

    #[test]
    fn test_update_publication_ttl_decrements_and_drops() {
        let mut kv = BTreeMap::new();
        let mut queue = TtlQueue::new();
        let now = Instant::now();

        let tracked = hashed(value(1, "a", Some(b"x"), 0));
        kv.insert("tracked".to_string(), tracked.clone());
        queue.push(now, "tracked", &tracked);

        let mut infinite = hashed(value(1, "a", Some(b"y"), 0));
        infinite.ttl_ms = TTL_INFINITY;

        let mut publication = Publication::new("area");
        publication.key_vals.insert("tracked".to_string(), tracked);
        publication
            .key_vals
            .insert("untracked".to_string(), hashed(value(1, "a", Some(b"z"), 0)));
        publication
            .key_vals
            .insert("infinite".to_string(), infinite);

        update_publication_ttl(&queue, 1, &mut publication);

        assert!(publication.key_vals.contains_key("tracked"));
        assert!(publication.key_vals["tracked"].ttl_ms < 60_000);
        assert!(!publication.key_vals.contains_key("untracked"));
        assert_eq!(publication.key_vals["infinite"].ttl_ms, TTL_INFINITY);
    }
}
