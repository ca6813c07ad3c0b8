use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Sentinel ttl meaning "never expires". Values carrying it are kept out
/// of the ttl countdown queue entirely.
pub const TTL_INFINITY: i64 = i64::MAX;

/// The unit of replication.
///
/// A `Value` with no payload is a ttl refresh: it can only prolong the
/// life of an identical `(version, originator_id, payload)` already in
/// the map, never change it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Value {
    /// Monotonically increasing, starts at 1. Version 0 is invalid.
    pub version: i64,
    /// Node that authored this value.
    pub originator_id: String,
    /// Opaque bytes; `None` marks a ttl-refresh record.
    pub payload: Option<Vec<u8>>,
    /// Remaining lifetime in milliseconds, or [`TTL_INFINITY`].
    pub ttl_ms: i64,
    /// Bumped on each ttl refresh of an otherwise identical value.
    pub ttl_version: i64,
    /// Fingerprint over `(version, originator_id, payload)`. Regenerated
    /// on merge when missing.
    pub hash: Option<i64>,
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("version", &self.version)
            .field("originator_id", &self.originator_id)
            .field("payload", &self.payload.as_ref().map(|p| p.len()))
            .field("ttl_ms", &self.ttl_ms)
            .field("ttl_version", &self.ttl_version)
            .field("hash", &self.hash)
            .finish()
    }
}

impl Value {
    pub fn new(
        version: i64,
        originator_id: impl Into<String>,
        payload: Option<Vec<u8>>,
        ttl_ms: i64,
        ttl_version: i64,
    ) -> Self {
        Self {
            version,
            originator_id: originator_id.into(),
            payload,
            ttl_ms,
            ttl_version,
            hash: None,
        }
    }

    /// A positive ttl or the infinity sentinel is acceptable; everything
    /// else is rejected at merge time.
    pub fn ttl_is_valid(&self) -> bool {
        self.ttl_ms > 0
    }

    /// Strip the payload, keeping metadata and hash. Used by hash dumps
    /// and ttl-only deltas.
    pub fn without_payload(&self) -> Self {
        Self {
            payload: None,
            ..self.clone()
        }
    }
}

/// Total order over competing values for one key.
///
/// Compares `(version, originator_id, payload)` lexicographically; a full
/// tie falls through to `ttl_version`, which prolongs life but never
/// changes the stored payload.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match a.version.cmp(&b.version) {
        Ordering::Equal => match a.originator_id.cmp(&b.originator_id) {
            Ordering::Equal => match a.payload.cmp(&b.payload) {
                Ordering::Equal => a.ttl_version.cmp(&b.ttl_version),
                payload_ord => payload_ord,
            },
            originator_ord => originator_ord,
        },
        version_ord => version_ord,
    }
}

pub type KeyVals = HashMap<String, Value>;

/// Lifecycle of a peer within one area. Transitions are event-driven only;
/// see [`crate::peer::next_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    Idle,
    Syncing,
    Initialized,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Idle => "IDLE",
            PeerState::Syncing => "SYNCING",
            PeerState::Initialized => "INITIALIZED",
        };
        f.write_str(name)
    }
}

/// How to reach a peer, plus its replicated-store lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub peer_addr: String,
    pub ctrl_port: u16,
    pub state: PeerState,
    /// Carried for wire compatibility; this build floods to every
    /// initialized peer regardless.
    pub supports_flood_opt: bool,
}

impl PeerSpec {
    pub fn new(peer_addr: impl Into<String>, ctrl_port: u16) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            ctrl_port,
            state: PeerState::Idle,
            supports_flood_opt: false,
        }
    }
}

/// Boolean combinator for [`KvFilters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    Or,
    And,
}

impl Default for FilterOperator {
    fn default() -> Self {
        FilterOperator::Or
    }
}

/// Key-prefix and originator filter applied to dumps, syncs and merges.
///
/// Empty prefix list matches every key; empty originator set matches
/// every originator. `Or` accepts a pair matching either dimension,
/// `And` requires both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvFilters {
    pub key_prefixes: Vec<String>,
    pub originator_ids: HashSet<String>,
    pub operator: FilterOperator,
}

impl KvFilters {
    pub fn new(key_prefixes: Vec<String>, originator_ids: HashSet<String>) -> Self {
        Self {
            key_prefixes,
            originator_ids,
            operator: FilterOperator::Or,
        }
    }

    pub fn with_operator(mut self, operator: FilterOperator) -> Self {
        self.operator = operator;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.key_prefixes.is_empty() && self.originator_ids.is_empty()
    }

    fn key_matches(&self, key: &str) -> bool {
        self.key_prefixes.is_empty() || self.key_prefixes.iter().any(|p| key.starts_with(p))
    }

    fn originator_matches(&self, value: &Value) -> bool {
        self.originator_ids.is_empty() || self.originator_ids.contains(&value.originator_id)
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self.operator {
            FilterOperator::Or => {
                if self.key_prefixes.is_empty() && self.originator_ids.is_empty() {
                    return true;
                }
                (!self.key_prefixes.is_empty() && self.key_matches(key))
                    || (!self.originator_ids.is_empty() && self.originator_matches(value))
            }
            FilterOperator::And => self.key_matches(key) && self.originator_matches(value),
        }
    }
}

/// A batch of store changes, flooded to peers and fanned out to local
/// subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub area: String,
    pub key_vals: KeyVals,
    /// Keys removed by ttl cleanup. Never flooded to peers.
    pub expired_keys: Vec<String>,
    /// Ordered trail of node ids this publication traversed.
    pub node_ids: Option<Vec<String>>,
    /// Keys the responder wants back in full (three-way sync step 2).
    pub to_be_updated_keys: Option<Vec<String>>,
    pub flood_root_id: Option<String>,
}

impl Publication {
    pub fn new(area: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

/// Items pushed on `kv_store_updates_out`.
#[derive(Debug, Clone, PartialEq)]
pub enum KvStoreUpdate {
    Publication(Publication),
    /// One-shot marker: every configured area has finished (or has no
    /// peers to finish with) its initial sync.
    Synced,
}

/// Per-peer full-sync completion, pushed on `kv_store_sync_events_out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub peer_name: String,
    pub area: String,
}

/// Peer-table delta for one area.
#[derive(Debug, Clone, Default)]
pub struct AreaPeerEvent {
    pub peers_to_add: HashMap<String, PeerSpec>,
    pub peers_to_del: Vec<String>,
}

/// Item consumed from `peer_updates_in`: area to peer-table delta.
pub type PeerEvent = HashMap<String, AreaPeerEvent>;

/// Item consumed from `key_value_requests_in`.
#[derive(Debug, Clone)]
pub enum KeyValueRequest {
    /// Advertise and keep refreshed until unset/erased.
    Persist {
        area: String,
        key: String,
        payload: Vec<u8>,
    },
    /// One-shot advertisement with caller-specified version (0 = auto).
    Set {
        area: String,
        key: String,
        payload: Vec<u8>,
        version: i64,
    },
    /// Advertise a final replacement value, then stop refreshing.
    Unset {
        area: String,
        key: String,
        payload: Vec<u8>,
    },
    /// Drop from the self-originated cache without advertising.
    Erase { area: String, key: String },
}

impl KeyValueRequest {
    pub fn area(&self) -> &str {
        match self {
            KeyValueRequest::Persist { area, .. }
            | KeyValueRequest::Set { area, .. }
            | KeyValueRequest::Unset { area, .. }
            | KeyValueRequest::Erase { area, .. } => area,
        }
    }
}

/// Structured telemetry record pushed on `log_samples_out`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSample {
    pairs: BTreeMap<String, LogValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogValue {
    Str(String),
    Int(i64),
}

impl LogSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(key.into(), LogValue::Str(value.into()));
    }

    pub fn add_int(&mut self, key: impl Into<String>, value: i64) {
        self.pairs.insert(key.into(), LogValue::Int(value));
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.pairs.get(key) {
            Some(LogValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.pairs.get(key) {
            Some(LogValue::Int(i)) => Some(*i),
            _ => None,
        }
    }
}

/// Per-area summary returned by `get_area_summary`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaSummary {
    pub area: String,
    pub key_vals_count: usize,
    pub key_vals_bytes: usize,
    pub peers: HashMap<String, PeerSpec>,
}
