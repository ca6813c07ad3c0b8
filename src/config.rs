//! Store configuration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::KvFilters;

/// Flood-stream token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloodRate {
    pub flood_msg_per_sec: f64,
    pub flood_msg_burst_size: f64,
}

/// Per-process store configuration. One instance is shared by every area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// This node's id; appears as originator on self-originated keys and
    /// in flood trails.
    pub node_id: String,
    /// Areas hosted by this node. Each gets an independent database.
    pub areas: HashSet<String>,
    /// Default lifetime for self-originated keys, in milliseconds.
    pub key_ttl_ms: i64,
    /// Subtracted from every flooded ttl so lifetime shrinks hop by hop.
    pub ttl_decrement_ms: i64,
    /// Flood rate limiting; `None` disables the limiter.
    pub flood_rate: Option<FloodRate>,
    /// Filter applied to inbound merges and outbound full-sync requests.
    pub filters: Option<KvFilters>,
    /// Serve the wildcard area "0" from a single configured area instead
    /// of rejecting it. Off by default.
    pub enable_default_area_fallback: bool,
}

impl KvStoreConfig {
    pub fn new(node_id: impl Into<String>, areas: impl IntoIterator<Item = String>) -> Self {
        Self {
            node_id: node_id.into(),
            areas: areas.into_iter().collect(),
            key_ttl_ms: 300_000,
            ttl_decrement_ms: 1,
            flood_rate: None,
            filters: None,
            enable_default_area_fallback: false,
        }
    }
}
