//! Timing and limit constants for the store core.

use std::time::Duration;

/// Wildcard area id. A node configured with exactly one area may serve
/// requests naming this area (or serve requests for its own area id when
/// it is itself configured as the wildcard), gated by
/// `KvStoreConfig::enable_default_area_fallback`.
pub const DEFAULT_AREA: &str = "0";

/// Initial retry backoff applied to peer RPC failures and key churn.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(64);

/// Upper bound for all exponential backoffs.
pub const MAX_BACKOFF: Duration = Duration::from_millis(8192);

/// Starting cap on concurrent outbound full-syncs per area.
///
/// Doubles on every full-sync success up to `PARALLEL_SYNC_LIMIT_MAX`,
/// never grows on failure.
pub const PARALLEL_SYNC_LIMIT_INITIAL: u32 = 2;

/// Hard ceiling for the parallel full-sync window.
pub const PARALLEL_SYNC_LIMIT_MAX: u32 = 32;

/// Coalescing window for throttled self-originated key advertisement and
/// ttl refresh batching.
pub const SYNC_THROTTLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Coalescing window for throttled unset (retract) batching.
pub const CLEAR_THROTTLE_TIMEOUT: Duration = Duration::from_millis(600);

/// Retry interval while a rate-limited publication sits in the flood
/// buffer waiting for tokens.
pub const FLOOD_PENDING_PUBLICATION: Duration = Duration::from_millis(100);

/// Longest the ttl-refresh timer may sleep with an empty refresh batch.
pub const MAX_TTL_UPDATE_INTERVAL: Duration = Duration::from_secs(300);

/// Interval between keepalive probes on an established peer client.
pub const CLIENT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Bound on a single outbound peer request, connection setup included.
pub const RPC_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest frame the reference transport will accept.
pub const MAX_WIRE_FRAME_BYTES: u32 = 64 * 1024 * 1024;
