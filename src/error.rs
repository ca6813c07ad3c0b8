//! Typed errors surfaced by the RPC surface.

use thiserror::Error;

/// Errors returned to synchronous RPC callers.
///
/// Background sync/flood failures never surface here; they drive peer
/// state transitions and counters instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvStoreError {
    /// Request names an area this node does not host and the default-area
    /// fallback did not apply.
    #[error("invalid area: {0}")]
    UnknownArea(String),

    /// Malformed request: empty peer list, bad filter, non-positive ttl,
    /// and similar caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store (or the owning area task) has been stopped.
    #[error("kvstore is stopped")]
    Stopped,
}

pub type Result<T, E = KvStoreError> = std::result::Result<T, E>;
