//! Abstract peer RPC capability.
//!
//! The store is generic over its client type, so any transport — the
//! bundled TCP one, or an in-process double in tests — plugs in by
//! implementing [`PeerClient`].

use std::future::Future;

use thiserror::Error;

use crate::types::{PeerSpec, Publication};
use crate::wire::{DualMessages, FloodTopoSetParams, KeyDumpParams, KeySetParams};

/// Failure of an outbound peer call. Never surfaced to RPC callers of the
/// local store; it demotes the peer to IDLE, applies backoff and bumps
/// counters.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode peer response: {0}")]
    Deserialize(String),
    #[error("peer rejected request: {0}")]
    Remote(String),
}

impl RpcError {
    pub fn is_connect(&self) -> bool {
        matches!(self, RpcError::Connect(_))
    }
}

/// Capability a peer connection must provide.
///
/// Implementations are cheap to clone behind `Arc`; every method is
/// invoked from spawned tasks and must be cancel-safe.
pub trait PeerClient: Send + Sync + Sized + 'static {
    /// Establish a connection described by `spec`.
    fn connect(spec: &PeerSpec) -> impl Future<Output = Result<Self, RpcError>> + Send;

    /// Filtered (digest-aware) dump from the peer; the full-sync request.
    fn get_filtered_key_vals(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> impl Future<Output = Result<Publication, RpcError>> + Send;

    /// Merge-and-flood on the peer; used by flooding and sync finalize.
    fn set_key_vals(
        &self,
        area: &str,
        params: KeySetParams,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Flood-topology hint for peers speaking the optimization protocol.
    fn flood_topo_set(
        &self,
        area: &str,
        params: FloodTopoSetParams,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Opaque spanning-tree message pass-through.
    fn process_dual(
        &self,
        area: &str,
        messages: DualMessages,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Transport-level liveness probe (keepalive).
    fn status(&self) -> impl Future<Output = Result<(), RpcError>> + Send;
}
