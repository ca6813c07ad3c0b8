//! MeshKV - the replicated key-value store core of a link-state routing
//! daemon.
//!
//! MeshKV keeps an eventually consistent, area-partitioned key-value
//! database replicated across directly connected neighbors. It owns the
//! hard parts of the control plane's shared database: peer lifecycle
//! state machines, rate-limited flooding with loop suppression, the
//! three-way full-sync handshake, ttl-based garbage collection, and
//! self-originated key management. Route computation, neighbor
//! discovery and forwarding-plane programming are external collaborators
//! that talk to it through injected queues and the RPC surface.
//!
//! # Key properties
//!
//! - **Peer-to-peer**: no leader; every node merges and floods under one
//!   total order over values, so merge is commutative and convergent
//! - **Area-partitioned**: each area runs an independent database on its
//!   own task; no locks cross areas
//! - **Transport-agnostic**: outbound RPC goes through the [`PeerClient`]
//!   trait; a reference TCP transport ships in [`net`]
//! - **Self-healing**: full sync on peer-add, exponential backoff on
//!   failure, ttl refresh for self-originated keys
//!
//! # Quick start
//!
//! ```no_run
//! use meshkv::{KvStore, KvStoreConfig, TcpPeerClient};
//! use tokio::sync::{broadcast, mpsc};
//!
//! # async fn example() {
//! let config = KvStoreConfig::new("node-1", ["default".to_string()]);
//! let (updates_tx, mut updates_rx) = broadcast::channel(1024);
//! let (sync_events_tx, _sync_events_rx) = mpsc::unbounded_channel();
//! let (log_tx, _log_rx) = mpsc::unbounded_channel();
//! let (_peer_tx, peer_rx) = mpsc::unbounded_channel();
//! let (_kv_req_tx, kv_req_rx) = mpsc::unbounded_channel();
//!
//! let store: KvStore<TcpPeerClient> =
//!     KvStore::new(config, updates_tx, sync_events_tx, log_tx, peer_rx, kv_req_rx);
//! store.start();
//!
//! while let Ok(update) = updates_rx.recv().await {
//!     // feed the decision engine
//!     let _ = update;
//! }
//! # }
//! ```

pub mod area;
pub mod backoff;
pub mod client;
pub mod config;
pub mod constants;
pub mod counters;
pub mod error;
pub mod limiter;
pub mod merge;
pub mod net;
pub mod peer;
pub mod self_originated;
pub mod store;
pub mod ttl;
pub mod types;
pub mod wire;

pub use client::{PeerClient, RpcError};
pub use config::{FloodRate, KvStoreConfig};
pub use error::KvStoreError;
pub use net::TcpPeerClient;
pub use store::KvStore;
pub use types::{
    AreaPeerEvent, KeyValueRequest, KvFilters, KvStoreUpdate, PeerEvent, PeerSpec, PeerState,
    Publication, SyncEvent, Value, TTL_INFINITY,
};
