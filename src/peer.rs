//! Per-peer lifecycle state machine and bookkeeping.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::backoff::ExponentialBackoff;
use crate::constants::{INITIAL_BACKOFF, MAX_BACKOFF};
use crate::types::{PeerSpec, PeerState};

/// Events driving the peer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStateEvent {
    PeerAdd,
    SyncRespReceived,
    RpcError,
}

/// Sparse transition matrix. Rows are states, columns are events; an
/// invalid jump is a programming error and panics.
///
/// ```text
///              PEER_ADD   SYNC_RESP_RCVD   RPC_ERROR
/// IDLE         SYNCING    -                IDLE
/// SYNCING      -          INITIALIZED      IDLE
/// INITIALIZED  -          INITIALIZED      IDLE
/// ```
pub fn next_state(current: PeerState, event: PeerStateEvent) -> PeerState {
    match (current, event) {
        (PeerState::Idle, PeerStateEvent::PeerAdd) => PeerState::Syncing,
        (PeerState::Syncing, PeerStateEvent::SyncRespReceived) => PeerState::Initialized,
        (PeerState::Initialized, PeerStateEvent::SyncRespReceived) => PeerState::Initialized,
        (_, PeerStateEvent::RpcError) => PeerState::Idle,
        (state, event) => panic!("invalid peer state transition: {state} on {event:?}"),
    }
}

/// A peer within one area: its spec, reconnect backoff, live client
/// handle and the keys it missed while not yet initialized.
#[derive(Debug)]
pub struct Peer<C> {
    pub spec: PeerSpec,
    pub backoff: ExponentialBackoff,
    pub client: Option<Arc<C>>,
    pub keepalive: Option<JoinHandle<()>>,
    pub num_rpc_errors: u64,
    /// Keys flooded while this peer was still syncing; released through
    /// the finalize step of its next successful full-sync.
    pub pending_flood_keys: HashSet<String>,
}

impl<C> Peer<C> {
    pub fn new(spec: PeerSpec) -> Self {
        let mut spec = spec;
        spec.state = PeerState::Idle;
        Self {
            spec,
            backoff: ExponentialBackoff::new(INITIAL_BACKOFF, MAX_BACKOFF),
            client: None,
            keepalive: None,
            num_rpc_errors: 0,
            pending_flood_keys: HashSet::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.spec.state
    }

    /// Apply `event`, logging the transition once.
    pub fn transition(&mut self, peer_name: &str, area: &str, event: PeerStateEvent) -> PeerState {
        let old_state = self.spec.state;
        let new_state = next_state(old_state, event);
        self.spec.state = new_state;
        info!(
            area,
            peer = peer_name,
            "state change: [{old_state}] -> [{new_state}]"
        );
        new_state
    }

    /// Demotion housekeeping: a peer entering IDLE loses its client and
    /// keepalive and backs off before the next sync attempt.
    pub fn reset_to_idle(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        self.client = None;
        self.backoff.report_error();
    }
}

impl<C> Drop for Peer<C> {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }
}
