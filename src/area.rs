//! Per-area database actor.
//!
//! One tokio task owns every piece of an area's state: the key-value
//! map, the peer table, the ttl countdown queue, the flood limiter and
//! the self-originated cache. External callers talk to it through
//! [`AreaCmd`] messages; outbound peer RPCs run in spawned tasks whose
//! completions re-enter the actor as commands, so all state mutation
//! happens between suspension points of a single task.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::client::{PeerClient, RpcError};
use crate::config::KvStoreConfig;
use crate::constants::{
    CLEAR_THROTTLE_TIMEOUT, CLIENT_KEEPALIVE_INTERVAL, FLOOD_PENDING_PUBLICATION, MAX_BACKOFF,
    PARALLEL_SYNC_LIMIT_INITIAL, PARALLEL_SYNC_LIMIT_MAX, SYNC_THROTTLE_TIMEOUT,
};
use crate::counters::AreaCounters;
use crate::limiter::TokenBucket;
use crate::merge::{
    dump_all_with_filter, dump_difference, dump_hash_with_filter, ensure_hash, merge_key_values,
    update_publication_ttl,
};
use crate::peer::{Peer, PeerStateEvent};
use crate::self_originated::{PersistOutcome, SelfOriginatedStore};
use crate::ttl::TtlQueue;
use crate::types::{
    AreaSummary, KeyVals, KvFilters, KvStoreUpdate, LogSample, PeerSpec, PeerState, Publication,
    SyncEvent, Value,
};
use crate::wire::{DualMessages, FloodTopoSetParams, KeyDumpParams, KeySetParams};

/// Commands processed by an area task. RPC surface requests carry a
/// oneshot reply; internal completions and queue-driven requests do not.
pub(crate) enum AreaCmd<C> {
    AddPeers {
        peers: HashMap<String, PeerSpec>,
        reply: oneshot::Sender<()>,
    },
    DelPeers {
        peer_names: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    GetKeyVals {
        keys: Vec<String>,
        reply: oneshot::Sender<Publication>,
    },
    DumpKeys {
        params: KeyDumpParams,
        reply: oneshot::Sender<Publication>,
    },
    DumpHashes {
        params: KeyDumpParams,
        reply: oneshot::Sender<Publication>,
    },
    SetKeyVals {
        params: KeySetParams,
        reply: oneshot::Sender<()>,
    },
    GetPeerState {
        peer_name: String,
        reply: oneshot::Sender<Option<PeerState>>,
    },
    DumpPeers {
        reply: oneshot::Sender<HashMap<String, PeerSpec>>,
    },
    DumpSelfOriginated {
        reply: oneshot::Sender<HashMap<String, Value>>,
    },
    GetSummary {
        reply: oneshot::Sender<AreaSummary>,
    },
    GetCounters {
        reply: oneshot::Sender<BTreeMap<String, i64>>,
    },
    FloodTopoSet {
        params: FloodTopoSetParams,
        reply: oneshot::Sender<()>,
    },
    ProcessDual {
        messages: DualMessages,
        reply: oneshot::Sender<()>,
    },
    PersistKey {
        key: String,
        payload: Vec<u8>,
    },
    SetKey {
        key: String,
        payload: Vec<u8>,
        version: i64,
    },
    UnsetKey {
        key: String,
        payload: Vec<u8>,
    },
    EraseKey {
        key: String,
    },
    /// Root observed a peer event that left this area with zero peers;
    /// an empty area counts as initially synced.
    MarkSyncedIfNoPeers,
    FullSyncOutcome {
        peer_name: String,
        result: Result<(Arc<C>, Publication), RpcError>,
        elapsed: Duration,
    },
    FinalizeSyncOutcome {
        peer_name: String,
        result: Result<(), RpcError>,
    },
    FloodOutcome {
        peer_name: String,
        result: Result<(), RpcError>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// One-shot timer deadlines owned by the actor loop. `None` means the
/// timer is not armed.
#[derive(Debug, Default)]
struct Deadlines {
    sync: Option<Instant>,
    ttl_countdown: Option<Instant>,
    ttl_refresh: Option<Instant>,
    advertise: Option<Instant>,
    unset: Option<Instant>,
    flood_retry: Option<Instant>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct AreaDb<C: PeerClient> {
    node_id: String,
    area: String,
    config: Arc<KvStoreConfig>,
    counters: Arc<AreaCounters>,

    kv: BTreeMap<String, Value>,
    peers: HashMap<String, Peer<C>>,
    ttl_queue: TtlQueue,
    self_originated: SelfOriginatedStore,
    flood_limiter: Option<TokenBucket>,
    /// Rate-limited publications, coalesced by key per flood root.
    publication_buffer: HashMap<Option<String>, BTreeSet<String>>,
    parallel_sync_limit: u32,
    initial_sync_completed: bool,
    deadlines: Deadlines,

    self_tx: mpsc::UnboundedSender<AreaCmd<C>>,
    updates_tx: broadcast::Sender<KvStoreUpdate>,
    sync_events_tx: mpsc::UnboundedSender<SyncEvent>,
    log_tx: mpsc::UnboundedSender<LogSample>,
    /// Notifies the root barrier that this area finished initial sync.
    area_synced_tx: mpsc::UnboundedSender<String>,
}

impl<C: PeerClient> AreaDb<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        area: String,
        config: Arc<KvStoreConfig>,
        counters: Arc<AreaCounters>,
        updates_tx: broadcast::Sender<KvStoreUpdate>,
        sync_events_tx: mpsc::UnboundedSender<SyncEvent>,
        log_tx: mpsc::UnboundedSender<LogSample>,
        area_synced_tx: mpsc::UnboundedSender<String>,
    ) -> (mpsc::UnboundedSender<AreaCmd<C>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let db = AreaDb {
            node_id: config.node_id.clone(),
            area,
            flood_limiter: config
                .flood_rate
                .map(|rate| TokenBucket::new(rate.flood_msg_per_sec, rate.flood_msg_burst_size)),
            self_originated: SelfOriginatedStore::new(config.node_id.clone(), config.key_ttl_ms),
            config,
            counters,
            kv: BTreeMap::new(),
            peers: HashMap::new(),
            ttl_queue: TtlQueue::new(),
            publication_buffer: HashMap::new(),
            parallel_sync_limit: PARALLEL_SYNC_LIMIT_INITIAL,
            initial_sync_completed: false,
            deadlines: Deadlines::default(),
            self_tx: tx.clone(),
            updates_tx,
            sync_events_tx,
            log_tx,
            area_synced_tx,
        };
        let handle = tokio::spawn(db.run(rx));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AreaCmd<C>>) {
        info!(area = %self.area, node = %self.node_id, "starting area database");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None => break,
                    Some(AreaCmd::Stop { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_cmd(cmd),
                },
                _ = sleep_until_opt(self.deadlines.sync) => {
                    self.deadlines.sync = None;
                    self.request_peer_sync();
                }
                _ = sleep_until_opt(self.deadlines.ttl_countdown) => {
                    self.deadlines.ttl_countdown = None;
                    self.cleanup_ttl_queue();
                }
                _ = sleep_until_opt(self.deadlines.ttl_refresh) => {
                    self.deadlines.ttl_refresh = None;
                    self.advertise_ttl_updates();
                }
                _ = sleep_until_opt(self.deadlines.advertise) => {
                    self.deadlines.advertise = None;
                    self.advertise_self_originated_keys();
                }
                _ = sleep_until_opt(self.deadlines.unset) => {
                    self.deadlines.unset = None;
                    self.unset_pending_keys();
                }
                _ = sleep_until_opt(self.deadlines.flood_retry) => {
                    self.deadlines.flood_retry = None;
                    self.retry_buffered_floods();
                }
            }
        }
        // Dropping the peer table aborts every keepalive task; in-flight
        // RPC completions find their send target closed and vanish.
        self.peers.clear();
        info!(area = %self.area, "area database stopped");
    }

    fn handle_cmd(&mut self, cmd: AreaCmd<C>) {
        match cmd {
            AreaCmd::AddPeers { peers, reply } => {
                self.add_peers(peers);
                let _ = reply.send(());
            }
            AreaCmd::DelPeers { peer_names, reply } => {
                self.del_peers(peer_names);
                let _ = reply.send(());
            }
            AreaCmd::GetKeyVals { keys, reply } => {
                let _ = reply.send(self.get_key_vals(keys));
            }
            AreaCmd::DumpKeys { params, reply } => {
                let _ = reply.send(self.dump_keys(params));
            }
            AreaCmd::DumpHashes { params, reply } => {
                let _ = reply.send(self.dump_hashes(params));
            }
            AreaCmd::SetKeyVals { params, reply } => {
                self.set_key_vals(params);
                let _ = reply.send(());
            }
            AreaCmd::GetPeerState { peer_name, reply } => {
                let _ = reply.send(self.peers.get(&peer_name).map(Peer::state));
            }
            AreaCmd::DumpPeers { reply } => {
                let _ = reply.send(self.dump_peers());
            }
            AreaCmd::DumpSelfOriginated { reply } => {
                let _ = reply.send(self.self_originated.dump());
            }
            AreaCmd::GetSummary { reply } => {
                let _ = reply.send(self.summary());
            }
            AreaCmd::GetCounters { reply } => {
                let _ = reply.send(self.counters.snapshot(self.kv.len(), self.peers.len()));
            }
            AreaCmd::FloodTopoSet { params, reply } => {
                debug!(
                    area = %self.area,
                    root_id = %params.root_id,
                    src_id = %params.src_id,
                    "flood optimization disabled, ignoring topology hint"
                );
                let _ = reply.send(());
            }
            AreaCmd::ProcessDual { messages, reply } => {
                AreaCounters::bump(&self.counters.num_dual_messages);
                debug!(
                    area = %self.area,
                    bytes = messages.0.len(),
                    "flood optimization disabled, dropping dual message"
                );
                let _ = reply.send(());
            }
            AreaCmd::PersistKey { key, payload } => self.persist_self_originated_key(key, payload),
            AreaCmd::SetKey {
                key,
                payload,
                version,
            } => self.set_self_originated_key(key, payload, version),
            AreaCmd::UnsetKey { key, payload } => self.unset_self_originated_key(key, payload),
            AreaCmd::EraseKey { key } => self.erase_self_originated_key(&key),
            AreaCmd::MarkSyncedIfNoPeers => {
                if self.peers.is_empty() && !self.initial_sync_completed {
                    info!(area = %self.area, "no peers in area, treating initial sync as complete");
                    self.process_initialization_event();
                }
            }
            AreaCmd::FullSyncOutcome {
                peer_name,
                result,
                elapsed,
            } => self.process_full_sync_outcome(peer_name, result, elapsed),
            AreaCmd::FinalizeSyncOutcome { peer_name, result } => {
                self.process_finalize_outcome(peer_name, result)
            }
            AreaCmd::FloodOutcome { peer_name, result } => {
                self.process_flood_outcome(peer_name, result)
            }
            AreaCmd::Stop { .. } => unreachable!("Stop is intercepted by the run loop"),
        }
    }

    // ---- peer table -----------------------------------------------------

    fn add_peers(&mut self, peers: HashMap<String, PeerSpec>) {
        for (peer_name, mut spec) in peers {
            spec.state = PeerState::Idle;
            match self.peers.get_mut(&peer_name) {
                Some(peer) => {
                    info!(
                        area = %self.area,
                        peer = %peer_name,
                        peer_addr = %spec.peer_addr,
                        "peer update, resetting to IDLE"
                    );
                    if peer.spec.peer_addr != spec.peer_addr {
                        debug!(
                            area = %self.area,
                            old_addr = %peer.spec.peer_addr,
                            new_addr = %spec.peer_addr,
                            "peer address changed"
                        );
                    } else {
                        warn!(
                            area = %self.area,
                            peer = %peer_name,
                            "peer re-added, previous shutdown was non-graceful"
                        );
                    }
                    peer.spec = spec;
                    if let Some(keepalive) = peer.keepalive.take() {
                        keepalive.abort();
                    }
                    peer.client = None;
                }
                None => {
                    info!(
                        area = %self.area,
                        peer = %peer_name,
                        peer_addr = %spec.peer_addr,
                        supports_flood_opt = spec.supports_flood_opt,
                        "peer added"
                    );
                    self.peers.insert(peer_name, Peer::new(spec));
                }
            }
        }

        // Kick off the sync scan if it is not already armed.
        self.schedule_sync(Duration::ZERO);
    }

    fn del_peers(&mut self, peer_names: Vec<String>) {
        for peer_name in peer_names {
            match self.peers.remove(&peer_name) {
                Some(peer) => {
                    info!(
                        area = %self.area,
                        peer = %peer_name,
                        peer_addr = %peer.spec.peer_addr,
                        "peer deleted"
                    );
                    // Drop aborts the keepalive and releases the client;
                    // in-flight replies are ignored by the membership
                    // check in the outcome handlers.
                }
                None => {
                    warn!(
                        area = %self.area,
                        peer = %peer_name,
                        "attempt to delete non-existing peer, skipping"
                    );
                }
            }
        }
    }

    fn dump_peers(&self) -> HashMap<String, PeerSpec> {
        self.peers
            .iter()
            .map(|(name, peer)| (name.clone(), peer.spec.clone()))
            .collect()
    }

    fn peers_in_state(&self, state: PeerState) -> usize {
        self.peers.values().filter(|p| p.state() == state).count()
    }

    // ---- full sync ------------------------------------------------------

    /// Scan IDLE peers and promote those whose backoff allows a try into
    /// SYNCING, dispatching a digest-based full-sync request to each.
    /// Honors the parallel sync window.
    fn request_peer_sync(&mut self) {
        let mut timeout = MAX_BACKOFF;
        let mut num_syncing = self.peers_in_state(PeerState::Syncing) as u32;

        // Digests of the full local map go with every request.
        let digests = dump_hash_with_filter(&self.area, &self.kv, &KvFilters::default());
        let mut params = KeyDumpParams {
            sender_id: Some(self.node_id.clone()),
            key_val_hashes: Some(digests.key_vals),
            ..Default::default()
        };
        if let Some(filters) = &self.config.filters {
            params.keys = filters.key_prefixes.clone();
            params.originator_ids = filters.originator_ids.clone();
            params.operator = filters.operator;
        }

        let mut dispatched = Vec::new();
        for (peer_name, peer) in &mut self.peers {
            if peer.state() != PeerState::Idle {
                continue;
            }
            if !peer.backoff.can_try_now() {
                timeout = timeout.min(peer.backoff.time_remaining());
                continue;
            }

            peer.transition(peer_name, &self.area, PeerStateEvent::PeerAdd);
            num_syncing += 1;
            dispatched.push((peer_name.clone(), peer.spec.clone(), peer.client.clone()));

            if num_syncing > self.parallel_sync_limit {
                info!(
                    area = %self.area,
                    syncing = num_syncing,
                    limit = self.parallel_sync_limit,
                    "parallel sync window full, deferring remaining peers"
                );
                timeout = MAX_BACKOFF;
                break;
            }
        }

        for (peer_name, spec, client) in dispatched {
            AreaCounters::bump(&self.counters.num_full_sync);
            info!(area = %self.area, peer = %peer_name, "initiating full-sync request");
            self.spawn_full_sync(peer_name, spec, client, params.clone());
        }

        let num_idle = self.peers_in_state(PeerState::Idle) as u32;
        if num_idle > 0 || num_syncing > self.parallel_sync_limit {
            if num_idle > 0 {
                debug!(
                    area = %self.area,
                    idle = num_idle,
                    timeout_ms = timeout.as_millis() as u64,
                    "idle peers pending full-sync, rescheduling scan"
                );
            }
            self.schedule_sync(timeout);
        }
    }

    fn spawn_full_sync(
        &self,
        peer_name: String,
        spec: PeerSpec,
        client: Option<Arc<C>>,
        params: KeyDumpParams,
    ) {
        let area = self.area.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let result = async {
                let client = match client {
                    Some(existing) => existing,
                    None => Arc::new(C::connect(&spec).await?),
                };
                let publication = client.get_filtered_key_vals(&area, params).await?;
                Ok((client, publication))
            }
            .await;
            let _ = self_tx.send(AreaCmd::FullSyncOutcome {
                peer_name,
                result,
                elapsed: start.elapsed(),
            });
        });
    }

    /// Process a full-sync response: merge, counters, finalize the
    /// three-way handshake, promote the peer and widen the sync window.
    fn process_full_sync_outcome(
        &mut self,
        peer_name: String,
        result: Result<(Arc<C>, Publication), RpcError>,
        elapsed: Duration,
    ) {
        let (client, publication) = match result {
            Ok(ok) => ok,
            Err(err) => {
                AreaCounters::bump(&self.counters.num_full_sync_failure);
                if err.is_connect() {
                    AreaCounters::bump(&self.counters.num_client_connection_failure);
                }
                self.process_rpc_failure(&peer_name, "full-sync", &err);
                return;
            }
        };

        // A parallel adjacency flap can demote the peer back to IDLE
        // while this response was in flight; the fresh sync round owns
        // the promotion then.
        match self.peers.get_mut(&peer_name) {
            None => {
                warn!(area = %self.area, peer = %peer_name, "sync response for unknown peer, skipping");
                return;
            }
            Some(peer) if peer.state() == PeerState::Idle => {
                warn!(
                    area = %self.area,
                    peer = %peer_name,
                    "ignoring full-sync response for IDLE peer"
                );
                return;
            }
            Some(peer) => {
                peer.client = Some(client.clone());
                if peer.keepalive.is_none() {
                    peer.keepalive = Some(Self::spawn_keepalive(peer_name.clone(), client));
                }
            }
        }

        let num_missing_keys = publication
            .to_be_updated_keys
            .as_ref()
            .map_or(0, Vec::len);
        let num_key_vals = publication.key_vals.len();
        let updated = self.merge_publication(publication, Some(&peer_name));

        AreaCounters::bump(&self.counters.num_full_sync_success);
        AreaCounters::add(
            &self.counters.full_sync_duration_ms_sum,
            elapsed.as_millis() as u64,
        );
        AreaCounters::add(&self.counters.num_missing_keys, num_missing_keys as u64);

        info!(
            area = %self.area,
            peer = %peer_name,
            key_vals = num_key_vals,
            missing_keys = num_missing_keys,
            updated,
            elapsed_ms = elapsed.as_millis() as u64,
            "full-sync response processed"
        );

        if let Some(peer) = self.peers.get_mut(&peer_name) {
            peer.transition(&peer_name, &self.area, PeerStateEvent::SyncRespReceived);
            peer.backoff.report_success();
        }

        let _ = self.sync_events_tx.send(SyncEvent {
            peer_name: peer_name.clone(),
            area: self.area.clone(),
        });
        self.log_sync_event(&peer_name, elapsed);

        // Widen the window: the remaining syncs are expected to carry
        // small diffs.
        self.parallel_sync_limit =
            (self.parallel_sync_limit * 2).min(PARALLEL_SYNC_LIMIT_MAX);

        if self.peers_in_state(PeerState::Idle) > 0 {
            self.schedule_sync(Duration::ZERO);
        } else {
            self.deadlines.sync = None;
        }

        if !self.initial_sync_completed {
            self.process_initialization_event();
        }
    }

    /// Demote a peer after any failed outbound call: backoff, client
    /// release, RPC_ERROR transition, initialization re-check, sync
    /// timer re-arm.
    fn process_rpc_failure(&mut self, peer_name: &str, context: &str, err: &RpcError) {
        let Some(peer) = self.peers.get_mut(peer_name) else {
            return;
        };
        info!(
            area = %self.area,
            peer = %peer_name,
            context,
            error = %err,
            "peer request failed"
        );

        peer.reset_to_idle();
        peer.num_rpc_errors += 1;
        peer.transition(peer_name, &self.area, PeerStateEvent::RpcError);

        if !self.initial_sync_completed {
            self.process_initialization_event();
        }
        if self.deadlines.sync.is_none() {
            self.schedule_sync(Duration::ZERO);
        }
    }

    fn spawn_keepalive(peer_name: String, client: Arc<C>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLIENT_KEEPALIVE_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(err) = client.status().await {
                    debug!(peer = %peer_name, error = %err, "keepalive probe failed");
                }
            }
        })
    }

    /// Once every peer is INITIALIZED or has recorded at least one RPC
    /// error (or the area has no peers), the area is done with initial
    /// sync.
    fn process_initialization_event(&mut self) {
        let mut success_count = 0;
        let mut failure_count = 0;
        for peer in self.peers.values() {
            if peer.state() == PeerState::Initialized {
                success_count += 1;
            } else if peer.num_rpc_errors > 0 {
                failure_count += 1;
            } else {
                return;
            }
        }

        self.initial_sync_completed = true;
        info!(
            area = %self.area,
            synced = success_count,
            failed = failure_count,
            "initial synchronization completed"
        );
        let _ = self.area_synced_tx.send(self.area.clone());
    }

    /// Ship full values for the keys the peer asked back (step three of
    /// the handshake).
    fn finalize_full_sync(&mut self, keys: BTreeSet<String>, peer_name: &str) {
        let mut updates = Publication::new(&self.area);
        for key in &keys {
            if let Some(value) = self.kv.get(key) {
                updates.key_vals.insert(key.clone(), value.clone());
            }
        }
        update_publication_ttl(
            &self.ttl_queue,
            self.config.ttl_decrement_ms,
            &mut updates,
        );
        if updates.key_vals.is_empty() {
            return;
        }

        let Some(peer) = self.peers.get(peer_name) else {
            warn!(area = %self.area, peer = %peer_name, "cannot finalize sync with unknown peer");
            return;
        };
        let Some(client) = peer.client.clone() else {
            return;
        };
        if peer.state() == PeerState::Idle {
            return;
        }

        info!(
            area = %self.area,
            peer = %peer_name,
            keys = updates.key_vals.len(),
            "finalizing full-sync"
        );
        AreaCounters::bump(&self.counters.num_finalized_sync);

        let params = KeySetParams {
            key_vals: updates.key_vals,
            node_ids: Some(vec![self.node_id.clone()]),
            flood_root_id: None,
            timestamp_ms: Some(Utc::now().timestamp_millis()),
            sender_id: Some(self.node_id.clone()),
        };
        let area = self.area.clone();
        let self_tx = self.self_tx.clone();
        let peer_name = peer_name.to_string();
        tokio::spawn(async move {
            let result = client.set_key_vals(&area, params).await;
            let _ = self_tx.send(AreaCmd::FinalizeSyncOutcome { peer_name, result });
        });
    }

    fn process_finalize_outcome(&mut self, peer_name: String, result: Result<(), RpcError>) {
        match result {
            Ok(()) => {
                trace!(area = %self.area, peer = %peer_name, "finalize full-sync acked");
                AreaCounters::bump(&self.counters.num_finalized_sync_success);
            }
            Err(err) => {
                AreaCounters::bump(&self.counters.num_finalized_sync_failure);
                self.process_rpc_failure(&peer_name, "finalize-sync", &err);
            }
        }
    }

    // ---- merging and flooding -------------------------------------------

    /// Merge a received publication into the local map; flood a non-empty
    /// delta and answer the three-way handshake when the sender asked for
    /// keys back. Returns the number of updated key-vals.
    fn merge_publication(&mut self, rcvd: Publication, sender_id: Option<&str>) -> usize {
        AreaCounters::bump(&self.counters.received_publications);
        AreaCounters::add(&self.counters.received_key_vals, rcvd.key_vals.len() as u64);

        let mut keys_to_update: BTreeSet<String> = rcvd
            .to_be_updated_keys
            .iter()
            .flatten()
            .cloned()
            .collect();
        if let Some(sender) = sender_id {
            if let Some(peer) = self.peers.get_mut(sender) {
                keys_to_update.extend(peer.pending_flood_keys.drain());
            }
        }
        let need_finalize = sender_id.is_some() && !keys_to_update.is_empty();

        // Expired-key-only updates from local cleanup produce empty
        // key_vals; nothing to merge then.
        if rcvd.key_vals.is_empty() && !need_finalize {
            return 0;
        }

        if let Some(node_ids) = &rcvd.node_ids {
            if node_ids.iter().any(|id| id == &self.node_id) {
                AreaCounters::bump(&self.counters.looped_publications);
                trace!(area = %self.area, "dropping looped publication");
                return 0;
            }
        }

        let delta = merge_key_values(&mut self.kv, rcvd.key_vals, self.config.filters.as_ref());
        let update_count = delta.len();
        AreaCounters::add(&self.counters.updated_key_vals, update_count as u64);

        self.update_ttl_countdown(&delta);

        if update_count > 0 {
            let delta_publication = Publication {
                area: self.area.clone(),
                key_vals: delta,
                expired_keys: Vec::new(),
                node_ids: rcvd.node_ids,
                to_be_updated_keys: None,
                flood_root_id: rcvd.flood_root_id,
            };
            self.flood_publication(delta_publication, true);
        } else {
            AreaCounters::bump(&self.counters.received_redundant_publications);
        }

        if need_finalize {
            if let Some(sender) = sender_id {
                let sender = sender.to_string();
                self.finalize_full_sync(keys_to_update, &sender);
            }
        }

        update_count
    }

    /// Track finite-ttl values from a fresh delta and re-arm the
    /// countdown timer when a new earliest expiry appeared.
    fn update_ttl_countdown(&mut self, key_vals: &KeyVals) {
        let now = Instant::now();
        for (key, value) in key_vals {
            if let Some(expiry) = self.ttl_queue.push(now, key, value) {
                self.deadlines.ttl_countdown = Some(expiry);
            }
        }
    }

    /// Disseminate a publication: internal fan-out always, peer flood for
    /// value deltas, rate limiting with coalescing buffer in between.
    fn flood_publication(&mut self, publication: Publication, rate_limit: bool) {
        if rate_limit {
            if let Some(limiter) = &mut self.flood_limiter {
                if !limiter.try_consume() {
                    self.buffer_publication(publication);
                    self.deadlines.flood_retry =
                        Some(Instant::now() + FLOOD_PENDING_PUBLICATION);
                    return;
                }
            }
        }
        // Keep ordering: earlier buffered keys go out before this one.
        if !self.publication_buffer.is_empty() {
            self.buffer_publication(publication);
            self.flood_buffered_updates();
            return;
        }
        self.flood_now(publication);
    }

    fn flood_now(&mut self, mut publication: Publication) {
        update_publication_ttl(
            &self.ttl_queue,
            self.config.ttl_decrement_ms,
            &mut publication,
        );
        if publication.is_empty() {
            return;
        }

        // Last trail entry is the node we received this from; never send
        // it back in the same round.
        let sender_id = publication
            .node_ids
            .as_ref()
            .and_then(|trail| trail.last().cloned());
        publication
            .node_ids
            .get_or_insert_with(Vec::new)
            .push(self.node_id.clone());

        // Internal fan-out happens for every flood, expiry-only included.
        AreaCounters::bump(&self.counters.sent_publications);
        let _ = self
            .updates_tx
            .send(KvStoreUpdate::Publication(publication.clone()));

        // Echoed-back self-originated keys trigger re-advertisement.
        if self.self_originated.reconcile(&publication.key_vals) {
            self.schedule_advertise_throttled();
        }

        // Expired keys are local-only; peers age them out themselves.
        if publication.key_vals.is_empty() {
            return;
        }

        let params = KeySetParams {
            key_vals: publication.key_vals,
            node_ids: publication.node_ids,
            flood_root_id: publication.flood_root_id,
            timestamp_ms: Some(Utc::now().timestamp_millis()),
            sender_id: Some(self.node_id.clone()),
        };

        let mut flood_targets = Vec::new();
        for (peer_name, peer) in &mut self.peers {
            if sender_id.as_deref() == Some(peer_name.as_str()) {
                continue;
            }
            if peer.state() != PeerState::Initialized {
                // Queue the key names; they are shipped through the
                // finalize step of this peer's next full-sync.
                peer.pending_flood_keys
                    .extend(params.key_vals.keys().cloned());
                continue;
            }
            let Some(client) = peer.client.clone() else {
                warn!(
                    area = %self.area,
                    peer = %peer_name,
                    "initialized peer without client handle, skipping flood"
                );
                continue;
            };
            flood_targets.push((peer_name.clone(), client));
        }

        self.counters
            .num_flood_peers
            .store(flood_targets.len() as u64, Ordering::Relaxed);

        debug!(
            area = %self.area,
            key_vals = params.key_vals.len(),
            peers = flood_targets.len(),
            "flooding publication"
        );

        for (peer_name, client) in flood_targets {
            AreaCounters::bump(&self.counters.num_flood_pub);
            AreaCounters::add(
                &self.counters.sent_key_vals,
                params.key_vals.len() as u64,
            );
            let params = params.clone();
            let area = self.area.clone();
            let self_tx = self.self_tx.clone();
            tokio::spawn(async move {
                let result = client.set_key_vals(&area, params).await;
                let _ = self_tx.send(AreaCmd::FloodOutcome { peer_name, result });
            });
        }
    }

    fn process_flood_outcome(&mut self, peer_name: String, result: Result<(), RpcError>) {
        match result {
            Ok(()) => {
                trace!(area = %self.area, peer = %peer_name, "flood acked");
                AreaCounters::bump(&self.counters.num_flood_pub_success);
            }
            Err(err) => {
                AreaCounters::bump(&self.counters.num_flood_pub_failure);
                self.process_rpc_failure(&peer_name, "flood", &err);
            }
        }
    }

    fn buffer_publication(&mut self, publication: Publication) {
        AreaCounters::bump(&self.counters.rate_limit_suppress);
        let buffer = self
            .publication_buffer
            .entry(publication.flood_root_id.clone())
            .or_default();
        for key in publication.key_vals.keys() {
            buffer.insert(key.clone());
        }
        for key in publication.expired_keys {
            buffer.insert(key);
        }
    }

    /// Re-flood everything buffered, one merged publication per flood
    /// root, acting as a forwarder (no new root stamped, no rate limit).
    fn flood_buffered_updates(&mut self) {
        if self.publication_buffer.is_empty() {
            return;
        }
        let buffered = std::mem::take(&mut self.publication_buffer);
        for (flood_root_id, keys) in buffered {
            let mut publication = Publication::new(&self.area);
            publication.flood_root_id = flood_root_id;
            for key in keys {
                match self.kv.get(&key) {
                    Some(value) => {
                        publication.key_vals.insert(key, value.clone());
                    }
                    None => publication.expired_keys.push(key),
                }
            }
            self.flood_publication(publication, false);
        }
    }

    fn retry_buffered_floods(&mut self) {
        if let Some(limiter) = &mut self.flood_limiter {
            if !limiter.try_consume() {
                self.deadlines.flood_retry = Some(Instant::now() + FLOOD_PENDING_PUBLICATION);
                return;
            }
        }
        self.flood_buffered_updates();
    }

    // ---- ttl countdown --------------------------------------------------

    /// Drop expired keys and notify local subscribers. Queue entries that
    /// no longer describe the stored value are simply discarded.
    fn cleanup_ttl_queue(&mut self) {
        let now = Instant::now();
        let mut expired_keys = Vec::new();

        for entry in self.ttl_queue.pop_expired(now) {
            let still_live = self
                .kv
                .get(&entry.key)
                .map_or(false, |value| entry.matches(value));
            if still_live {
                let value = &self.kv[&entry.key];
                warn!(
                    area = %self.area,
                    key = %entry.key,
                    version = value.version,
                    originator = %value.originator_id,
                    ttl_version = value.ttl_version,
                    "deleting expired key"
                );
                self.log_kv_event("KEY_EXPIRE", &entry.key);
                self.kv.remove(&entry.key);
                expired_keys.push(entry.key);
            }
        }

        if let Some(next) = self.ttl_queue.next_expiry() {
            self.deadlines.ttl_countdown = Some(next);
        }

        if expired_keys.is_empty() {
            return;
        }
        AreaCounters::add(&self.counters.expired_key_vals, expired_keys.len() as u64);

        let mut publication = Publication::new(&self.area);
        publication.expired_keys = expired_keys;
        self.flood_publication(publication, true);
    }

    // ---- key get/set/dump -----------------------------------------------

    fn get_key_vals(&self, keys: Vec<String>) -> Publication {
        let mut publication = Publication::new(&self.area);
        for key in keys {
            if let Some(value) = self.kv.get(&key) {
                publication.key_vals.insert(key, value.clone());
            }
        }
        update_publication_ttl(
            &self.ttl_queue,
            self.config.ttl_decrement_ms,
            &mut publication,
        );
        publication
    }

    fn dump_keys(&self, params: KeyDumpParams) -> Publication {
        let filters = KvFilters {
            key_prefixes: params.keys.clone(),
            originator_ids: params.originator_ids.clone(),
            operator: params.operator,
        };
        let mut publication =
            dump_all_with_filter(&self.area, &self.kv, &filters, params.do_not_publish_value);
        if let Some(digests) = &params.key_val_hashes {
            publication = dump_difference(&self.area, publication.key_vals, digests);
            if params.keys.is_empty() {
                // Digest-carrying dumps with no key filter are full-sync
                // requests from peers.
                info!(
                    area = %self.area,
                    sender = params.sender_id.as_deref().unwrap_or(""),
                    digests = digests.len(),
                    key_vals = publication.key_vals.len(),
                    missing = publication.to_be_updated_keys.as_ref().map_or(0, Vec::len),
                    "served full-sync request"
                );
            }
        }
        update_publication_ttl(
            &self.ttl_queue,
            self.config.ttl_decrement_ms,
            &mut publication,
        );
        publication
    }

    fn dump_hashes(&self, params: KeyDumpParams) -> Publication {
        let filters = KvFilters {
            key_prefixes: params.keys,
            originator_ids: params.originator_ids,
            operator: params.operator,
        };
        let mut publication = dump_hash_with_filter(&self.area, &self.kv, &filters);
        update_publication_ttl(
            &self.ttl_queue,
            self.config.ttl_decrement_ms,
            &mut publication,
        );
        publication
    }

    /// Merge-and-flood entry point shared by the RPC surface and the
    /// self-originated advertisement paths.
    fn set_key_vals(&mut self, mut params: KeySetParams) {
        for value in params.key_vals.values_mut() {
            if value.payload.is_some() {
                value.hash = None;
                ensure_hash(value);
            }
        }
        let publication = Publication {
            area: self.area.clone(),
            key_vals: params.key_vals,
            expired_keys: Vec::new(),
            node_ids: params.node_ids,
            to_be_updated_keys: None,
            flood_root_id: params.flood_root_id,
        };
        self.merge_publication(publication, None);
    }

    /// Internal advertisement of self-originated values.
    fn advertise_key_vals(&mut self, key_vals: KeyVals) {
        if key_vals.is_empty() {
            return;
        }
        self.set_key_vals(KeySetParams {
            key_vals,
            ..Default::default()
        });
    }

    // ---- self-originated keys -------------------------------------------

    fn persist_self_originated_key(&mut self, key: String, payload: Vec<u8>) {
        trace!(area = %self.area, key = %key, "persist self-originated key");
        match self.self_originated.persist(&key, payload, &self.kv) {
            PersistOutcome::NoOp => {}
            PersistOutcome::Scheduled {
                refresh_immediately,
            } => {
                self.schedule_advertise_throttled();
                self.schedule_ttl_refresh(refresh_immediately);
            }
        }
    }

    fn set_self_originated_key(&mut self, key: String, payload: Vec<u8>, version: i64) {
        trace!(area = %self.area, key = %key, version, "set self-originated key");
        let value = self.self_originated.set(&key, payload, version, &self.kv);
        self.advertise_key_vals(KeyVals::from([(key, value)]));
        self.schedule_ttl_refresh(false);
    }

    fn unset_self_originated_key(&mut self, key: String, payload: Vec<u8>) {
        trace!(area = %self.area, key = %key, "unset self-originated key");
        if self.self_originated.unset(&key, payload, &self.kv) {
            if self.deadlines.unset.is_none() {
                self.deadlines.unset = Some(Instant::now() + CLEAR_THROTTLE_TIMEOUT);
            }
        }
    }

    fn erase_self_originated_key(&mut self, key: &str) {
        trace!(area = %self.area, key = %key, "erase self-originated key");
        self.self_originated.erase(key);
    }

    fn advertise_self_originated_keys(&mut self) {
        let (batch, next) = self.self_originated.drain_advertisements();
        self.self_originated.clear_elapsed_backoffs();
        debug!(
            area = %self.area,
            keys = batch.len(),
            "advertising self-originated keys"
        );
        self.advertise_key_vals(batch);
        if let Some(delay) = next {
            self.deadlines.advertise = Some(Instant::now() + delay);
        }
    }

    fn advertise_ttl_updates(&mut self) {
        let (batch, next) = self.self_originated.drain_ttl_refreshes();
        if !batch.is_empty() {
            debug!(
                area = %self.area,
                keys = batch.len(),
                "advertising ttl refreshes"
            );
            self.advertise_key_vals(batch);
        }
        self.deadlines.ttl_refresh = Some(Instant::now() + next);
    }

    fn unset_pending_keys(&mut self) {
        let batch = self.self_originated.drain_unsets();
        debug!(area = %self.area, keys = batch.len(), "unsetting retracted keys");
        self.advertise_key_vals(batch);
    }

    fn schedule_advertise_throttled(&mut self) {
        if self.deadlines.advertise.is_none() {
            self.deadlines.advertise = Some(Instant::now() + SYNC_THROTTLE_TIMEOUT);
        }
    }

    fn schedule_ttl_refresh(&mut self, immediately: bool) {
        let at = if immediately {
            Instant::now()
        } else {
            Instant::now() + SYNC_THROTTLE_TIMEOUT
        };
        if self.deadlines.ttl_refresh.map_or(true, |cur| at < cur) {
            self.deadlines.ttl_refresh = Some(at);
        }
    }

    fn schedule_sync(&mut self, delay: Duration) {
        let at = Instant::now() + delay;
        if self.deadlines.sync.map_or(true, |cur| at < cur) {
            self.deadlines.sync = Some(at);
        }
    }

    // ---- monitoring -----------------------------------------------------

    fn summary(&self) -> AreaSummary {
        let key_vals_bytes = self
            .kv
            .iter()
            .map(|(key, value)| {
                key.len()
                    + value.originator_id.len()
                    + value.payload.as_ref().map_or(0, Vec::len)
                    + std::mem::size_of::<Value>()
            })
            .sum();
        AreaSummary {
            area: self.area.clone(),
            key_vals_count: self.kv.len(),
            key_vals_bytes,
            peers: self.dump_peers(),
        }
    }

    fn log_sync_event(&self, peer_name: &str, duration: Duration) {
        let mut sample = LogSample::new();
        sample.add_string("event", "KVSTORE_FULL_SYNC");
        sample.add_string("area", &self.area);
        sample.add_string("node_name", &self.node_id);
        sample.add_string("neighbor", peer_name);
        sample.add_int("duration_ms", duration.as_millis() as i64);
        let _ = self.log_tx.send(sample);
    }

    fn log_kv_event(&self, event: &str, key: &str) {
        let mut sample = LogSample::new();
        sample.add_string("event", event);
        sample.add_string("area", &self.area);
        sample.add_string("node_name", &self.node_id);
        sample.add_string("key", key);
        let _ = self.log_tx.send(sample);
    }
}
