//! Store root: owns one [`AreaDb`](crate::area::AreaDb) actor per
//! configured area, consumes the inbound queues, and exposes the RPC
//! surface every operation of which names its target area.
//!
//! Lifecycle is explicit: `new` constructs the areas, `start` attaches
//! the queue readers and the initialization barrier, `stop` drains the
//! area actors. The struct is a cheap clonable handle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::area::{AreaCmd, AreaDb};
use crate::client::PeerClient;
use crate::config::KvStoreConfig;
use crate::constants::DEFAULT_AREA;
use crate::counters::AreaCounters;
use crate::error::KvStoreError;
use crate::types::{
    AreaSummary, KeyValueRequest, KvStoreUpdate, LogSample, PeerEvent, PeerSpec, PeerState,
    Publication, SyncEvent, Value,
};
use crate::wire::{DualMessages, FloodTopoSetParams, KeyDumpParams, KeySetParams};

struct AreaHandle<C: PeerClient> {
    cmd_tx: mpsc::UnboundedSender<AreaCmd<C>>,
}

struct Inner<C: PeerClient> {
    config: Arc<KvStoreConfig>,
    areas: HashMap<String, AreaHandle<C>>,
    updates_tx: broadcast::Sender<KvStoreUpdate>,
    /// Area tasks plus, after `start`, the queue readers and barrier.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Receivers parked between `new` and `start`.
    pending: Mutex<Option<PendingReceivers>>,
}

struct PendingReceivers {
    peer_updates_rx: mpsc::UnboundedReceiver<PeerEvent>,
    key_value_requests_rx: mpsc::UnboundedReceiver<KeyValueRequest>,
    area_synced_rx: mpsc::UnboundedReceiver<String>,
}

/// The process-wide replicated store. Clone handles freely; all clones
/// talk to the same area actors.
pub struct KvStore<C: PeerClient> {
    inner: Arc<Inner<C>>,
}

impl<C: PeerClient> Clone for KvStore<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: PeerClient> KvStore<C> {
    /// Construct the store with every queue injected. One area actor is
    /// spawned per configured area; queue consumption begins at
    /// [`start`](Self::start).
    pub fn new(
        config: KvStoreConfig,
        updates_tx: broadcast::Sender<KvStoreUpdate>,
        sync_events_tx: mpsc::UnboundedSender<SyncEvent>,
        log_samples_tx: mpsc::UnboundedSender<LogSample>,
        peer_updates_rx: mpsc::UnboundedReceiver<PeerEvent>,
        key_value_requests_rx: mpsc::UnboundedReceiver<KeyValueRequest>,
    ) -> Self {
        let config = Arc::new(config);
        let (area_synced_tx, area_synced_rx) = mpsc::unbounded_channel();

        let mut areas = HashMap::new();
        let mut tasks = Vec::new();
        for area in &config.areas {
            let counters = Arc::new(AreaCounters::new());
            let (cmd_tx, task) = AreaDb::<C>::spawn(
                area.clone(),
                Arc::clone(&config),
                counters,
                updates_tx.clone(),
                sync_events_tx.clone(),
                log_samples_tx.clone(),
                area_synced_tx.clone(),
            );
            areas.insert(area.clone(), AreaHandle { cmd_tx });
            tasks.push(task);
        }

        Self {
            inner: Arc::new(Inner {
                config,
                areas,
                updates_tx,
                tasks: Mutex::new(tasks),
                pending: Mutex::new(Some(PendingReceivers {
                    peer_updates_rx,
                    key_value_requests_rx,
                    area_synced_rx,
                })),
            }),
        }
    }

    /// Attach the queue readers and the one-shot initialization barrier.
    /// Idempotent: a second call is a no-op.
    pub fn start(&self) {
        let Some(pending) = self.inner.pending.lock().expect("pending lock poisoned").take()
        else {
            return;
        };
        let PendingReceivers {
            mut peer_updates_rx,
            mut key_value_requests_rx,
            mut area_synced_rx,
        } = pending;

        let peer_reader = {
            let store = self.clone();
            tokio::spawn(async move {
                info!("starting peer updates processing task");
                while let Some(event) = peer_updates_rx.recv().await {
                    debug!("received peer update");
                    store.process_peer_updates(event).await;
                }
                info!("terminating peer updates processing task");
            })
        };

        let request_reader = {
            let store = self.clone();
            tokio::spawn(async move {
                info!("starting key-value requests processing task");
                while let Some(request) = key_value_requests_rx.recv().await {
                    debug!("received key-value request");
                    if let Err(err) = store.process_key_value_request(request) {
                        error!(error = %err, "failed to process key-value request");
                    }
                }
                info!("terminating key-value request processing task");
            })
        };

        let barrier = {
            let updates_tx = self.inner.updates_tx.clone();
            let num_areas = self.inner.areas.len();
            tokio::spawn(async move {
                let mut synced_areas = HashSet::new();
                while let Some(area) = area_synced_rx.recv().await {
                    if synced_areas.insert(area.clone()) {
                        info!(area = %area, "area completed initial sync");
                    }
                    if synced_areas.len() == num_areas {
                        info!(
                            areas = num_areas,
                            "synchronization completed in all areas, signalling KVSTORE_SYNCED"
                        );
                        let _ = updates_tx.send(KvStoreUpdate::Synced);
                        break;
                    }
                }
            })
        };

        let mut tasks = self.inner.tasks.lock().expect("tasks lock poisoned");
        tasks.push(peer_reader);
        tasks.push(request_reader);
        tasks.push(barrier);
    }

    /// Drain every area actor, then cancel the readers.
    pub async fn stop(&self) {
        for (area, handle) in &self.inner.areas {
            let (tx, rx) = oneshot::channel();
            if handle.cmd_tx.send(AreaCmd::Stop { reply: tx }).is_ok() {
                let _ = rx.await;
            }
            debug!(area = %area, "area stopped");
        }
        let tasks = {
            let mut guard = self.inner.tasks.lock().expect("tasks lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }
        info!("kvstore stopped");
    }

    /// Fresh reader on the updates fan-out.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<KvStoreUpdate> {
        self.inner.updates_tx.subscribe()
    }

    // ---- queue consumption ----------------------------------------------

    async fn process_peer_updates(&self, event: PeerEvent) {
        for (area, area_event) in event {
            if !area_event.peers_to_add.is_empty() {
                if let Err(err) = self.add_peers(&area, area_event.peers_to_add).await {
                    error!(area = %area, error = %err, "failed to add peers");
                }
            }
            if !area_event.peers_to_del.is_empty() {
                if let Err(err) = self.del_peers(&area, area_event.peers_to_del).await {
                    error!(area = %area, error = %err, "failed to delete peers");
                }
            }
        }

        // An area left with no peers after a peer event counts as synced,
        // otherwise the initialization barrier could never clear.
        for handle in self.inner.areas.values() {
            let _ = handle.cmd_tx.send(AreaCmd::MarkSyncedIfNoPeers);
        }
    }

    fn process_key_value_request(&self, request: KeyValueRequest) -> Result<(), KvStoreError> {
        let handle = self.resolve_area(request.area(), "process_key_value_request")?;
        let cmd = match request {
            KeyValueRequest::Persist { key, payload, .. } => AreaCmd::PersistKey { key, payload },
            KeyValueRequest::Set {
                key,
                payload,
                version,
                ..
            } => AreaCmd::SetKey {
                key,
                payload,
                version,
            },
            KeyValueRequest::Unset { key, payload, .. } => AreaCmd::UnsetKey { key, payload },
            KeyValueRequest::Erase { key, .. } => AreaCmd::EraseKey { key },
        };
        handle.cmd_tx.send(cmd).map_err(|_| KvStoreError::Stopped)
    }

    // ---- area resolution ------------------------------------------------

    fn resolve_area(
        &self,
        area: &str,
        caller: &str,
    ) -> Result<&AreaHandle<C>, KvStoreError> {
        if let Some(handle) = self.inner.areas.get(area) {
            return Ok(handle);
        }
        warn!(area = %area, caller, "area requested but not configured for this node");

        // Wildcard-area compatibility: with exactly one configured area,
        // requests for "0" (or any request when "0" is the configured
        // area) fall through to it.
        if self.inner.config.enable_default_area_fallback
            && self.inner.areas.len() == 1
            && (self.inner.areas.contains_key(DEFAULT_AREA) || area == DEFAULT_AREA)
        {
            let (name, handle) = self
                .inner
                .areas
                .iter()
                .next()
                .expect("single configured area");
            info!(caller, fallback_area = %name, "falling back to the single configured area");
            return Ok(handle);
        }
        Err(KvStoreError::UnknownArea(area.to_string()))
    }

    async fn request<T>(
        &self,
        area: &str,
        caller: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> AreaCmd<C>,
    ) -> Result<T, KvStoreError> {
        let handle = self.resolve_area(area, caller)?;
        let (tx, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(make(tx))
            .map_err(|_| KvStoreError::Stopped)?;
        rx.await.map_err(|_| KvStoreError::Stopped)
    }

    // ---- RPC surface ----------------------------------------------------

    /// Fetch specific keys. Missing keys are silently absent from the
    /// response.
    pub async fn get_key_vals(
        &self,
        area: &str,
        keys: Vec<String>,
    ) -> Result<Publication, KvStoreError> {
        self.request(area, "get_key_vals", |reply| AreaCmd::GetKeyVals {
            keys,
            reply,
        })
        .await
    }

    /// Filtered dump; with digests attached the response is the
    /// difference used by the full-sync handshake.
    pub async fn dump_key_vals(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> Result<Publication, KvStoreError> {
        self.request(area, "dump_key_vals", |reply| AreaCmd::DumpKeys {
            params,
            reply,
        })
        .await
    }

    /// Filtered dump with payloads stripped (metadata plus hash).
    pub async fn dump_hashes(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> Result<Publication, KvStoreError> {
        self.request(area, "dump_hashes", |reply| AreaCmd::DumpHashes {
            params,
            reply,
        })
        .await
    }

    /// Merge key-values into the area map and flood the resulting delta.
    pub async fn set_key_vals(
        &self,
        area: &str,
        params: KeySetParams,
    ) -> Result<(), KvStoreError> {
        for (key, value) in &params.key_vals {
            if value.version < 1 {
                return Err(KvStoreError::InvalidArgument(format!(
                    "version 0 is invalid for key {key}"
                )));
            }
        }
        self.request(area, "set_key_vals", |reply| AreaCmd::SetKeyVals {
            params,
            reply,
        })
        .await
    }

    /// Add or update peers. Idempotent; empty input is an error.
    pub async fn add_peers(
        &self,
        area: &str,
        peers: HashMap<String, PeerSpec>,
    ) -> Result<(), KvStoreError> {
        if peers.is_empty() {
            return Err(KvStoreError::InvalidArgument(
                "empty peer names in peer-add request".to_string(),
            ));
        }
        info!(area = %area, peers = ?peers.keys().collect::<Vec<_>>(), "peer addition requested");
        self.request(area, "add_peers", |reply| AreaCmd::AddPeers { peers, reply })
            .await
    }

    /// Delete peers. Idempotent; empty input is an error.
    pub async fn del_peers(
        &self,
        area: &str,
        peer_names: Vec<String>,
    ) -> Result<(), KvStoreError> {
        if peer_names.is_empty() {
            return Err(KvStoreError::InvalidArgument(
                "empty peer names in peer-del request".to_string(),
            ));
        }
        info!(area = %area, peers = ?peer_names, "peer deletion requested");
        self.request(area, "del_peers", |reply| AreaCmd::DelPeers {
            peer_names,
            reply,
        })
        .await
    }

    pub async fn get_peer_state(
        &self,
        area: &str,
        peer_name: &str,
    ) -> Result<Option<PeerState>, KvStoreError> {
        let peer_name = peer_name.to_string();
        self.request(area, "get_peer_state", |reply| AreaCmd::GetPeerState {
            peer_name,
            reply,
        })
        .await
    }

    pub async fn dump_peers(
        &self,
        area: &str,
    ) -> Result<HashMap<String, PeerSpec>, KvStoreError> {
        self.request(area, "dump_peers", |reply| AreaCmd::DumpPeers { reply })
            .await
    }

    /// Snapshot of the self-originated cache.
    pub async fn dump_self_originated(
        &self,
        area: &str,
    ) -> Result<HashMap<String, Value>, KvStoreError> {
        self.request(area, "dump_self_originated", |reply| {
            AreaCmd::DumpSelfOriginated { reply }
        })
        .await
    }

    /// Summaries for the selected areas; empty selection means all.
    pub async fn get_area_summary(
        &self,
        areas: HashSet<String>,
    ) -> Result<Vec<AreaSummary>, KvStoreError> {
        let mut selected: Vec<&str> = if areas.is_empty() {
            self.inner.areas.keys().map(String::as_str).collect()
        } else {
            areas.iter().map(String::as_str).collect()
        };
        selected.sort_unstable();

        let mut summaries = Vec::with_capacity(selected.len());
        for area in selected {
            let summary = self
                .request(area, "get_area_summary", |reply| AreaCmd::GetSummary {
                    reply,
                })
                .await?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Counters for one area.
    pub async fn get_area_counters(
        &self,
        area: &str,
    ) -> Result<BTreeMap<String, i64>, KvStoreError> {
        self.request(area, "get_area_counters", |reply| AreaCmd::GetCounters {
            reply,
        })
        .await
    }

    /// Global counters: per-area counters summed per key.
    pub async fn get_counters(&self) -> BTreeMap<String, i64> {
        let mut flat: BTreeMap<String, i64> = BTreeMap::new();
        for area in self.inner.areas.keys() {
            if let Ok(counters) = self.get_area_counters(area).await {
                for (key, value) in counters {
                    *flat.entry(key).or_default() += value;
                }
            }
        }
        flat
    }

    /// Flood-topology hint; accepted and ignored (flood optimization is
    /// collapsed to flood-to-all in this build).
    pub async fn flood_topo_set(
        &self,
        area: &str,
        params: FloodTopoSetParams,
    ) -> Result<(), KvStoreError> {
        self.request(area, "flood_topo_set", |reply| AreaCmd::FloodTopoSet {
            params,
            reply,
        })
        .await
    }

    /// Spanning-tree message pass-through; counted and dropped.
    pub async fn process_dual(
        &self,
        area: &str,
        messages: DualMessages,
    ) -> Result<(), KvStoreError> {
        if messages.0.is_empty() {
            warn!(area = %area, "received empty dual message");
            return Ok(());
        }
        self.request(area, "process_dual", |reply| AreaCmd::ProcessDual {
            messages,
            reply,
        })
        .await
    }

    /// Number of areas hosted by this node.
    pub fn num_areas(&self) -> usize {
        self.inner.areas.len()
    }
}
