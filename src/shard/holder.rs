//! Shards stored on this peer
//!
//! The holder follows the metadata: after every applied operation it opens
//! the shards placed on this peer and unloads the others. Shard data lives in
//! `<data>/collections/<name>-<created_at_index>/<shard_id>/wal.log`, so a
//! dropped and re-created collection never sees the old incarnation's points.
//!
//! A replica that is the target of a shard transfer starts empty. While a
//! replica is the source of one, every write it applies is also queued for
//! the target, after the points copied when the transfer began.

use crate::collection::types::{CollectionConfig, PointId, PointOperation, Record};
use crate::common::{Error, PeerId, Result, ShardApplyError, ShardId, WalSyncPolicy};
use crate::coordinator::consensus::ApplyHook;
use crate::coordinator::metadata::{ClusterMetadata, CollectionMeta, MetaOperation};
use crate::shard::executor;
use crate::shard::store::ShardStore;
use crate::shard::transfer::TransferItem;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, MutexGuard, RwLock};
use tokio::sync::{mpsc, oneshot, Mutex};

type ShardKey = (String, ShardId);

/// Log index of the last transfer that reset a shard directory.
const RESET_MARKER: &str = "transfer_index";

/// One shard replica held by this peer.
pub struct LocalShard {
    config: CollectionConfig,
    created_at_index: u64,
    store: Mutex<ShardStore>,
    forward: std::sync::Mutex<Option<mpsc::UnboundedSender<TransferItem>>>,
}

impl LocalShard {
    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub async fn points_count(&self) -> usize {
        self.store.lock().await.len()
    }

    fn forward(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<TransferItem>>> {
        self.forward.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct ShardHolder {
    peer_id: PeerId,
    data_path: Option<PathBuf>,
    wal_sync: WalSyncPolicy,
    shards: RwLock<HashMap<ShardKey, Arc<LocalShard>>>,
    /// Owned shards that could not be opened, with the reason
    failed: RwLock<HashMap<ShardKey, String>>,
}

impl ShardHolder {
    pub fn new(peer_id: PeerId, data_path: Option<PathBuf>, wal_sync: WalSyncPolicy) -> Self {
        Self {
            peer_id,
            data_path,
            wal_sync,
            shards: RwLock::new(HashMap::new()),
            failed: RwLock::new(HashMap::new()),
        }
    }

    fn collections_dir(&self) -> Option<PathBuf> {
        self.data_path.as_ref().map(|p| p.join("collections"))
    }

    fn shard_dir(&self, collection: &str, created_at_index: u64, shard_id: ShardId) -> Option<PathBuf> {
        self.collections_dir().map(|dir| {
            dir.join(format!("{}-{}", collection, created_at_index))
                .join(shard_id.to_string())
        })
    }

    fn open_shard(
        &self,
        collection: &str,
        shard_id: ShardId,
        config: &CollectionConfig,
        created_at_index: u64,
    ) -> Result<LocalShard> {
        let store = match self.shard_dir(collection, created_at_index, shard_id) {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                ShardStore::open(shard_id, &dir, self.wal_sync)?
            }
            None => ShardStore::in_memory(shard_id),
        };
        Ok(LocalShard {
            config: config.clone(),
            created_at_index,
            store: Mutex::new(store),
            forward: std::sync::Mutex::new(None),
        })
    }

    fn record_failure(&self, key: &ShardKey, error: Option<&Error>) {
        let mut failed = self.failed.write().unwrap_or_else(|p| p.into_inner());
        match error {
            Some(e) => {
                failed.insert(key.clone(), e.to_string());
            }
            None => {
                failed.remove(key);
            }
        }
    }

    /// Bring the local shard set in line with `state`.
    pub fn sync_with(&self, state: &ClusterMetadata) {
        let mut wanted: BTreeMap<ShardKey, (&CollectionConfig, u64)> = BTreeMap::new();
        for (name, meta) in &state.collections {
            for shard_id in meta.shards_of(self.peer_id) {
                wanted.insert(
                    (name.clone(), shard_id),
                    (&meta.config, meta.created_at_index),
                );
            }
        }

        {
            let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());

            shards.retain(|key, shard| {
                let keep = wanted.get(key).is_some_and(|(config, created)| {
                    shard.created_at_index == *created && shard.config == **config
                });
                if !keep {
                    tracing::info!("Peer {} unloading shard {}/{}", self.peer_id, key.0, key.1);
                }
                keep
            });

            for (key, (config, created)) in &wanted {
                if shards.contains_key(key) {
                    continue;
                }
                match self.open_shard(&key.0, key.1, config, *created) {
                    Ok(shard) => {
                        tracing::info!("Peer {} loaded shard {}/{}", self.peer_id, key.0, key.1);
                        shards.insert(key.clone(), Arc::new(shard));
                        self.record_failure(key, None);
                    }
                    Err(e) => {
                        tracing::error!(
                            "Peer {} failed to open shard {}/{}: {}",
                            self.peer_id,
                            key.0,
                            key.1,
                            e
                        );
                        self.record_failure(key, Some(&e));
                    }
                }
            }
        }
        self.failed
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|key, _| wanted.contains_key(key));

        if let Some(dir) = self.collections_dir() {
            if let Err(e) = remove_dropped(&dir, state) {
                tracing::warn!("Cleaning up dropped collections failed: {}", e);
            }
        }
    }

    pub fn get(&self, collection: &str, shard_id: ShardId) -> Option<Arc<LocalShard>> {
        let shards = self.shards.read().unwrap_or_else(|p| p.into_inner());
        shards.get(&(collection.to_string(), shard_id)).cloned()
    }

    fn require(&self, collection: &str, shard_id: ShardId) -> Result<Arc<LocalShard>> {
        if let Some(shard) = self.get(collection, shard_id) {
            return Ok(shard);
        }
        let failed = self.failed.read().unwrap_or_else(|p| p.into_inner());
        match failed.get(&(collection.to_string(), shard_id)) {
            Some(cause) => Err(Error::Internal(format!(
                "shard {}/{} failed to open: {}",
                collection, shard_id, cause
            ))),
            None => Err(Error::ShardNotFound(shard_id)),
        }
    }

    /// Start the local replica of a shard over, empty. Runs when this peer
    /// becomes the target of a transfer; a reset already recorded at or
    /// after the log `index` is not repeated, so replaying the log after a
    /// restart keeps the points received since.
    fn reset_replica(&self, meta: &CollectionMeta, collection: &str, shard_id: ShardId, index: u64) {
        let key = (collection.to_string(), shard_id);
        let dir = self.shard_dir(collection, meta.created_at_index, shard_id);
        if dir.as_deref().is_some_and(|dir| read_marker(dir) >= index) {
            return;
        }

        let reopened = match &dir {
            Some(dir) => clear_shard_dir(dir, index),
            None => Ok(()),
        }
        .and_then(|()| self.open_shard(collection, shard_id, &meta.config, meta.created_at_index));

        let mut shards = self.shards.write().unwrap_or_else(|p| p.into_inner());
        match reopened {
            Ok(shard) => {
                tracing::info!(
                    "Peer {} reset shard {}/{} for an incoming transfer",
                    self.peer_id,
                    collection,
                    shard_id
                );
                shards.insert(key.clone(), Arc::new(shard));
                self.record_failure(&key, None);
            }
            Err(e) => {
                tracing::error!(
                    "Peer {} failed to reset shard {}/{}: {}",
                    self.peer_id,
                    collection,
                    shard_id,
                    e
                );
                shards.remove(&key);
                self.record_failure(&key, Some(&e));
            }
        }
    }

    /// Validate and apply a sub-batch to a local replica. While the replica
    /// feeds a transfer, the call returns once the write was passed on.
    pub async fn update(
        &self,
        collection: &str,
        shard_id: ShardId,
        operation: PointOperation,
    ) -> std::result::Result<(), ShardApplyError> {
        let shard = self
            .require(collection, shard_id)
            .map_err(|e| ShardApplyError::from_error(shard_id, &e))?;

        let delivered = {
            let mut store = shard.store.lock().await;
            let forward = shard.forward().clone();
            let copy = forward.as_ref().map(|_| operation.clone());
            executor::apply(&shard.config, shard_id, &mut store, operation)?;

            // Queued under the store lock: the target sees writes in the
            // order this replica applied them
            match (forward, copy) {
                (Some(tx), Some(operation)) => {
                    let (ack, delivered) = oneshot::channel();
                    tx.send(TransferItem::Operation {
                        operation,
                        ack: Some(ack),
                    })
                    .ok()
                    .map(|()| delivered)
                }
                _ => None,
            }
        };

        if let Some(delivered) = delivered {
            if delivered.await.is_err() {
                tracing::warn!(
                    "Write to shard {}/{} was not passed on to the transfer target",
                    collection,
                    shard_id
                );
            }
        }
        Ok(())
    }

    /// Queue the shard's points for a transfer, then every later write.
    /// Returns the number of points queued.
    pub async fn start_forwarding(
        &self,
        collection: &str,
        shard_id: ShardId,
        tx: mpsc::UnboundedSender<TransferItem>,
        batch_size: usize,
    ) -> Result<usize> {
        let shard = self.require(collection, shard_id)?;
        let store = shard.store.lock().await;
        let closed = || Error::Internal(format!("transfer queue of shard {} closed", shard_id));

        let points = store.export();
        let count = points.len();
        let mut batch = Vec::with_capacity(batch_size.max(1));
        for point in points {
            batch.push(point);
            if batch.len() >= batch_size.max(1) {
                let operation = PointOperation::UpsertPoints {
                    points: std::mem::take(&mut batch),
                };
                tx.send(TransferItem::Operation { operation, ack: None })
                    .map_err(|_| closed())?;
            }
        }
        if !batch.is_empty() {
            let operation = PointOperation::UpsertPoints { points: batch };
            tx.send(TransferItem::Operation { operation, ack: None })
                .map_err(|_| closed())?;
        }
        tx.send(TransferItem::Synced).map_err(|_| closed())?;

        *shard.forward() = Some(tx);
        Ok(count)
    }

    pub fn stop_forwarding(&self, collection: &str, shard_id: ShardId) {
        if let Some(shard) = self.get(collection, shard_id) {
            shard.forward().take();
        }
    }

    pub async fn retrieve(
        &self,
        collection: &str,
        shard_id: ShardId,
        ids: &[PointId],
        with_payload: bool,
        with_vector: bool,
    ) -> Result<Vec<Record>> {
        let shard = self.require(collection, shard_id)?;
        let store = shard.store.lock().await;
        Ok(store.retrieve(ids, with_payload, with_vector))
    }

    /// Points held by each local replica of `collection`.
    pub async fn points_counts(&self, collection: &str) -> BTreeMap<ShardId, usize> {
        let held: Vec<(ShardId, Arc<LocalShard>)> = {
            let shards = self.shards.read().unwrap_or_else(|p| p.into_inner());
            shards
                .iter()
                .filter(|((name, _), _)| name == collection)
                .map(|((_, shard_id), shard)| (*shard_id, shard.clone()))
                .collect()
        };

        let mut counts = BTreeMap::new();
        for (shard_id, shard) in held {
            counts.insert(shard_id, shard.points_count().await);
        }
        counts
    }
}

fn read_marker(dir: &Path) -> u64 {
    std::fs::read_to_string(dir.join(RESET_MARKER))
        .ok()
        .and_then(|index| index.trim().parse().ok())
        .unwrap_or(0)
}

fn clear_shard_dir(dir: &Path, index: u64) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(RESET_MARKER), index.to_string())?;
    Ok(())
}

/// Delete directories of collection incarnations that no longer exist.
/// Incarnations created after the applied index are left alone: they show
/// up again while the log is replayed.
fn remove_dropped(dir: &Path, state: &ClusterMetadata) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let live: HashSet<String> = state
        .collections
        .iter()
        .map(|(name, meta)| format!("{}-{}", name, meta.created_at_index))
        .collect();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(created) = file_name
            .rsplit_once('-')
            .and_then(|(_, index)| index.parse::<u64>().ok())
        else {
            continue;
        };
        if created <= state.last_applied_index && !live.contains(&file_name) {
            tracing::info!("Removing data of dropped collection {}", file_name);
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

impl ApplyHook for ShardHolder {
    fn on_apply(&self, op: &MetaOperation, state: &ClusterMetadata) {
        match op {
            MetaOperation::StartTransfer {
                collection,
                shard_id,
                to,
                ..
            } => {
                self.sync_with(state);
                if *to == self.peer_id {
                    if let Ok(meta) = state.collection(collection) {
                        self.reset_replica(meta, collection, *shard_id, state.last_applied_index);
                    }
                }
            }
            MetaOperation::CreateCollection { .. }
            | MetaOperation::DropCollection { .. }
            | MetaOperation::ReassignShard { .. }
            | MetaOperation::FinishTransfer { .. }
            | MetaOperation::AbortTransfer { .. } => self.sync_with(state),
            MetaOperation::AddPeer { .. }
            | MetaOperation::RemovePeer { .. }
            | MetaOperation::DeactivateReplica { .. } => {}
        }
    }

    fn on_restore(&self, state: &ClusterMetadata) {
        self.sync_with(state);
    }
}
