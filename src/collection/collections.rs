//! Write and read entry point of a peer
//!
//! A batch is split by shard and every sub-batch is pushed, in submission
//! order, onto the FIFO queue of its shard. One worker per queue sends the
//! sub-batch to all owners of the shard and reports a [`ShardOutcome`]; the
//! batch result is the [`aggregate`] of those outcomes. With `wait=false`
//! the caller gets an operation id right after the enqueue and reads the
//! result later from the [`OperationTracker`].
//!
//! Only active replicas take writes. A replica that fails a sub-batch the
//! others applied is deactivated through consensus, and the write counts as
//! done; the dead replica catches up later through a shard transfer.

use crate::collection::aggregator::{aggregate, ShardOutcome};
use crate::collection::router::{self, Replica};
use crate::collection::types::{
    ClusterOperation, CollectionClusterInfo, CollectionConfig, CollectionDescription,
    CollectionInfo, CollectionsResponse, CreateCollection, LocalShardInfo, OperationInfo, PointId,
    PointOperation, PointRequest, Record, RemoteShardInfo, ShardTransferInfo, UpdateResult,
    UpdateStatus,
};
use crate::common::{
    retry_with_backoff, validate_collection_name, AggregateError, Error, ErrorClass,
    FailureCause, PeerId, Result, ShardApplyError, ShardId, WriteConfig,
};
use crate::coordinator::consensus::{ApplyHook, Consensus};
use crate::coordinator::metadata::{ClusterMetadata, MetaOperation};
use crate::coordinator::placement::initial_placement;
use crate::shard::holder::ShardHolder;
use crate::shard::remote::{
    ShardRetrieveRequest, ShardTransport, ShardUpdateRequest, ShardUpdateResponse,
};
use crate::shard::transfer::ShardTransfers;
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// (collection, created_at_index, shard)
type QueueKey = (String, u64, ShardId);

struct ShardTask {
    operation: PointOperation,
    min_applied: u64,
    reply: oneshot::Sender<ShardOutcome>,
}

/// Everything a shard worker needs to reach the owners of its shard.
#[derive(Clone)]
struct ShardDispatcher {
    peer_id: PeerId,
    consensus: Arc<Consensus>,
    holder: Arc<ShardHolder>,
    transport: Arc<dyn ShardTransport>,
    config: WriteConfig,
}

impl ShardDispatcher {
    async fn run(self, collection: String, shard_id: ShardId, mut rx: mpsc::UnboundedReceiver<ShardTask>) {
        while let Some(task) = rx.recv().await {
            let outcome = self
                .dispatch(&collection, shard_id, task.operation, task.min_applied)
                .await;
            let _ = task.reply.send(outcome);
        }
        tracing::debug!("Dispatch queue of shard {}/{} closed", collection, shard_id);
    }

    /// Apply a sub-batch on every active owner of the shard.
    async fn dispatch(
        &self,
        collection: &str,
        shard_id: ShardId,
        operation: PointOperation,
        min_applied: u64,
    ) -> ShardOutcome {
        let state = self.consensus.metadata().current();
        let replicas = match router::resolve(&state, collection, shard_id) {
            Ok(replicas) => replicas,
            Err(e) => return ShardOutcome::Failure(ShardApplyError::from_error(shard_id, &e)),
        };
        let active: Vec<Replica> = replicas.into_iter().filter(Replica::is_active).collect();
        if active.is_empty() {
            let e = Error::Unavailable(format!(
                "shard {} of `{}` has no active replica",
                shard_id, collection
            ));
            return ShardOutcome::Failure(ShardApplyError::from_error(shard_id, &e));
        }

        let calls = active.into_iter().map(|replica| {
            let operation = operation.clone();
            async move {
                let result = self
                    .update_replica(collection, shard_id, &replica, operation, min_applied)
                    .await;
                (replica.peer_id, result)
            }
        });
        let results = join_all(calls).await;

        let applied = results.iter().filter(|(_, r)| r.is_ok()).count();
        let failed: Vec<(PeerId, ShardApplyError)> = results
            .into_iter()
            .filter_map(|(peer_id, r)| r.err().map(|e| (peer_id, e)))
            .collect();
        if failed.is_empty() {
            return ShardOutcome::Success { shard_id };
        }

        // A rejection by the input fails on every replica alike; anything
        // else leaves the failed replicas behind the ones that applied
        let diverged = failed.iter().all(|(_, e)| !e.class().is_client_error());
        if applied > 0 && diverged {
            let peers: Vec<PeerId> = failed.iter().map(|(peer_id, _)| *peer_id).collect();
            if self.deactivate(collection, shard_id, &peers).await {
                return ShardOutcome::Success { shard_id };
            }
        }

        let mut seen = HashSet::new();
        let causes: Vec<FailureCause> = failed
            .into_iter()
            .flat_map(|(_, e)| e.causes)
            .filter(|cause| seen.insert(cause.message.clone()))
            .collect();
        ShardOutcome::Failure(ShardApplyError { shard_id, causes })
    }

    /// Take replicas that missed a write out of service.
    async fn deactivate(&self, collection: &str, shard_id: ShardId, peers: &[PeerId]) -> bool {
        for peer_id in peers {
            tracing::warn!(
                "Deactivating replica of shard {}/{} on peer {}",
                collection,
                shard_id,
                peer_id
            );
            let deactivated = self
                .consensus
                .propose(MetaOperation::DeactivateReplica {
                    collection: collection.to_string(),
                    shard_id,
                    peer_id: *peer_id,
                })
                .await;
            if let Err(e) = deactivated {
                tracing::error!(
                    "Replica of shard {}/{} on peer {} stays active after a failed write: {}",
                    collection,
                    shard_id,
                    peer_id,
                    e
                );
                return false;
            }
        }
        true
    }

    async fn update_replica(
        &self,
        collection: &str,
        shard_id: ShardId,
        replica: &Replica,
        operation: PointOperation,
        min_applied: u64,
    ) -> std::result::Result<(), ShardApplyError> {
        if replica.peer_id == self.peer_id {
            return self.holder.update(collection, shard_id, operation).await;
        }

        tracing::debug!(
            "Sending {} to shard {}/{} on peer {}",
            operation.kind(),
            collection,
            shard_id,
            replica.peer_id
        );
        let req = ShardUpdateRequest {
            collection: collection.to_string(),
            shard_id,
            operation,
            min_applied,
        };
        let resp = retry_with_backoff(
            || self.transport.update(&replica.uri, req.clone()),
            self.config.remote_retries,
            self.config.retry_delay(),
        )
        .await;

        match resp {
            Ok(resp) if resp.causes.is_empty() => Ok(()),
            Ok(resp) => Err(ShardApplyError {
                shard_id,
                causes: resp.causes,
            }),
            Err(e) => {
                tracing::warn!(
                    "Shard {}/{} on peer {} unreachable: {}",
                    collection,
                    shard_id,
                    replica.peer_id,
                    e
                );
                Err(ShardApplyError::from_error(shard_id, &e))
            }
        }
    }
}

/// Per-shard FIFO queues of this peer. Queues of dropped collections are
/// closed when the drop is applied.
#[derive(Default)]
pub struct DispatchQueues {
    queues: Mutex<HashMap<QueueKey, mpsc::UnboundedSender<ShardTask>>>,
}

impl DispatchQueues {
    fn lock(&self) -> MutexGuard<'_, HashMap<QueueKey, mpsc::UnboundedSender<ShardTask>>> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn prune(&self, state: &ClusterMetadata) {
        self.lock().retain(|(name, created, _), _| {
            state
                .collections
                .get(name)
                .is_some_and(|meta| meta.created_at_index == *created)
        });
    }
}

impl ApplyHook for DispatchQueues {
    fn on_apply(&self, op: &MetaOperation, state: &ClusterMetadata) {
        if let MetaOperation::DropCollection { .. } | MetaOperation::CreateCollection { .. } = op
        {
            self.prune(state);
        }
    }

    fn on_restore(&self, state: &ClusterMetadata) {
        self.prune(state);
    }
}

struct TrackedOperation {
    collection: String,
    info: OperationInfo,
}

#[derive(Default)]
struct TrackerState {
    operations: HashMap<u64, TrackedOperation>,
    order: VecDeque<u64>,
}

/// Status of recent write operations, bounded to the newest `capacity`.
pub struct OperationTracker {
    capacity: usize,
    state: Mutex<TrackerState>,
}

impl OperationTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn submit(&self, collection: &str, operation_id: u64) {
        let mut state = self.lock();
        state.operations.insert(
            operation_id,
            TrackedOperation {
                collection: collection.to_string(),
                info: OperationInfo {
                    operation_id,
                    status: UpdateStatus::Acknowledged,
                    error: None,
                    submitted_at: Utc::now(),
                    finished_at: None,
                },
            },
        );
        state.order.push_back(operation_id);
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.operations.remove(&oldest);
            }
        }
    }

    pub fn finish(&self, operation_id: u64, result: &std::result::Result<(), AggregateError>) {
        let mut state = self.lock();
        if let Some(op) = state.operations.get_mut(&operation_id) {
            op.info.finished_at = Some(Utc::now());
            match result {
                Ok(()) => op.info.status = UpdateStatus::Completed,
                Err(e) => {
                    op.info.status = UpdateStatus::Failed;
                    op.info.error = Some(e.to_string());
                }
            }
        }
    }

    pub fn get(&self, collection: &str, operation_id: u64) -> Option<OperationInfo> {
        self.lock()
            .operations
            .get(&operation_id)
            .filter(|op| op.collection == collection)
            .map(|op| op.info.clone())
    }
}

pub struct Collections {
    dispatcher: ShardDispatcher,
    queues: Arc<DispatchQueues>,
    tracker: Arc<OperationTracker>,
    transfers: Arc<ShardTransfers>,
    next_operation_id: AtomicU64,
}

impl Collections {
    pub fn new(
        consensus: Arc<Consensus>,
        holder: Arc<ShardHolder>,
        transport: Arc<dyn ShardTransport>,
        config: WriteConfig,
    ) -> Self {
        let queues = Arc::new(DispatchQueues::default());
        consensus.add_hook(queues.clone());
        let tracker = Arc::new(OperationTracker::new(config.max_tracked_operations));
        let transfers = ShardTransfers::new(
            consensus.clone(),
            holder.clone(),
            transport.clone(),
            config.clone(),
        );
        Self {
            dispatcher: ShardDispatcher {
                peer_id: consensus.node().id(),
                consensus,
                holder,
                transport,
                config,
            },
            queues,
            tracker,
            transfers,
            next_operation_id: AtomicU64::new(0),
        }
    }

    /// Start the loop that drives shard transfers and replica recovery.
    pub fn start(&self) -> JoinHandle<()> {
        self.transfers.start()
    }

    fn consensus(&self) -> &Arc<Consensus> {
        &self.dispatcher.consensus
    }

    fn state(&self) -> Arc<ClusterMetadata> {
        self.consensus().metadata().current()
    }

    pub fn peer_id(&self) -> PeerId {
        self.dispatcher.peer_id
    }

    /// Close every dispatch queue; their workers stop once drained.
    pub fn close(&self) {
        self.queues.lock().clear();
    }

    // === Metadata operations ===

    pub async fn create_collection(&self, name: &str, req: CreateCollection) -> Result<()> {
        validate_collection_name(name)?;
        let config = CollectionConfig::from(req);
        config.validate()?;

        let state = self.state();
        if state.collections.contains_key(name) {
            return Err(Error::CollectionExists(name.to_string()));
        }
        let peers: Vec<PeerId> = state.peers.keys().copied().collect();
        let placement =
            initial_placement(config.shard_number, config.replication_factor, &peers)?;

        tracing::info!(
            "Creating collection `{}` with {} shards on {} peers",
            name,
            config.shard_number,
            peers.len()
        );
        self.consensus()
            .propose(MetaOperation::CreateCollection {
                name: name.to_string(),
                config,
                placement,
            })
            .await
    }

    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        self.state().collection(name)?;
        tracing::info!("Dropping collection `{}`", name);
        self.consensus()
            .propose(MetaOperation::DropCollection {
                name: name.to_string(),
            })
            .await
    }

    pub async fn update_cluster(&self, name: &str, op: ClusterOperation) -> Result<()> {
        self.state().collection(name)?;
        match op {
            ClusterOperation::ReassignShard { shard_id, peers } => {
                self.reassign_shard(name, shard_id, peers).await
            }
            ClusterOperation::MoveShard {
                shard_id,
                from_peer_id,
                to_peer_id,
            } => {
                self.transfers
                    .transfer(name, shard_id, from_peer_id, to_peer_id, true)
                    .await
            }
            ClusterOperation::ReplicateShard {
                shard_id,
                from_peer_id,
                to_peer_id,
            } => {
                self.transfers
                    .transfer(name, shard_id, from_peer_id, to_peer_id, false)
                    .await
            }
            ClusterOperation::AbortTransfer {
                shard_id,
                from_peer_id,
                to_peer_id,
            } => {
                tracing::info!(
                    "Aborting transfer of shard {}/{} from peer {} to peer {}",
                    name,
                    shard_id,
                    from_peer_id,
                    to_peer_id
                );
                self.consensus()
                    .propose(MetaOperation::AbortTransfer {
                        collection: name.to_string(),
                        shard_id,
                        from: from_peer_id,
                        to: to_peer_id,
                    })
                    .await
            }
        }
    }

    /// Give the shard exactly the owners `peers`. Peers without a replica
    /// get a copy from an active owner before the placement changes.
    async fn reassign_shard(&self, name: &str, shard_id: ShardId, peers: Vec<PeerId>) -> Result<()> {
        let state = self.state();
        let meta = state.collection(name)?;
        let owners = meta
            .replicas(shard_id)
            .ok_or(Error::ShardNotFound(shard_id))?;
        if peers.is_empty() {
            return Err(Error::BadRequest(format!(
                "shard {} must have at least one owner",
                shard_id
            )));
        }
        let distinct: HashSet<PeerId> = peers.iter().copied().collect();
        if distinct.len() != peers.len() {
            return Err(Error::BadRequest(format!(
                "shard {} lists the same peer twice",
                shard_id
            )));
        }

        let added: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|peer| !owners.contains(peer))
            .collect();
        if !added.is_empty() {
            let source = meta
                .active_replicas(shard_id)
                .first()
                .copied()
                .ok_or_else(|| {
                    Error::Unavailable(format!("shard {} has no active replica", shard_id))
                })?;
            for peer in added {
                self.transfers
                    .transfer(name, shard_id, source, peer, false)
                    .await?;
            }
        }

        tracing::info!(
            "Reassigning shard {}/{} to peers {:?}",
            name,
            shard_id,
            peers
        );
        self.consensus()
            .propose(MetaOperation::ReassignShard {
                collection: name.to_string(),
                shard_id,
                peers,
            })
            .await
    }

    pub async fn remove_peer(&self, peer_id: PeerId) -> Result<()> {
        tracing::info!("Removing peer {} from the cluster", peer_id);
        self.consensus()
            .propose(MetaOperation::RemovePeer { peer_id })
            .await
    }

    // === Queries ===

    pub fn list_collections(&self) -> CollectionsResponse {
        CollectionsResponse {
            collections: self
                .state()
                .collections
                .keys()
                .map(|name| CollectionDescription { name: name.clone() })
                .collect(),
        }
    }

    pub async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let state = self.state();
        let meta = state.collection(name)?;
        let counts = self.dispatcher.holder.points_counts(name).await;
        Ok(CollectionInfo {
            config: meta.config.clone(),
            shard_count: meta.shard_count(),
            local_points_count: counts.values().sum(),
        })
    }

    pub async fn cluster_info(&self, name: &str) -> Result<CollectionClusterInfo> {
        let state = self.state();
        let meta = state.collection(name)?;
        let peer_id = self.peer_id();

        let local_shards = self
            .dispatcher
            .holder
            .points_counts(name)
            .await
            .into_iter()
            .map(|(shard_id, points_count)| LocalShardInfo {
                shard_id,
                points_count,
                state: meta.replica_state(shard_id, peer_id).unwrap_or_default(),
            })
            .collect();

        let remote_shards = meta
            .placement
            .iter()
            .flat_map(|(shard_id, owners)| {
                owners
                    .iter()
                    .filter(|owner| **owner != peer_id)
                    .map(|owner| RemoteShardInfo {
                        shard_id: *shard_id,
                        peer_id: *owner,
                        state: meta.replica_state(*shard_id, *owner).unwrap_or_default(),
                    })
            })
            .collect();

        let shard_transfers = meta
            .transfers
            .iter()
            .map(|(shard_id, transfer)| ShardTransferInfo {
                shard_id: *shard_id,
                from: transfer.from,
                to: transfer.to,
                remove_source: transfer.remove_source,
            })
            .collect();

        Ok(CollectionClusterInfo {
            peer_id,
            shard_count: meta.shard_count(),
            local_shards,
            remote_shards,
            shard_transfers,
        })
    }

    pub fn operation_info(&self, name: &str, operation_id: u64) -> Result<OperationInfo> {
        self.state().collection(name)?;
        self.tracker.get(name, operation_id).ok_or_else(|| {
            Error::NotFound(format!("No operation with id {} found", operation_id))
        })
    }

    // === Writes ===

    fn queue(&self, collection: &str, created_at_index: u64, shard_id: ShardId) -> mpsc::UnboundedSender<ShardTask> {
        let mut queues = self.queues.lock();
        let key = (collection.to_string(), created_at_index, shard_id);
        if let Some(tx) = queues.get(&key).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            self.dispatcher
                .clone()
                .run(collection.to_string(), shard_id, rx),
        );
        queues.insert(key, tx.clone());
        tx
    }

    /// Fan a batch out to its shards. With `wait` the call returns once all
    /// touched shards answered (or the write timeout passed).
    pub async fn update(
        &self,
        collection: &str,
        operation: PointOperation,
        wait: bool,
    ) -> Result<UpdateResult> {
        let operation_id = self.next_operation_id.fetch_add(1, Ordering::Relaxed);
        let state = self.state();
        let meta = state.collection(collection)?;

        if operation.is_empty() {
            self.tracker.submit(collection, operation_id);
            self.tracker.finish(operation_id, &Ok(()));
            return Ok(UpdateResult {
                operation_id,
                status: UpdateStatus::Completed,
            });
        }

        let kind = operation.kind();
        let points = operation.len();
        let sub_batches = router::split(operation, meta.shard_count());
        tracing::debug!(
            "Operation {} ({} of {} points) on `{}` touches shards {:?}",
            operation_id,
            kind,
            points,
            collection,
            sub_batches.keys().collect::<Vec<_>>()
        );

        // Enqueued synchronously so that sub-batches of one shard keep the
        // submission order
        let mut replies = Vec::with_capacity(sub_batches.len());
        for (shard_id, sub_batch) in sub_batches {
            let (reply, rx) = oneshot::channel();
            let task = ShardTask {
                operation: sub_batch,
                min_applied: state.last_applied_index,
                reply,
            };
            if self
                .queue(collection, meta.created_at_index, shard_id)
                .send(task)
                .is_err()
            {
                tracing::error!("Dispatch queue of shard {}/{} is gone", collection, shard_id);
            }
            replies.push((shard_id, rx));
        }
        self.tracker.submit(collection, operation_id);

        let tracker = self.tracker.clone();
        let handle = tokio::spawn(async move {
            let outcomes = join_all(replies.into_iter().map(|(shard_id, rx)| async move {
                rx.await.unwrap_or_else(|_| {
                    ShardOutcome::Failure(ShardApplyError {
                        shard_id,
                        causes: vec![FailureCause::new(
                            ErrorClass::Internal,
                            "Service internal error: shard dispatch was cancelled",
                        )],
                    })
                })
            }))
            .await;
            let result = aggregate(outcomes);
            tracker.finish(operation_id, &result);
            result
        });

        if !wait {
            return Ok(UpdateResult {
                operation_id,
                status: UpdateStatus::Acknowledged,
            });
        }

        let timeout = self.dispatcher.config.timeout();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(Ok(()))) => Ok(UpdateResult {
                operation_id,
                status: UpdateStatus::Completed,
            }),
            Ok(Ok(Err(e))) => {
                tracing::warn!("Operation {} on `{}` failed: {}", operation_id, collection, e);
                Err(e.into())
            }
            Ok(Err(e)) => Err(Error::Internal(format!("write task failed: {}", e))),
            Err(_) => Err(Error::Timeout(format!(
                "operation {} did not complete within {:?}, retry is safe",
                operation_id, timeout
            ))),
        }
    }

    // === Reads ===

    /// Points by id, in request order. Unknown ids are skipped.
    pub async fn retrieve(&self, collection: &str, req: PointRequest) -> Result<Vec<Record>> {
        let state = self.state();
        let meta = state.collection(collection)?;
        let routed = router::route(&req.ids, meta.shard_count());

        let req = &req;
        let reads = routed.into_iter().map(|(shard_id, ids)| {
            let state = state.clone();
            async move {
                let replicas = router::resolve(&state, collection, shard_id)?;
                self.retrieve_shard(collection, shard_id, &replicas, ids, req, state.last_applied_index)
                    .await
            }
        });

        let mut found: HashMap<PointId, Record> = HashMap::new();
        for records in join_all(reads).await {
            for record in records? {
                found.insert(record.id, record);
            }
        }
        Ok(req
            .ids
            .iter()
            .filter_map(|id| found.get(id).cloned())
            .collect())
    }

    /// Read from the local replica when it is active, otherwise from the
    /// other active replicas in placement order until one answers.
    async fn retrieve_shard(
        &self,
        collection: &str,
        shard_id: ShardId,
        replicas: &[Replica],
        ids: Vec<PointId>,
        req: &PointRequest,
        min_applied: u64,
    ) -> Result<Vec<Record>> {
        let peer_id = self.peer_id();
        let mut active: Vec<&Replica> = replicas.iter().filter(|r| r.is_active()).collect();
        active.sort_by_key(|r| r.peer_id != peer_id);

        let mut last_error = Error::Unavailable(format!(
            "shard {} of `{}` has no active replica",
            shard_id, collection
        ));
        for replica in active {
            let read = if replica.peer_id == peer_id {
                self.dispatcher
                    .holder
                    .retrieve(collection, shard_id, &ids, req.with_payload, req.with_vector)
                    .await
            } else {
                let remote = ShardRetrieveRequest {
                    collection: collection.to_string(),
                    shard_id,
                    ids: ids.clone(),
                    with_payload: req.with_payload,
                    with_vector: req.with_vector,
                    min_applied,
                };
                let config = &self.dispatcher.config;
                retry_with_backoff(
                    || self.dispatcher.transport.retrieve(&replica.uri, remote.clone()),
                    config.remote_retries,
                    config.retry_delay(),
                )
                .await
            };
            match read {
                Ok(records) => return Ok(records),
                Err(e) => {
                    tracing::warn!(
                        "Reading shard {}/{} from peer {} failed: {}",
                        collection,
                        shard_id,
                        replica.peer_id,
                        e
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    // === Peer-to-peer side ===

    /// Apply a sub-batch sent by a routing peer to a local replica.
    pub async fn apply_local(&self, req: ShardUpdateRequest) -> Result<ShardUpdateResponse> {
        let consensus = self.consensus();
        consensus
            .wait_applied(req.min_applied, self.dispatcher.config.catch_up_timeout())
            .await?;
        match self
            .dispatcher
            .holder
            .update(&req.collection, req.shard_id, req.operation)
            .await
        {
            Ok(()) => Ok(ShardUpdateResponse::default()),
            Err(e) => Ok(ShardUpdateResponse { causes: e.causes }),
        }
    }

    pub async fn retrieve_local(&self, req: ShardRetrieveRequest) -> Result<Vec<Record>> {
        self.consensus()
            .wait_applied(req.min_applied, self.dispatcher.config.catch_up_timeout())
            .await?;
        self.dispatcher
            .holder
            .retrieve(
                &req.collection,
                req.shard_id,
                &req.ids,
                req.with_payload,
                req.with_vector,
            )
            .await
    }
}
