//! Shard transfers between peers
//!
//! A transfer is started, finished and aborted through consensus. The
//! source peer copies its replica to the target in batches, then keeps
//! passing on every write it applies until the finish is committed. A
//! background loop on every peer drives the transfers it is the source of
//! and asks for the recovery of its own dead replicas.

use crate::collection::types::{PointOperation, ReplicaState};
use crate::common::{
    retry_with_backoff, ConsensusError, Error, MembershipError, PeerId, Result, ShardApplyError,
    ShardId, WriteConfig,
};
use crate::coordinator::consensus::{ApplyHook, Consensus};
use crate::coordinator::metadata::{ClusterMetadata, MetaOperation, ShardTransfer};
use crate::shard::holder::ShardHolder;
use crate::shard::remote::{ShardTransport, ShardUpdateRequest};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

/// What the source replica queues for the target.
pub enum TransferItem {
    /// Copied points, or a write applied after the copy began. `ack` is
    /// answered once the target applied it.
    Operation {
        operation: PointOperation,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Everything copied; only forwarded writes follow
    Synced,
}

/// Wakes the transfer loop when the metadata changed.
struct TransferTrigger {
    notify: Arc<Notify>,
}

impl ApplyHook for TransferTrigger {
    fn on_apply(&self, op: &MetaOperation, _state: &ClusterMetadata) {
        if let MetaOperation::StartTransfer { .. }
        | MetaOperation::AbortTransfer { .. }
        | MetaOperation::DeactivateReplica { .. } = op
        {
            self.notify.notify_one();
        }
    }

    fn on_restore(&self, _state: &ClusterMetadata) {
        self.notify.notify_one();
    }
}

pub struct ShardTransfers {
    peer_id: PeerId,
    consensus: Arc<Consensus>,
    holder: Arc<ShardHolder>,
    transport: Arc<dyn ShardTransport>,
    config: WriteConfig,
    /// Outgoing transfers driven by this process
    running: Mutex<HashSet<(String, ShardId)>>,
    notify: Arc<Notify>,
}

impl ShardTransfers {
    pub fn new(
        consensus: Arc<Consensus>,
        holder: Arc<ShardHolder>,
        transport: Arc<dyn ShardTransport>,
        config: WriteConfig,
    ) -> Arc<Self> {
        let notify = Arc::new(Notify::new());
        consensus.add_hook(Arc::new(TransferTrigger {
            notify: notify.clone(),
        }));
        Arc::new(Self {
            peer_id: consensus.node().id(),
            consensus,
            holder,
            transport,
            config,
            running: Mutex::new(HashSet::new()),
            notify,
        })
    }

    fn lock_running(&self) -> MutexGuard<'_, HashSet<(String, ShardId)>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.maintain().await;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.recovery_interval()) => {}
            }
        }
    }

    /// Drive outgoing transfers and request recovery of dead local replicas.
    async fn maintain(self: &Arc<Self>) {
        // Entries still to apply may finish or abort what we see
        if self.consensus.applied_index() < self.consensus.node().commit_index() {
            return;
        }

        let state = self.consensus.metadata().current();
        for (name, meta) in &state.collections {
            for shard_id in meta.placement.keys() {
                match meta.transfer(*shard_id) {
                    Some(transfer) if transfer.from == self.peer_id => {
                        self.spawn_send(name, *shard_id, *transfer);
                    }
                    Some(_) => {}
                    None => {
                        if meta.replica_state(*shard_id, self.peer_id) != Some(ReplicaState::Dead) {
                            continue;
                        }
                        let Some(source) = meta.active_replicas(*shard_id).first().copied() else {
                            continue;
                        };
                        tracing::info!(
                            "Recovering replica of shard {}/{} from peer {}",
                            name,
                            shard_id,
                            source
                        );
                        let start = MetaOperation::StartTransfer {
                            collection: name.clone(),
                            shard_id: *shard_id,
                            from: source,
                            to: self.peer_id,
                            remove_source: false,
                        };
                        if let Err(e) = self.consensus.propose(start).await {
                            tracing::debug!(
                                "Recovery of shard {}/{} not started: {}",
                                name,
                                shard_id,
                                e
                            );
                        }
                    }
                }
            }
        }
    }

    fn spawn_send(self: &Arc<Self>, collection: &str, shard_id: ShardId, transfer: ShardTransfer) {
        let key = (collection.to_string(), shard_id);
        if !self.lock_running().insert(key.clone()) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let (collection, shard_id) = key;
            match this.send_shard(&collection, shard_id, transfer).await {
                Ok(points) => tracing::info!(
                    "Transferred shard {}/{} ({} points) to peer {}",
                    collection,
                    shard_id,
                    points,
                    transfer.to
                ),
                Err(e) => {
                    tracing::warn!(
                        "Transfer of shard {}/{} to peer {} failed: {}",
                        collection,
                        shard_id,
                        transfer.to,
                        e
                    );
                    let abort = MetaOperation::AbortTransfer {
                        collection: collection.clone(),
                        shard_id,
                        from: transfer.from,
                        to: transfer.to,
                    };
                    if let Err(e) = this.consensus.propose(abort).await {
                        tracing::warn!(
                            "Aborting transfer of shard {}/{} failed: {}",
                            collection,
                            shard_id,
                            e
                        );
                    }
                }
            }
            this.holder.stop_forwarding(&collection, shard_id);
            this.lock_running().remove(&(collection, shard_id));
        });
    }

    /// Source side of a transfer. Returns the number of points copied.
    async fn send_shard(
        &self,
        collection: &str,
        shard_id: ShardId,
        transfer: ShardTransfer,
    ) -> Result<usize> {
        let target = self
            .consensus
            .metadata()
            .current()
            .peer_uri(transfer.to)
            .map(str::to_string)
            .ok_or(MembershipError::UnknownPeer(transfer.to))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let copied = self
            .holder
            .start_forwarding(collection, shard_id, tx, self.config.transfer_batch_size)
            .await?;
        tracing::info!(
            "Copying {} points of shard {}/{} to peer {}",
            copied,
            collection,
            shard_id,
            transfer.to
        );

        while let Some(item) = rx.recv().await {
            match item {
                TransferItem::Operation { operation, ack } => {
                    self.deliver(&target, collection, shard_id, operation, ack)
                        .await?;
                }
                TransferItem::Synced => break,
            }
        }
        // Catch up with what was forwarded during the copy
        while let Ok(item) = rx.try_recv() {
            if let TransferItem::Operation { operation, ack } = item {
                self.deliver(&target, collection, shard_id, operation, ack)
                    .await?;
            }
        }

        let finish = self.consensus.propose(MetaOperation::FinishTransfer {
            collection: collection.to_string(),
            shard_id,
            from: transfer.from,
            to: transfer.to,
        });
        tokio::pin!(finish);
        loop {
            tokio::select! {
                finished = &mut finish => {
                    finished?;
                    break;
                }
                Some(item) = rx.recv() => {
                    if let TransferItem::Operation { operation, ack } = item {
                        self.deliver(&target, collection, shard_id, operation, ack).await?;
                    }
                }
            }
        }

        // The target is an active owner now: writes routed with the new
        // metadata reach it directly
        self.holder.stop_forwarding(collection, shard_id);
        while let Some(item) = rx.recv().await {
            if let TransferItem::Operation { operation, ack } = item {
                if let Err(e) = self
                    .deliver(&target, collection, shard_id, operation, ack)
                    .await
                {
                    tracing::error!(
                        "Peer {} missed a write to shard {}/{}: {}",
                        transfer.to,
                        collection,
                        shard_id,
                        e
                    );
                    self.consensus
                        .propose(MetaOperation::DeactivateReplica {
                            collection: collection.to_string(),
                            shard_id,
                            peer_id: transfer.to,
                        })
                        .await?;
                    break;
                }
            }
        }
        Ok(copied)
    }

    async fn deliver(
        &self,
        target: &str,
        collection: &str,
        shard_id: ShardId,
        operation: PointOperation,
        ack: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let req = ShardUpdateRequest {
            collection: collection.to_string(),
            shard_id,
            operation,
            // The target must have applied the start of the transfer
            min_applied: self.consensus.applied_index(),
        };
        let resp = retry_with_backoff(
            || self.transport.update(target, req.clone()),
            self.config.remote_retries,
            self.config.retry_delay(),
        )
        .await?;
        if !resp.causes.is_empty() {
            return Err(ShardApplyError {
                shard_id,
                causes: resp.causes,
            }
            .into());
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        Ok(())
    }

    /// Copy a shard from `from` to `to` and wait until the transfer ended.
    /// With `remove_source` the shard moves instead.
    pub async fn transfer(
        &self,
        collection: &str,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
        remove_source: bool,
    ) -> Result<()> {
        tracing::info!(
            "Starting transfer of shard {}/{} from peer {} to peer {}{}",
            collection,
            shard_id,
            from,
            to,
            if remove_source { " (move)" } else { "" }
        );
        let mut applied = self.consensus.subscribe_applied();
        self.consensus
            .propose(MetaOperation::StartTransfer {
                collection: collection.to_string(),
                shard_id,
                from,
                to,
                remove_source,
            })
            .await?;

        let timeout = self.config.transfer_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.consensus.metadata().current();
            let meta = state.collection(collection)?;
            let running = meta
                .transfer(shard_id)
                .is_some_and(|t| t.from == from && t.to == to);
            if !running {
                return match meta.replica_state(shard_id, to) {
                    Some(ReplicaState::Active) => Ok(()),
                    _ => Err(Error::Unavailable(format!(
                        "transfer of shard {} from peer {} to peer {} was aborted",
                        shard_id, from, to
                    ))),
                };
            }
            match tokio::time::timeout_at(deadline, applied.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ConsensusError::Stopped.into()),
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "transfer of shard {} to peer {} still running after {:?}",
                        shard_id, to, timeout
                    )))
                }
            }
        }
    }
}
