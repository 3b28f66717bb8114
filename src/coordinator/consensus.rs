//! Consensus driver
//!
//! Runs a [`RaftNode`] on tokio: a ticker task for elections and heartbeats,
//! one task per outgoing RPC, and an apply loop that feeds committed entries
//! to the [`ClusterMetadataStore`] and then to the registered
//! [`ApplyHook`]s.

use crate::common::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse, JoinRequest,
    JoinResponse, LogEntry, ProposeRequest, ProposeResponse, Snapshot, VoteRequest, VoteResponse,
};
use crate::common::{
    retry_with_backoff, ConsensusConfig, ConsensusError, Error, ErrorClass, FailureCause, PeerId,
    Result,
};
use crate::coordinator::metadata::{ClusterMetadata, ClusterMetadataStore, MetaOperation};
use crate::coordinator::raft_node::{Committed, Outbound, RaftNode, RaftRole, Tick};
use crate::coordinator::transport::RaftTransport;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Callback run by the apply loop after the metadata store changed.
pub trait ApplyHook: Send + Sync {
    fn on_apply(&self, op: &MetaOperation, state: &ClusterMetadata);

    /// The whole state was replaced by a snapshot.
    fn on_restore(&self, state: &ClusterMetadata);
}

enum Outcome {
    /// Committed and applied; carries the deterministic apply error, if any
    Applied(Option<FailureCause>),
    /// Another entry took the slot
    Dropped,
}

struct Waiter {
    term: u64,
    tx: oneshot::Sender<Outcome>,
}

enum Submitted {
    Local {
        index: u64,
        term: u64,
        rx: oneshot::Receiver<Outcome>,
    },
    Forward(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSyncState {
    Synced,
    Syncing,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub uri: String,
    pub state: PeerSyncState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub peer_id: PeerId,
    pub term: u64,
    pub role: RaftRole,
    pub leader: Option<PeerId>,
    pub leader_uri: Option<String>,
    pub commit: u64,
    pub last_applied: u64,
    /// Committed entries not applied locally yet
    pub pending_operations: u64,
    pub peers: BTreeMap<PeerId, PeerStatus>,
}

pub struct Consensus {
    node: RaftNode,
    metadata: Arc<ClusterMetadataStore>,
    transport: Arc<dyn RaftTransport>,
    config: ConsensusConfig,
    hooks: RwLock<Vec<Arc<dyn ApplyHook>>>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    applied_tx: watch::Sender<u64>,
    apply_lock: Mutex<()>,
    /// Entries up to here were applied before the restart; their membership
    /// changes are already reflected in the recovered voter set
    replay_until: u64,
    apply_notify: Notify,
    replicate_notify: Notify,
    shutdown: watch::Sender<bool>,
}

impl Consensus {
    pub fn new(
        node: RaftNode,
        metadata: Arc<ClusterMetadataStore>,
        transport: Arc<dyn RaftTransport>,
        config: ConsensusConfig,
    ) -> Arc<Self> {
        let replay_until = node.commit_index();
        let (applied_tx, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node,
            metadata,
            transport,
            config,
            hooks: RwLock::new(Vec::new()),
            waiters: Mutex::new(HashMap::new()),
            applied_tx,
            apply_lock: Mutex::new(()),
            replay_until,
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            shutdown,
        })
    }

    pub fn node(&self) -> &RaftNode {
        &self.node
    }

    pub fn metadata(&self) -> &Arc<ClusterMetadataStore> {
        &self.metadata
    }

    pub fn add_hook(&self, hook: Arc<dyn ApplyHook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(|p| p.into_inner());
        hooks.push(hook);
    }

    fn hooks(&self) -> Vec<Arc<dyn ApplyHook>> {
        self.hooks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn lock_waiters(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn applied_index(&self) -> u64 {
        *self.applied_tx.borrow()
    }

    /// Changes of the applied index, for waiting on metadata changes.
    pub fn subscribe_applied(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    /// Has this peer joined or bootstrapped a cluster before?
    pub fn is_initialized(&self) -> bool {
        self.node.last_index() > 0 || !self.node.voters().is_empty()
    }

    // === Background tasks ===

    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting consensus on peer {} ({})",
            self.node.id(),
            self.node.uri()
        );
        vec![
            tokio::spawn(self.clone().run_ticker()),
            tokio::spawn(self.clone().run_applier()),
        ]
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn run_ticker(self: Arc<Self>) {
        let period = (self.config.heartbeat_interval() / 2).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.replicate_notify.notified() => {}
                _ = shutdown.changed() => break,
            }

            match self.node.tick(Instant::now()) {
                Ok(Tick::Idle) => {}
                Ok(Tick::Campaign { peers, request }) => self.campaign(peers, request),
                Ok(Tick::Replicate) => {
                    // A single voter commits on its own
                    self.apply_notify.notify_one();
                    self.replicate();
                }
                Err(e) => tracing::error!("Raft tick failed: {}", e),
            }
        }
        tracing::debug!("Consensus ticker of peer {} stopped", self.node.id());
    }

    async fn run_applier(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if let Err(e) = self.apply_committed() {
                tracing::error!("Applying committed entries failed: {}", e);
            }
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("Consensus applier of peer {} stopped", self.node.id());
    }

    fn campaign(self: &Arc<Self>, peers: Vec<(PeerId, String)>, request: VoteRequest) {
        for (peer_id, uri) in peers {
            let this = self.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let term = request.term;
                let rpc = this.transport.request_vote(&uri, request);
                let resp = match with_timeout(this.config.rpc_timeout(), rpc).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::debug!("Vote request to peer {} failed: {}", peer_id, e);
                        return;
                    }
                };
                match this.node.handle_vote_response(peer_id, term, resp) {
                    Ok(true) => {
                        this.replicate_notify.notify_one();
                        this.apply_notify.notify_one();
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Vote response from {} failed: {}", peer_id, e),
                }
            });
        }
    }

    fn replicate(self: &Arc<Self>) {
        for outbound in self.node.replication_requests(self.config.max_append_entries) {
            let this = self.clone();
            tokio::spawn(async move { this.send(outbound).await });
        }
    }

    async fn send(&self, outbound: Outbound) {
        let rpc_timeout = self.config.rpc_timeout();
        let (peer_id, result) = match outbound {
            Outbound::Append {
                peer_id,
                uri,
                request,
            } => {
                let rpc = self.transport.append_entries(&uri, request);
                let result = with_timeout(rpc_timeout, rpc)
                    .await
                    .and_then(|resp| self.node.handle_append_response(peer_id, resp));
                (peer_id, result)
            }
            Outbound::Snapshot {
                peer_id,
                uri,
                request,
            } => {
                tracing::info!(
                    "Sending snapshot at index {} to peer {}",
                    request.snapshot.last_index,
                    peer_id
                );
                let rpc = self.transport.install_snapshot(&uri, request);
                let result = with_timeout(rpc_timeout, rpc)
                    .await
                    .and_then(|resp| self.node.handle_snapshot_response(peer_id, resp));
                (peer_id, result)
            }
        };

        match result {
            Ok(advanced) => {
                if advanced {
                    self.apply_notify.notify_one();
                }
                self.replicate_notify.notify_one();
            }
            Err(e) => {
                self.node.release(peer_id);
                tracing::debug!("Replication to peer {} failed: {}", peer_id, e);
            }
        }
    }

    // === Apply ===

    /// Apply everything committed but not yet applied.
    pub fn apply_committed(&self) -> Result<()> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match self.node.committed_after(self.applied_index()) {
                Committed::Snapshot(snapshot) => self.restore(snapshot)?,
                Committed::Entries(entries) if entries.is_empty() => break,
                Committed::Entries(entries) => {
                    for entry in entries {
                        self.apply_entry(entry)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn restore(&self, snapshot: Snapshot) -> Result<()> {
        tracing::info!(
            "Restoring metadata from snapshot at index {} (term {})",
            snapshot.last_index,
            snapshot.last_term
        );
        let state = self.metadata.restore(&snapshot.data)?;
        for hook in self.hooks() {
            hook.on_restore(&state);
        }
        self.applied_tx.send_replace(snapshot.last_index);
        Ok(())
    }

    fn apply_entry(&self, entry: LogEntry) -> Result<()> {
        let outcome = if entry.is_noop() {
            self.metadata.skip(entry.index, entry.term);
            None
        } else {
            match MetaOperation::decode(&entry.data) {
                Ok(op) => match self.metadata.apply(&op, entry.index, entry.term) {
                    Ok(()) => {
                        tracing::debug!("Applied entry {}: {:?}", entry.index, op);
                        let state = self.metadata.current();
                        for hook in self.hooks() {
                            hook.on_apply(&op, &state);
                        }
                        if op.changes_membership() && entry.index > self.replay_until {
                            self.node.set_voters(state.voters())?;
                        }
                        None
                    }
                    Err(e) => Some(e.to_failure_cause()),
                },
                Err(e) => {
                    tracing::error!("Skipping undecodable entry {}: {}", entry.index, e);
                    self.metadata.skip(entry.index, entry.term);
                    Some(e.to_failure_cause())
                }
            }
        };

        if entry.index == self.replay_until {
            // Recovered voters match the replayed state; keep them in sync
            self.node.set_voters(self.metadata.current().voters())?;
        }
        self.applied_tx.send_replace(entry.index);
        self.maybe_compact();

        if let Some(waiter) = self.lock_waiters().remove(&entry.index) {
            let outcome = if waiter.term == entry.term {
                Outcome::Applied(outcome)
            } else {
                Outcome::Dropped
            };
            let _ = waiter.tx.send(outcome);
        }
        Ok(())
    }

    fn maybe_compact(&self) {
        let applied = self.applied_index();
        if applied.saturating_sub(self.node.snapshot_index()) < self.config.snapshot_threshold {
            return;
        }
        let compacted = self
            .metadata
            .snapshot()
            .and_then(|data| self.node.compact(applied, data));
        if let Err(e) = compacted {
            tracing::error!("Log compaction at index {} failed: {}", applied, e);
        }
    }

    /// Wait until the local metadata has applied `index`.
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.applied_tx.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|applied| *applied >= index))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConsensusError::Stopped.into()),
            Err(_) => Err(ConsensusError::NotCaughtUp {
                applied: self.applied_index(),
                required: index,
            }
            .into()),
        }
    }

    // === Proposals ===

    /// Replicate `op` and wait until it is applied on this peer.
    pub async fn propose(&self, op: MetaOperation) -> Result<()> {
        let data = op.encode()?;
        let timeout = self.config.propose_timeout();
        match tokio::time::timeout(timeout, self.propose_with_retry(data)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Proposal was not committed within {:?}", timeout);
                Err(ConsensusError::Timeout(timeout).into())
            }
        }
    }

    async fn propose_with_retry(&self, data: Vec<u8>) -> Result<()> {
        loop {
            match self.propose_once(data.clone()).await {
                Err(e) if e.class() == ErrorClass::Transient => {
                    tracing::debug!("Proposal not accepted yet: {}", e);
                    tokio::time::sleep(self.config.heartbeat_interval()).await;
                }
                other => return other,
            }
        }
    }

    fn submit(&self, data: Vec<u8>) -> Result<Submitted> {
        // Registered before the lock is released, so the apply loop cannot
        // miss the waiter
        let mut waiters = self.lock_waiters();
        match self.node.propose(data) {
            Ok((index, term)) => {
                let (tx, rx) = oneshot::channel();
                waiters.insert(index, Waiter { term, tx });
                Ok(Submitted::Local { index, term, rx })
            }
            Err(Error::Consensus(ConsensusError::NotLeader { leader: Some(uri) })) => {
                Ok(Submitted::Forward(uri))
            }
            Err(e) => Err(e),
        }
    }

    async fn propose_once(&self, data: Vec<u8>) -> Result<()> {
        match self.submit(data.clone())? {
            Submitted::Local { index, rx, .. } => {
                self.replicate_notify.notify_one();
                self.apply_notify.notify_one();
                match rx.await {
                    Ok(Outcome::Applied(None)) => Ok(()),
                    Ok(Outcome::Applied(Some(cause))) => Err(Error::Remote(cause)),
                    Ok(Outcome::Dropped) => Err(ConsensusError::ProposalDropped { index }.into()),
                    Err(_) => Err(ConsensusError::Stopped.into()),
                }
            }
            Submitted::Forward(leader) => {
                tracing::debug!("Forwarding proposal to leader {}", leader);
                let resp = self
                    .transport
                    .propose(&leader, ProposeRequest { data })
                    .await?;
                if let Some(cause) = resp.error {
                    return Err(Error::Remote(cause));
                }
                self.wait_applied(resp.index, self.config.propose_timeout())
                    .await
            }
        }
    }

    /// Leader side of a forwarded proposal. Apply errors are part of the
    /// response; only consensus failures are errors.
    pub async fn propose_local(&self, data: Vec<u8>) -> Result<ProposeResponse> {
        let timeout = self.config.propose_timeout();
        let work = async {
            let Submitted::Local { index, term, rx } = self.submit(data)? else {
                return Err(ConsensusError::NotLeader {
                    leader: self.node.leader().map(|(_, uri)| uri),
                }
                .into());
            };
            self.replicate_notify.notify_one();
            self.apply_notify.notify_one();
            match rx.await {
                Ok(Outcome::Applied(error)) => Ok(ProposeResponse { index, term, error }),
                Ok(Outcome::Dropped) => Err(ConsensusError::ProposalDropped { index }.into()),
                Err(_) => Err(ConsensusError::Stopped.into()),
            }
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::Timeout(timeout).into()),
        }
    }

    // === Incoming RPCs ===

    pub fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.node.handle_request_vote(req)
    }

    pub fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse> {
        let resp = self.node.handle_append_entries(req)?;
        self.apply_notify.notify_one();
        Ok(resp)
    }

    pub fn handle_snapshot(&self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let resp = self.node.handle_install_snapshot(req)?;
        self.apply_notify.notify_one();
        Ok(resp)
    }

    /// Admit a new peer and hand it the current state.
    pub async fn handle_join(&self, req: JoinRequest) -> Result<JoinResponse> {
        tracing::info!("Peer {} asks to join from {}", req.peer_id, req.uri);
        self.propose(MetaOperation::AddPeer {
            peer_id: req.peer_id,
            uri: req.uri,
        })
        .await?;

        // One image for index, voters and data
        let state = self.metadata.current();
        let snapshot = Snapshot {
            last_index: state.last_applied_index,
            last_term: state.last_applied_term,
            voters: state.voters(),
            data: bincode::serialize(state.as_ref())?,
        };
        let leader = self.node.leader();
        Ok(JoinResponse {
            snapshot,
            leader_id: leader.as_ref().map(|(id, _)| *id),
            leader_uri: leader.map(|(_, uri)| uri),
        })
    }

    // === Cluster lifecycle ===

    /// Start a new cluster with this peer as its only member.
    pub async fn init_cluster(&self) -> Result<()> {
        if !self.node.bootstrap_single()? {
            tracing::info!("Peer {} already belongs to a cluster", self.node.id());
            return Ok(());
        }
        tracing::info!("Peer {} bootstrapping a new cluster", self.node.id());
        self.replicate_notify.notify_one();
        self.propose(MetaOperation::AddPeer {
            peer_id: self.node.id(),
            uri: self.node.uri().to_string(),
        })
        .await
    }

    /// Join the cluster `bootstrap` belongs to.
    pub async fn join(&self, bootstrap: &str) -> Result<()> {
        if self.is_initialized() {
            tracing::info!(
                "Peer {} restarting with persisted state, not joining again",
                self.node.id()
            );
            return Ok(());
        }

        tracing::info!("Peer {} joining cluster via {}", self.node.id(), bootstrap);
        let req = JoinRequest {
            peer_id: self.node.id(),
            uri: self.node.uri().to_string(),
        };
        let resp = retry_with_backoff(
            || self.transport.join(bootstrap, req.clone()),
            10,
            self.config.heartbeat_interval(),
        )
        .await?;

        let index = resp.snapshot.last_index;
        self.node
            .install_join_snapshot(resp.snapshot, resp.leader_id.zip(resp.leader_uri))?;
        self.apply_notify.notify_one();
        self.wait_applied(index, self.config.propose_timeout()).await?;
        tracing::info!("Peer {} joined at index {}", self.node.id(), index);
        Ok(())
    }

    pub fn cluster_status(&self) -> ClusterStatus {
        let status = self.node.status();
        let applied = self.applied_index();
        let metadata = self.metadata.current();

        let peers = metadata
            .peers
            .iter()
            .map(|(peer_id, info)| {
                let state = if *peer_id == status.peer_id {
                    if applied >= status.commit_index {
                        PeerSyncState::Synced
                    } else {
                        PeerSyncState::Syncing
                    }
                } else if status.role == RaftRole::Leader {
                    match status.progress.get(peer_id) {
                        Some(p) if p.match_index >= status.commit_index => PeerSyncState::Synced,
                        Some(p) if p.last_contact_ms.is_some() => PeerSyncState::Syncing,
                        _ => PeerSyncState::Unknown,
                    }
                } else if status.leader_id == Some(*peer_id) {
                    PeerSyncState::Synced
                } else {
                    PeerSyncState::Unknown
                };
                (
                    *peer_id,
                    PeerStatus {
                        uri: info.uri.clone(),
                        state,
                    },
                )
            })
            .collect();

        ClusterStatus {
            peer_id: status.peer_id,
            term: status.term,
            role: status.role,
            leader: status.leader_id,
            leader_uri: status.leader_uri,
            commit: status.commit_index,
            last_applied: applied,
            pending_operations: status.commit_index.saturating_sub(applied),
            peers,
        }
    }
}

async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout(format!("no response within {:?}", timeout)))?
}
