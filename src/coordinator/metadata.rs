//! Cluster metadata: the state machine replicated through consensus
//!
//! Stores:
//! - Peer registry (peer id → URI), which is also the Raft voter set
//! - Collections (schema, shard count, shard → owning peers)
//! - Replica states and shard transfers in progress
//!
//! The only writer is the consensus apply loop. Readers take an immutable
//! `Arc` snapshot and never wait for it.

use crate::collection::types::{CollectionConfig, ReplicaState};
use crate::common::{Error, MembershipError, PeerId, Result, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub uri: String,
}

/// A shard copy from one peer to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTransfer {
    pub from: PeerId,
    pub to: PeerId,
    /// `from` stops owning the shard once the transfer finished
    pub remove_source: bool,
    /// `to` was a dead owner; an abort leaves it dead instead of removing it
    pub recovery: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub config: CollectionConfig,
    /// shard id → owning peers (first entry is the primary)
    pub placement: BTreeMap<ShardId, Vec<PeerId>>,
    /// Log index that created this incarnation of the collection
    pub created_at_index: u64,
    /// Owners that are not active; an owner missing here is active
    pub replica_states: BTreeMap<ShardId, BTreeMap<PeerId, ReplicaState>>,
    /// At most one transfer per shard
    pub transfers: BTreeMap<ShardId, ShardTransfer>,
}

impl CollectionMeta {
    pub fn new(
        config: CollectionConfig,
        placement: BTreeMap<ShardId, Vec<PeerId>>,
        created_at_index: u64,
    ) -> Self {
        Self {
            config,
            placement,
            created_at_index,
            replica_states: BTreeMap::new(),
            transfers: BTreeMap::new(),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.config.shard_number
    }

    pub fn replicas(&self, shard_id: ShardId) -> Option<&[PeerId]> {
        self.placement.get(&shard_id).map(Vec::as_slice)
    }

    /// State of `peer_id`'s replica of the shard; `None` if it owns none.
    pub fn replica_state(&self, shard_id: ShardId, peer_id: PeerId) -> Option<ReplicaState> {
        if !self.replicas(shard_id)?.contains(&peer_id) {
            return None;
        }
        let state = self
            .replica_states
            .get(&shard_id)
            .and_then(|states| states.get(&peer_id))
            .copied()
            .unwrap_or_default();
        Some(state)
    }

    /// Owners that take writes and serve reads, in placement order.
    pub fn active_replicas(&self, shard_id: ShardId) -> Vec<PeerId> {
        self.replicas(shard_id)
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|peer| self.replica_state(shard_id, *peer) == Some(ReplicaState::Active))
            .collect()
    }

    pub fn transfer(&self, shard_id: ShardId) -> Option<&ShardTransfer> {
        self.transfers.get(&shard_id)
    }

    fn set_state(&mut self, shard_id: ShardId, peer_id: PeerId, state: ReplicaState) {
        let states = self.replica_states.entry(shard_id).or_default();
        match state {
            ReplicaState::Active => {
                states.remove(&peer_id);
            }
            other => {
                states.insert(peer_id, other);
            }
        }
        if states.is_empty() {
            self.replica_states.remove(&shard_id);
        }
    }

    fn remove_owner(&mut self, shard_id: ShardId, peer_id: PeerId) {
        if let Some(owners) = self.placement.get_mut(&shard_id) {
            owners.retain(|p| *p != peer_id);
        }
        self.set_state(shard_id, peer_id, ReplicaState::Active);
    }

    fn take_transfer(
        &mut self,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
    ) -> Result<ShardTransfer> {
        match self.transfers.get(&shard_id) {
            Some(t) if t.from == from && t.to == to => {
                let transfer = *t;
                self.transfers.remove(&shard_id);
                Ok(transfer)
            }
            _ => Err(Error::BadRequest(format!(
                "no transfer of shard {} from peer {} to peer {} is in progress",
                shard_id, from, to
            ))),
        }
    }

    /// Drop a transfer; its target goes back to where it was before.
    fn abort_transfer(&mut self, shard_id: ShardId, from: PeerId, to: PeerId) -> Result<()> {
        let transfer = self.take_transfer(shard_id, from, to)?;
        if transfer.recovery {
            self.set_state(shard_id, to, ReplicaState::Dead);
        } else {
            self.remove_owner(shard_id, to);
        }
        Ok(())
    }

    /// Shards that have `peer_id` among their owners.
    pub fn shards_of(&self, peer_id: PeerId) -> Vec<ShardId> {
        self.placement
            .iter()
            .filter(|(_, peers)| peers.contains(&peer_id))
            .map(|(shard, _)| *shard)
            .collect()
    }
}

/// A consensus-replicated metadata mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaOperation {
    CreateCollection {
        name: String,
        config: CollectionConfig,
        placement: BTreeMap<ShardId, Vec<PeerId>>,
    },
    DropCollection {
        name: String,
    },
    AddPeer {
        peer_id: PeerId,
        uri: String,
    },
    RemovePeer {
        peer_id: PeerId,
    },
    ReassignShard {
        collection: String,
        shard_id: ShardId,
        peers: Vec<PeerId>,
    },
    /// Take a replica that missed a write out of service
    DeactivateReplica {
        collection: String,
        shard_id: ShardId,
        peer_id: PeerId,
    },
    StartTransfer {
        collection: String,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
        remove_source: bool,
    },
    FinishTransfer {
        collection: String,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
    },
    AbortTransfer {
        collection: String,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
    },
}

impl MetaOperation {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn changes_membership(&self) -> bool {
        matches!(
            self,
            MetaOperation::AddPeer { .. } | MetaOperation::RemovePeer { .. }
        )
    }
}

/// Versioned metadata image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub peers: BTreeMap<PeerId, PeerInfo>,
    pub collections: BTreeMap<String, CollectionMeta>,
    pub last_applied_index: u64,
    pub last_applied_term: u64,
}

impl ClusterMetadata {
    pub fn collection(&self, name: &str) -> Result<&CollectionMeta> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionMeta> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    pub fn peer_uri(&self, peer_id: PeerId) -> Option<&str> {
        self.peers.get(&peer_id).map(|p| p.uri.as_str())
    }

    pub fn voters(&self) -> BTreeMap<PeerId, String> {
        self.peers
            .iter()
            .map(|(id, info)| (*id, info.uri.clone()))
            .collect()
    }

    /// Apply one operation. Errors are deterministic: every peer rejects the
    /// same entries, leaving them as no-ops.
    fn apply(&mut self, op: &MetaOperation, index: u64) -> Result<()> {
        match op {
            MetaOperation::CreateCollection {
                name,
                config,
                placement,
            } => {
                if self.collections.contains_key(name) {
                    return Err(Error::CollectionExists(name.clone()));
                }
                config.validate()?;
                self.check_placement(config.shard_number, placement.iter())?;
                if placement.len() != config.shard_number as usize {
                    return Err(Error::BadRequest(format!(
                        "placement covers {} shards, collection has {}",
                        placement.len(),
                        config.shard_number
                    )));
                }
                self.collections.insert(
                    name.clone(),
                    CollectionMeta::new(config.clone(), placement.clone(), index),
                );
            }
            MetaOperation::DropCollection { name } => {
                if self.collections.remove(name).is_none() {
                    return Err(Error::CollectionNotFound(name.clone()));
                }
            }
            MetaOperation::AddPeer { peer_id, uri } => match self.peers.get(peer_id) {
                Some(existing) if existing.uri == *uri => {
                    // Re-join of a known peer at the same address
                }
                Some(existing) => {
                    return Err(MembershipError::DuplicatePeerId {
                        peer_id: *peer_id,
                        address: existing.uri.clone(),
                    }
                    .into());
                }
                None => {
                    self.peers.insert(*peer_id, PeerInfo { uri: uri.clone() });
                }
            },
            MetaOperation::RemovePeer { peer_id } => {
                if !self.peers.contains_key(peer_id) {
                    return Err(MembershipError::UnknownPeer(*peer_id).into());
                }
                if let Some((name, _)) = self
                    .collections
                    .iter()
                    .find(|(_, c)| !c.shards_of(*peer_id).is_empty())
                {
                    return Err(MembershipError::PeerHasShards {
                        peer_id: *peer_id,
                        collection: name.clone(),
                    }
                    .into());
                }
                if self.peers.len() == 1 {
                    return Err(MembershipError::Rejected(
                        "cannot remove the last peer of the cluster".into(),
                    )
                    .into());
                }
                self.peers.remove(peer_id);
            }
            MetaOperation::ReassignShard {
                collection,
                shard_id,
                peers,
            } => {
                let meta = self.collection(collection)?;
                self.check_placement(meta.shard_count(), std::iter::once((shard_id, peers)))?;
                // New owners get their data through a transfer first
                if let Some(peer) = peers
                    .iter()
                    .find(|p| meta.replica_state(*shard_id, **p).is_none())
                {
                    return Err(Error::BadRequest(format!(
                        "peer {} holds no replica of shard {}, transfer the shard to it first",
                        peer, shard_id
                    )));
                }
                if meta.transfer(*shard_id).is_some() {
                    return Err(Error::BadRequest(format!(
                        "shard {} has a transfer in progress",
                        shard_id
                    )));
                }
                if !peers
                    .iter()
                    .any(|p| meta.replica_state(*shard_id, *p) == Some(ReplicaState::Active))
                {
                    return Err(Error::BadRequest(format!(
                        "shard {} would be left without an active replica",
                        shard_id
                    )));
                }

                let meta = self.collection_mut(collection)?;
                meta.placement.insert(*shard_id, peers.clone());
                if let Some(states) = meta.replica_states.get_mut(shard_id) {
                    states.retain(|peer, _| peers.contains(peer));
                    if states.is_empty() {
                        meta.replica_states.remove(shard_id);
                    }
                }
            }
            MetaOperation::DeactivateReplica {
                collection,
                shard_id,
                peer_id,
            } => {
                let meta = self.collection_mut(collection)?;
                match meta.replica_state(*shard_id, *peer_id) {
                    None => {
                        return Err(Error::BadRequest(format!(
                            "peer {} holds no replica of shard {}",
                            peer_id, shard_id
                        )))
                    }
                    Some(ReplicaState::Active) => {
                        if meta.active_replicas(*shard_id).len() == 1 {
                            return Err(Error::BadRequest(format!(
                                "peer {} holds the last active replica of shard {}",
                                peer_id, shard_id
                            )));
                        }
                        meta.set_state(*shard_id, *peer_id, ReplicaState::Dead);
                        // A transfer reading from this replica would copy stale data
                        if let Some(transfer) = meta.transfer(*shard_id).copied() {
                            if transfer.from == *peer_id {
                                meta.abort_transfer(*shard_id, transfer.from, transfer.to)?;
                            }
                        }
                    }
                    // Already out of service
                    Some(ReplicaState::Dead | ReplicaState::Partial) => {}
                }
            }
            MetaOperation::StartTransfer {
                collection,
                shard_id,
                from,
                to,
                remove_source,
            } => {
                if from == to {
                    return Err(Error::BadRequest(
                        "source and target of a transfer must differ".into(),
                    ));
                }
                if !self.peers.contains_key(to) {
                    return Err(MembershipError::UnknownPeer(*to).into());
                }
                let meta = self.collection_mut(collection)?;
                if meta.replicas(*shard_id).is_none() {
                    return Err(Error::ShardNotFound(*shard_id));
                }
                if let Some(running) = meta.transfer(*shard_id) {
                    return Err(Error::BadRequest(format!(
                        "shard {} is already being transferred from peer {} to peer {}",
                        shard_id, running.from, running.to
                    )));
                }
                if meta.replica_state(*shard_id, *from) != Some(ReplicaState::Active) {
                    return Err(Error::BadRequest(format!(
                        "peer {} has no active replica of shard {}",
                        from, shard_id
                    )));
                }
                let recovery = match meta.replica_state(*shard_id, *to) {
                    None => false,
                    Some(ReplicaState::Dead) => true,
                    Some(_) => {
                        return Err(Error::BadRequest(format!(
                            "peer {} already holds shard {}",
                            to, shard_id
                        )))
                    }
                };
                if !recovery {
                    meta.placement.entry(*shard_id).or_default().push(*to);
                }
                meta.set_state(*shard_id, *to, ReplicaState::Partial);
                meta.transfers.insert(
                    *shard_id,
                    ShardTransfer {
                        from: *from,
                        to: *to,
                        remove_source: *remove_source,
                        recovery,
                    },
                );
            }
            MetaOperation::FinishTransfer {
                collection,
                shard_id,
                from,
                to,
            } => {
                let meta = self.collection_mut(collection)?;
                let transfer = meta.take_transfer(*shard_id, *from, *to)?;
                meta.set_state(*shard_id, *to, ReplicaState::Active);
                if transfer.remove_source {
                    meta.remove_owner(*shard_id, *from);
                }
            }
            MetaOperation::AbortTransfer {
                collection,
                shard_id,
                from,
                to,
            } => {
                self.collection_mut(collection)?
                    .abort_transfer(*shard_id, *from, *to)?;
            }
        }
        Ok(())
    }

    fn check_placement<'a>(
        &self,
        shard_count: u32,
        placement: impl Iterator<Item = (&'a ShardId, &'a Vec<PeerId>)>,
    ) -> Result<()> {
        for (shard_id, peers) in placement {
            if *shard_id >= shard_count {
                return Err(Error::BadRequest(format!(
                    "shard {} is out of range (shard count {})",
                    shard_id, shard_count
                )));
            }
            if peers.is_empty() {
                return Err(Error::BadRequest(format!(
                    "shard {} must have at least one owner",
                    shard_id
                )));
            }
            if let Some(unknown) = peers.iter().find(|p| !self.peers.contains_key(*p)) {
                return Err(MembershipError::UnknownPeer(*unknown).into());
            }
            let mut distinct = peers.clone();
            distinct.sort_unstable();
            distinct.dedup();
            if distinct.len() != peers.len() {
                return Err(Error::BadRequest(format!(
                    "shard {} lists the same peer twice",
                    shard_id
                )));
            }
        }
        Ok(())
    }
}

/// Metadata store
pub struct ClusterMetadataStore {
    state: RwLock<Arc<ClusterMetadata>>,
}

impl Default for ClusterMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterMetadataStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(ClusterMetadata::default())),
        }
    }

    /// Current metadata image
    pub fn current(&self) -> Arc<ClusterMetadata> {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, next: ClusterMetadata) {
        let next = Arc::new(next);
        match self.state.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Apply a committed entry. The applied index advances even when the
    /// operation is rejected.
    pub fn apply(&self, op: &MetaOperation, index: u64, term: u64) -> Result<()> {
        let mut next = ClusterMetadata::clone(&self.current());
        let outcome = next.apply(op, index);
        if let Err(e) = &outcome {
            // Discard partial changes of the rejected operation
            next = ClusterMetadata::clone(&self.current());
            tracing::warn!("Metadata operation at index {} rejected: {}", index, e);
        }
        next.last_applied_index = index;
        next.last_applied_term = term;
        self.replace(next);
        outcome
    }

    /// Advance the applied position over an entry without an operation
    /// (leader no-op).
    pub fn skip(&self, index: u64, term: u64) {
        let mut next = ClusterMetadata::clone(&self.current());
        next.last_applied_index = index;
        next.last_applied_term = term;
        self.replace(next);
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self.current().as_ref())?)
    }

    pub fn restore(&self, data: &[u8]) -> Result<Arc<ClusterMetadata>> {
        let restored: ClusterMetadata = bincode::deserialize(data)?;
        self.replace(restored);
        Ok(self.current())
    }

    // === Queries ===

    pub fn last_applied_index(&self) -> u64 {
        self.current().last_applied_index
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.current().collections.keys().cloned().collect()
    }

    pub fn collection(&self, name: &str) -> Result<CollectionMeta> {
        self.current().collection(name).cloned()
    }

    pub fn shard_assignment(&self, name: &str) -> Result<BTreeMap<ShardId, Vec<PeerId>>> {
        Ok(self.collection(name)?.placement)
    }

    pub fn peers(&self) -> BTreeMap<PeerId, PeerInfo> {
        self.current().peers.clone()
    }
}
