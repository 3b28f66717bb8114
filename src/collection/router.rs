//! Point → shard routing
//!
//! A point belongs to shard `blake3(id bytes) mod shard_count`. The shard
//! count of a collection never changes, so neither does the mapping.

use crate::collection::types::{PointId, PointOperation, PointStruct, ReplicaState};
use crate::common::{shard_key, Error, PeerId, Result, ShardId};
use crate::coordinator::metadata::ClusterMetadata;
use std::collections::BTreeMap;

pub fn shard_for(id: &PointId, shard_count: u32) -> ShardId {
    shard_key(&id.to_bytes(), shard_count)
}

/// Group point ids by shard, keeping their relative order.
pub fn route(ids: &[PointId], shard_count: u32) -> BTreeMap<ShardId, Vec<PointId>> {
    let mut by_shard: BTreeMap<ShardId, Vec<PointId>> = BTreeMap::new();
    for id in ids {
        by_shard
            .entry(shard_for(id, shard_count))
            .or_default()
            .push(*id);
    }
    by_shard
}

/// Split a batch into one sub-batch per touched shard. Points keep their
/// submission order within a sub-batch.
pub fn split(operation: PointOperation, shard_count: u32) -> BTreeMap<ShardId, PointOperation> {
    match operation {
        PointOperation::UpsertPoints { points } => {
            let mut by_shard: BTreeMap<ShardId, Vec<PointStruct>> = BTreeMap::new();
            for point in points {
                by_shard
                    .entry(shard_for(&point.id, shard_count))
                    .or_default()
                    .push(point);
            }
            by_shard
                .into_iter()
                .map(|(shard, points)| (shard, PointOperation::UpsertPoints { points }))
                .collect()
        }
        PointOperation::DeletePoints { ids } => route(&ids, shard_count)
            .into_iter()
            .map(|(shard, ids)| (shard, PointOperation::DeletePoints { ids }))
            .collect(),
        PointOperation::SetPayload { payload, points } => route(&points, shard_count)
            .into_iter()
            .map(|(shard, points)| {
                (
                    shard,
                    PointOperation::SetPayload {
                        payload: payload.clone(),
                        points,
                    },
                )
            })
            .collect(),
        PointOperation::DeletePayload { keys, points } => route(&points, shard_count)
            .into_iter()
            .map(|(shard, points)| {
                (
                    shard,
                    PointOperation::DeletePayload {
                        keys: keys.clone(),
                        points,
                    },
                )
            })
            .collect(),
        PointOperation::ClearPayload { points } => route(&points, shard_count)
            .into_iter()
            .map(|(shard, points)| (shard, PointOperation::ClearPayload { points }))
            .collect(),
    }
}

/// A shard owner and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub peer_id: PeerId,
    pub uri: String,
    pub state: ReplicaState,
}

impl Replica {
    pub fn is_active(&self) -> bool {
        self.state == ReplicaState::Active
    }
}

/// Owners of `shard_id` in `collection`, in placement order.
pub fn resolve(state: &ClusterMetadata, collection: &str, shard_id: ShardId) -> Result<Vec<Replica>> {
    let meta = state.collection(collection)?;
    let owners = meta
        .replicas(shard_id)
        .ok_or(Error::ShardNotFound(shard_id))?;
    owners
        .iter()
        .map(|peer_id| {
            state
                .peer_uri(*peer_id)
                .map(|uri| Replica {
                    peer_id: *peer_id,
                    uri: uri.to_string(),
                    state: meta.replica_state(shard_id, *peer_id).unwrap_or_default(),
                })
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "shard {} of `{}` is placed on unknown peer {}",
                        shard_id, collection, peer_id
                    ))
                })
        })
        .collect()
}
