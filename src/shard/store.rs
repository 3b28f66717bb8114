//! In-memory point storage of one shard, optionally backed by a WAL

use crate::collection::types::{
    Payload, PointId, PointOperation, PointStruct, Record, VectorStruct,
};
use crate::common::{Result, ShardId, WalSyncPolicy};
use crate::shard::wal::Wal;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub vectors: BTreeMap<String, Vec<f32>>,
    pub payload: Option<Payload>,
}

pub struct ShardStore {
    shard_id: ShardId,
    points: HashMap<PointId, StoredPoint>,
    wal: Option<Wal>,
}

impl ShardStore {
    pub fn in_memory(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            points: HashMap::new(),
            wal: None,
        }
    }

    /// Open a persistent shard, replaying its WAL.
    pub fn open(shard_id: ShardId, dir: &Path, sync_policy: WalSyncPolicy) -> Result<Self> {
        let wal_path = dir.join("wal.log");
        let mut store = Self::in_memory(shard_id);

        let mut replayed = 0usize;
        Wal::replay(&wal_path, |entry| {
            store.apply_in_memory(entry.operation);
            replayed += 1;
            Ok(())
        })?;

        store.wal = Some(Wal::open(&wal_path, sync_policy)?);

        if replayed > 0 {
            tracing::info!(
                "Shard {} recovered {} points from {} WAL records",
                shard_id,
                store.points.len(),
                replayed
            );
        }

        Ok(store)
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn contains(&self, id: &PointId) -> bool {
        self.points.contains_key(id)
    }

    pub fn get(&self, id: &PointId) -> Option<&StoredPoint> {
        self.points.get(id)
    }

    /// Log the operation, then apply it. The operation must already be
    /// validated: nothing here can reject a single point.
    pub fn apply(&mut self, operation: PointOperation) -> Result<()> {
        if let Some(wal) = self.wal.as_mut() {
            wal.append(&operation)?;
        }
        self.apply_in_memory(operation);
        Ok(())
    }

    fn apply_in_memory(&mut self, operation: PointOperation) {
        match operation {
            PointOperation::UpsertPoints { points } => {
                for point in points {
                    self.points.insert(
                        point.id,
                        StoredPoint {
                            vectors: point.vector.into_named(),
                            payload: point.payload,
                        },
                    );
                }
            }
            PointOperation::DeletePoints { ids } => {
                for id in ids {
                    self.points.remove(&id);
                }
            }
            PointOperation::SetPayload { payload, points } => {
                for id in points {
                    if let Some(point) = self.points.get_mut(&id) {
                        let current = point.payload.get_or_insert_with(Payload::new);
                        for (key, value) in &payload {
                            current.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            PointOperation::DeletePayload { keys, points } => {
                for id in points {
                    if let Some(payload) = self.points.get_mut(&id).and_then(|p| p.payload.as_mut())
                    {
                        for key in &keys {
                            payload.remove(key);
                        }
                    }
                }
            }
            PointOperation::ClearPayload { points } => {
                for id in points {
                    if let Some(point) = self.points.get_mut(&id) {
                        point.payload = None;
                    }
                }
            }
        }
    }

    /// Every stored point, ordered by id.
    pub fn export(&self) -> Vec<PointStruct> {
        let mut points: Vec<PointStruct> = self
            .points
            .iter()
            .map(|(id, point)| PointStruct {
                id: *id,
                vector: VectorStruct::from_named(point.vectors.clone()),
                payload: point.payload.clone(),
            })
            .collect();
        points.sort_by_key(|p| p.id);
        points
    }

    pub fn retrieve(&self, ids: &[PointId], with_payload: bool, with_vector: bool) -> Vec<Record> {
        ids.iter()
            .filter_map(|id| {
                self.points.get(id).map(|point| Record {
                    id: *id,
                    payload: if with_payload {
                        point.payload.clone()
                    } else {
                        None
                    },
                    vector: with_vector.then(|| VectorStruct::from_named(point.vectors.clone())),
                })
            })
            .collect()
    }
}
