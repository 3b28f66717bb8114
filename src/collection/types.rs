//! Collection and point data model

use crate::common::{PeerId, ShardId, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Vector name used when a collection declares a single unnamed vector.
pub const DEFAULT_VECTOR_NAME: &str = "";

/// Arbitrary JSON attached to a point.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Point identifier: an unsigned integer or a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointId {
    Num(u64),
    Uuid(Uuid),
}

impl PointId {
    /// Canonical bytes hashed to pick the shard.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PointId::Num(n) => n.to_be_bytes().to_vec(),
            PointId::Uuid(u) => u.as_bytes().to_vec(),
        }
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointId::Num(n) => write!(f, "{}", n),
            PointId::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<u64> for PointId {
    fn from(n: u64) -> Self {
        PointId::Num(n)
    }
}

impl From<Uuid> for PointId {
    fn from(u: Uuid) -> Self {
        PointId::Uuid(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    #[serde(alias = "cosine")]
    Cosine,
    #[serde(alias = "euclid", alias = "Euclidean", alias = "euclidean")]
    Euclid,
    #[serde(alias = "dot")]
    Dot,
    #[serde(alias = "manhattan")]
    Manhattan,
}

/// Schema of one named vector field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorParams {
    pub size: usize,
    pub distance: Distance,
    #[serde(default)]
    pub optional: bool,
}

/// `vectors` as written by clients: one unnamed vector or a map of named ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorsConfig {
    Single(VectorParams),
    Multi(BTreeMap<String, VectorParams>),
}

impl VectorsConfig {
    pub fn into_named(self) -> BTreeMap<String, VectorParams> {
        match self {
            VectorsConfig::Single(params) => {
                BTreeMap::from([(DEFAULT_VECTOR_NAME.to_string(), params)])
            }
            VectorsConfig::Multi(map) => map,
        }
    }
}

fn default_shard_number() -> u32 {
    1
}

fn default_replication_factor() -> u32 {
    1
}

/// Body of `PUT /collections/{name}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCollection {
    pub vectors: VectorsConfig,
    #[serde(default = "default_shard_number")]
    pub shard_number: u32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

/// Immutable collection parameters, replicated through consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub vectors: BTreeMap<String, VectorParams>,
    pub shard_number: u32,
    pub replication_factor: u32,
}

impl CollectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.shard_number == 0 {
            return Err(bad_input("shard_number must be positive"));
        }
        if self.replication_factor == 0 {
            return Err(bad_input("replication_factor must be positive"));
        }
        if self.vectors.is_empty() {
            return Err(bad_input("collection must declare at least one vector"));
        }
        for (name, params) in &self.vectors {
            if params.size == 0 {
                return Err(bad_input(format!(
                    "vector `{}` must have a positive size",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl From<CreateCollection> for CollectionConfig {
    fn from(req: CreateCollection) -> Self {
        Self {
            vectors: req.vectors.into_named(),
            shard_number: req.shard_number,
            replication_factor: req.replication_factor,
        }
    }
}

fn bad_input(description: impl Into<String>) -> ValidationError {
    ValidationError::BadInput {
        description: description.into(),
    }
}

/// Vectors as written by clients: a plain array for the unnamed vector, or
/// a map of named ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorStruct {
    Single(Vec<f32>),
    Named(BTreeMap<String, Vec<f32>>),
}

impl VectorStruct {
    pub fn into_named(self) -> BTreeMap<String, Vec<f32>> {
        match self {
            VectorStruct::Single(v) => BTreeMap::from([(DEFAULT_VECTOR_NAME.to_string(), v)]),
            VectorStruct::Named(map) => map,
        }
    }

    pub fn from_named(mut map: BTreeMap<String, Vec<f32>>) -> Self {
        if map.len() == 1 {
            if let Some(v) = map.remove(DEFAULT_VECTOR_NAME) {
                return VectorStruct::Single(v);
            }
        }
        VectorStruct::Named(map)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointStruct {
    pub id: PointId,
    pub vector: VectorStruct,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

/// One batch of point mutations. Every variant addresses points by id, so
/// every variant is split across shards the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointOperation {
    UpsertPoints { points: Vec<PointStruct> },
    DeletePoints { ids: Vec<PointId> },
    SetPayload { payload: Payload, points: Vec<PointId> },
    DeletePayload { keys: Vec<String>, points: Vec<PointId> },
    ClearPayload { points: Vec<PointId> },
}

impl PointOperation {
    pub fn point_ids(&self) -> Vec<PointId> {
        match self {
            PointOperation::UpsertPoints { points } => points.iter().map(|p| p.id).collect(),
            PointOperation::DeletePoints { ids } => ids.clone(),
            PointOperation::SetPayload { points, .. }
            | PointOperation::DeletePayload { points, .. }
            | PointOperation::ClearPayload { points } => points.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PointOperation::UpsertPoints { points } => points.len(),
            PointOperation::DeletePoints { ids } => ids.len(),
            PointOperation::SetPayload { points, .. }
            | PointOperation::DeletePayload { points, .. }
            | PointOperation::ClearPayload { points } => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PointOperation::UpsertPoints { .. } => "upsert_points",
            PointOperation::DeletePoints { .. } => "delete_points",
            PointOperation::SetPayload { .. } => "set_payload",
            PointOperation::DeletePayload { .. } => "delete_payload",
            PointOperation::ClearPayload { .. } => "clear_payload",
        }
    }
}

/// Body of `PUT /collections/{name}/points`
#[derive(Debug, Clone, Deserialize)]
pub struct PointInsertOperations {
    pub points: Vec<PointStruct>,
}

/// Body of `POST /collections/{name}/points/delete`
#[derive(Debug, Clone, Deserialize)]
pub struct PointsSelector {
    pub points: Vec<PointId>,
}

/// Body of `POST /collections/{name}/points/payload`
#[derive(Debug, Clone, Deserialize)]
pub struct SetPayloadRequest {
    pub payload: Payload,
    pub points: Vec<PointId>,
}

/// Body of `POST /collections/{name}/points/payload/delete`
#[derive(Debug, Clone, Deserialize)]
pub struct DeletePayloadRequest {
    pub keys: Vec<String>,
    pub points: Vec<PointId>,
}

fn default_true() -> bool {
    true
}

/// Body of `POST /collections/{name}/points`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointRequest {
    pub ids: Vec<PointId>,
    #[serde(default = "default_true")]
    pub with_payload: bool,
    #[serde(default)]
    pub with_vector: bool,
}

/// A stored point as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: PointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorStruct>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    /// Dispatched, outcome not known yet
    Acknowledged,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub operation_id: u64,
    pub status: UpdateStatus,
}

/// Status of a tracked (usually no-wait) operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub operation_id: u64,
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Body of `POST /collections/{name}/cluster`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterOperation {
    /// Make `peers` the owners; peers without a replica receive a copy first
    ReassignShard { shard_id: ShardId, peers: Vec<PeerId> },
    MoveShard {
        shard_id: ShardId,
        from_peer_id: PeerId,
        to_peer_id: PeerId,
    },
    ReplicateShard {
        shard_id: ShardId,
        from_peer_id: PeerId,
        to_peer_id: PeerId,
    },
    AbortTransfer {
        shard_id: ShardId,
        from_peer_id: PeerId,
        to_peer_id: PeerId,
    },
}

/// Serving state of one replica of a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Receives every write and serves reads
    #[default]
    Active,
    /// Missed writes; skipped until a transfer brings it back
    Dead,
    /// Being filled by a shard transfer
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionsResponse {
    pub collections: Vec<CollectionDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub config: CollectionConfig,
    pub shard_count: u32,
    /// Points stored on this peer's replicas
    pub local_points_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalShardInfo {
    pub shard_id: ShardId,
    pub points_count: usize,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteShardInfo {
    pub shard_id: ShardId,
    pub peer_id: PeerId,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardTransferInfo {
    pub shard_id: ShardId,
    pub from: PeerId,
    pub to: PeerId,
    /// The source gives up its replica once the transfer finished
    pub remove_source: bool,
}

/// Body of `GET /collections/{name}/cluster`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionClusterInfo {
    pub peer_id: PeerId,
    pub shard_count: u32,
    pub local_shards: Vec<LocalShardInfo>,
    pub remote_shards: Vec<RemoteShardInfo>,
    pub shard_transfers: Vec<ShardTransferInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_point_id_json() {
        let num: PointId = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(num, PointId::Num(42));

        let uuid: PointId =
            serde_json::from_value(json!("550e8400-e29b-41d4-a716-446655440000")).unwrap();
        assert!(matches!(uuid, PointId::Uuid(_)));
        assert_eq!(uuid.to_string(), "550e8400-e29b-41d4-a716-446655440000");

        assert!(serde_json::from_value::<PointId>(json!("not-an-id")).is_err());
    }

    #[test]
    fn test_point_id_bytes_are_big_endian() {
        assert_eq!(PointId::Num(1).to_bytes(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_named_vectors_config() {
        let req: CreateCollection = serde_json::from_value(json!({
            "vectors": {
                "image": {"size": 4, "distance": "Dot"},
                "text": {"size": 4, "distance": "Cosine"}
            },
            "shard_number": 5
        }))
        .unwrap();
        let config = CollectionConfig::from(req);
        assert_eq!(config.shard_number, 5);
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.vectors["image"].distance, Distance::Dot);
        assert!(!config.vectors["text"].optional);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_vector_config() {
        let req: CreateCollection = serde_json::from_value(json!({
            "vectors": {"size": 3, "distance": "euclid"}
        }))
        .unwrap();
        let config = CollectionConfig::from(req);
        assert_eq!(config.shard_number, 1);
        assert_eq!(config.vectors[DEFAULT_VECTOR_NAME].size, 3);
        assert_eq!(config.vectors[DEFAULT_VECTOR_NAME].distance, Distance::Euclid);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = CollectionConfig {
            vectors: BTreeMap::from([(
                "v".to_string(),
                VectorParams {
                    size: 4,
                    distance: Distance::Dot,
                    optional: false,
                },
            )]),
            shard_number: 0,
            replication_factor: 1,
        };
        assert!(config.validate().is_err());
        config.shard_number = 2;
        config.vectors.get_mut("v").unwrap().size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vector_struct_forms() {
        let single: VectorStruct = serde_json::from_value(json!([0.1, 0.2])).unwrap();
        assert_eq!(single.clone().into_named()[DEFAULT_VECTOR_NAME], vec![0.1, 0.2]);
        assert_eq!(VectorStruct::from_named(single.into_named()), VectorStruct::Single(vec![0.1, 0.2]));

        let named: VectorStruct = serde_json::from_value(json!({"image": [1.0]})).unwrap();
        assert_eq!(named.into_named().len(), 1);
    }

    #[test]
    fn test_operation_point_ids() {
        let op = PointOperation::DeletePayload {
            keys: vec!["color".into()],
            points: vec![PointId::Num(3), PointId::Num(9)],
        };
        assert_eq!(op.point_ids(), vec![PointId::Num(3), PointId::Num(9)]);
        assert_eq!(op.len(), 2);
        assert_eq!(op.kind(), "delete_payload");
        assert!(PointOperation::ClearPayload { points: vec![] }.is_empty());
    }

    #[test]
    fn test_cluster_operation_json() {
        let op: ClusterOperation = serde_json::from_value(json!({
            "move_shard": {"shard_id": 2, "from_peer_id": 1, "to_peer_id": 3}
        }))
        .unwrap();
        assert!(matches!(
            op,
            ClusterOperation::MoveShard {
                shard_id: 2,
                from_peer_id: 1,
                to_peer_id: 3
            }
        ));

        let op: ClusterOperation =
            serde_json::from_value(json!({"reassign_shard": {"shard_id": 0, "peers": [2]}}))
                .unwrap();
        assert!(matches!(op, ClusterOperation::ReassignShard { shard_id: 0, .. }));

        assert_eq!(serde_json::to_value(ReplicaState::Partial).unwrap(), json!("partial"));
    }
}
