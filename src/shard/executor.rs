//! Validation and application of one shard's sub-batch
//!
//! A sub-batch is all-or-nothing: every point is validated first, and a
//! single invalid point rejects the whole sub-batch before anything reaches
//! the WAL. Valid sub-batches are applied unconditionally.

use crate::collection::types::{
    CollectionConfig, Distance, PointOperation, PointStruct, VectorStruct,
};
use crate::common::{ShardApplyError, ShardId, ValidationError};
use crate::shard::store::ShardStore;
use std::collections::BTreeMap;

/// Check the vectors of one point against the collection schema.
pub fn validate_point(config: &CollectionConfig, point: &PointStruct) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let supplied: BTreeMap<&str, usize> = match &point.vector {
        VectorStruct::Single(v) => BTreeMap::from([("", v.len())]),
        VectorStruct::Named(map) => map.iter().map(|(k, v)| (k.as_str(), v.len())).collect(),
    };

    for (name, params) in &config.vectors {
        match supplied.get(name.as_str()) {
            None if !params.optional => errors.push(ValidationError::MissingVectorField {
                point_id: point.id,
                field: name.clone(),
            }),
            Some(&got) if got != params.size => errors.push(ValidationError::DimensionMismatch {
                point_id: point.id,
                field: name.clone(),
                expected: params.size,
                got,
            }),
            _ => {}
        }
    }

    for name in supplied.keys() {
        if !config.vectors.contains_key(*name) {
            errors.push(ValidationError::UnknownVectorField {
                point_id: point.id,
                field: name.to_string(),
            });
        }
    }

    errors
}

/// Validate a sub-batch against the schema and the shard's current points.
pub fn validate(
    config: &CollectionConfig,
    store: &ShardStore,
    operation: &PointOperation,
) -> Vec<ValidationError> {
    match operation {
        PointOperation::UpsertPoints { points } => points
            .iter()
            .flat_map(|point| validate_point(config, point))
            .collect(),
        PointOperation::DeletePoints { .. } => Vec::new(),
        PointOperation::SetPayload { points, .. }
        | PointOperation::DeletePayload { points, .. }
        | PointOperation::ClearPayload { points } => points
            .iter()
            .filter(|id| !store.contains(id))
            .map(|id| ValidationError::PointNotFound { point_id: *id })
            .collect(),
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Bring vectors into their stored form (unit length for cosine fields).
pub fn preprocess(config: &CollectionConfig, operation: &mut PointOperation) {
    let PointOperation::UpsertPoints { points } = operation else {
        return;
    };

    for point in points.iter_mut() {
        match &mut point.vector {
            VectorStruct::Single(v) => {
                if let Some(params) = config.vectors.get("") {
                    if params.distance == Distance::Cosine {
                        normalize(v);
                    }
                }
            }
            VectorStruct::Named(map) => {
                for (name, v) in map.iter_mut() {
                    if let Some(params) = config.vectors.get(name) {
                        if params.distance == Distance::Cosine {
                            normalize(v);
                        }
                    }
                }
            }
        }
    }
}

/// Validate and apply a sub-batch to one shard.
pub fn apply(
    config: &CollectionConfig,
    shard_id: ShardId,
    store: &mut ShardStore,
    mut operation: PointOperation,
) -> Result<(), ShardApplyError> {
    let errors = validate(config, store, &operation);
    if !errors.is_empty() {
        tracing::warn!(
            "Shard {} rejected {} of {} points ({})",
            shard_id,
            errors.len(),
            operation.len(),
            operation.kind()
        );
        return Err(ShardApplyError::rejected(shard_id, &errors));
    }

    preprocess(config, &mut operation);

    store
        .apply(operation)
        .map_err(|e| ShardApplyError::from_error(shard_id, &e))
}
