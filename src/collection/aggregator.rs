//! Merging per-shard outcomes into one client result

use crate::common::{merge_classes, AggregateError, ShardApplyError, ShardId};
use std::collections::HashSet;

/// Outcome of one shard's sub-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    Success { shard_id: ShardId },
    Failure(ShardApplyError),
}

impl ShardOutcome {
    pub fn shard_id(&self) -> ShardId {
        match self {
            ShardOutcome::Success { shard_id } => *shard_id,
            ShardOutcome::Failure(e) => e.shard_id,
        }
    }
}

/// All shards succeeded, or `k out of n` of them failed.
///
/// Causes are listed in shard order, each distinct message once. Shards
/// that succeeded stay applied.
pub fn aggregate(mut outcomes: Vec<ShardOutcome>) -> Result<(), AggregateError> {
    outcomes.sort_by_key(ShardOutcome::shard_id);
    let total = outcomes.len();

    let failures: Vec<ShardApplyError> = outcomes
        .into_iter()
        .filter_map(|outcome| match outcome {
            ShardOutcome::Failure(e) => Some(e),
            ShardOutcome::Success { .. } => None,
        })
        .collect();
    if failures.is_empty() {
        return Ok(());
    }

    let class = merge_classes(failures.iter().flat_map(|f| f.causes.iter().map(|c| c.class)));
    let mut seen = HashSet::new();
    let causes = failures
        .iter()
        .flat_map(|f| f.causes.iter())
        .filter(|cause| seen.insert(cause.message.clone()))
        .map(|cause| cause.message.clone())
        .collect();

    Err(AggregateError {
        failed: failures.len(),
        total,
        class,
        causes,
    })
}
