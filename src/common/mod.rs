//! Common utilities and types shared across minivec

pub mod api;
pub mod config;
pub mod error;
pub mod hash;
pub mod raft;
pub mod tracing_middleware;
pub mod utils;

/// Cluster-unique peer identifier.
pub type PeerId = u64;

/// Shard index within a collection, in `[0, shard_count)`.
pub type ShardId = u32;

pub use config::{Config, ConsensusConfig, NodeConfig, StorageConfig, WalSyncPolicy, WriteConfig};
pub use error::{
    merge_classes, AggregateError, ConsensusError, Error, ErrorClass, FailureCause,
    MembershipError, Result, ShardApplyError, ValidationError,
};
pub use hash::{hrw_hash, select_replicas, shard_key};
pub use utils::{crc32, parse_duration, retry_with_backoff, validate_collection_name};
