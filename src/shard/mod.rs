//! Shard replicas held by a peer
//!
//! - Write-ahead log per shard for durability
//! - In-memory point store rebuilt from the log on open
//! - Validation of point operations against the collection schema
//! - Peer-to-peer transport for sub-batches
//! - Shard transfers that copy, move and recover replicas

pub mod executor;
pub mod holder;
pub mod remote;
pub mod store;
pub mod transfer;
pub mod wal;

pub use holder::ShardHolder;
