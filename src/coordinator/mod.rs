//! Cluster coordination with Raft consensus
//!
//! Every peer runs a coordinator, responsible for:
//! - Cluster metadata (peers, collections, shard placement)
//! - Placement decisions (HRW over the peers present)
//! - Consensus via Raft, with snapshots for lagging peers
//! - The public HTTP API and the peer-to-peer endpoints

pub mod consensus;
pub mod http;
pub mod metadata;
pub mod placement;
pub mod raft_node;
pub mod raft_storage;
pub mod server;
pub mod transport;

pub use server::Peer;
