//! Raft message structures exchanged between peers

use crate::common::{FailureCause, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A replicated log entry. Empty `data` is a leader no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn is_noop(&self) -> bool {
        self.data.is_empty()
    }
}

/// State machine image covering every entry up to `last_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    /// Voting members (peer id → URI) as of `last_index`
    pub voters: BTreeMap<PeerId, String>,
    /// Encoded metadata state
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: PeerId,
    pub leader_uri: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index known to match the leader (on success)
    pub match_index: u64,
    /// Where the leader should retry from (on failure)
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: PeerId,
    pub leader_uri: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub match_index: u64,
}

/// Follower → leader proposal forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeResponse {
    pub index: u64,
    pub term: u64,
    /// Deterministic apply failure; the entry is a no-op on every peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureCause>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer_id: PeerId,
    pub uri: String,
}

/// Everything a new peer needs to start following: the state including its
/// own `AddPeer`, plus where the leader is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub snapshot: Snapshot,
    pub leader_id: Option<PeerId>,
    pub leader_uri: Option<String>,
}
