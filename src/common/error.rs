//! Error types for minivec
//!
//! One crate-wide [`Error`] gathers the taxonomy of the write path and the
//! coordination layer:
//! - [`ValidationError`]: a point does not match the collection schema
//! - [`ShardApplyError`]: a sub-batch was rejected by one shard
//! - [`AggregateError`]: k out of n shards rejected a fanned-out operation
//! - [`ConsensusError`]: not leader, not caught up, proposal timed out
//! - [`MembershipError`]: join/leave rejected

use crate::collection::types::PointId;
use crate::common::{PeerId, ShardId};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure class. Decides the surfaced status code and whether a
/// caller may retry blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    BadInput,
    NotFound,
    Transient,
    Timeout,
    Internal,
}

impl ErrorClass {
    /// Was the failure caused by the request itself?
    pub fn is_client_error(&self) -> bool {
        matches!(self, ErrorClass::BadInput | ErrorClass::NotFound)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Timeout)
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorClass::BadInput => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Inverse of [`ErrorClass::http_status`], for errors relayed by peers.
    pub fn from_http_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorClass::BadInput,
            StatusCode::NOT_FOUND => ErrorClass::NotFound,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorClass::Timeout,
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => ErrorClass::Transient,
            s if s.is_client_error() => ErrorClass::BadInput,
            _ => ErrorClass::Internal,
        }
    }

    /// Severity order used when merging causes: internal > transient > client.
    fn severity(&self) -> u8 {
        match self {
            ErrorClass::BadInput | ErrorClass::NotFound => 0,
            ErrorClass::Transient | ErrorClass::Timeout => 1,
            ErrorClass::Internal => 2,
        }
    }
}

/// A point violates the collection schema.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Wrong input: Missed vector name error: {field}")]
    MissingVectorField { point_id: PointId, field: String },

    #[error("Wrong input: Vector inserting error: expected dim: {expected}, got {got}")]
    DimensionMismatch {
        point_id: PointId,
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("Wrong input: Not existing vector name error: {field}")]
    UnknownVectorField { point_id: PointId, field: String },

    #[error("Not found: No point with id {point_id} found")]
    PointNotFound { point_id: PointId },

    #[error("Wrong input: {description}")]
    BadInput { description: String },
}

impl ValidationError {
    pub fn point_id(&self) -> Option<PointId> {
        match self {
            ValidationError::MissingVectorField { point_id, .. }
            | ValidationError::DimensionMismatch { point_id, .. }
            | ValidationError::UnknownVectorField { point_id, .. }
            | ValidationError::PointNotFound { point_id } => Some(*point_id),
            ValidationError::BadInput { .. } => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ValidationError::PointNotFound { .. } => ErrorClass::NotFound,
            _ => ErrorClass::BadInput,
        }
    }
}

/// A failure cause that can cross the network between peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureCause {
    pub class: ErrorClass,
    pub message: String,
}

impl FailureCause {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&ValidationError> for FailureCause {
    fn from(e: &ValidationError) -> Self {
        FailureCause::new(e.class(), e.to_string())
    }
}

/// A shard rejected its sub-batch. Nothing of the sub-batch was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardApplyError {
    pub shard_id: ShardId,
    pub causes: Vec<FailureCause>,
}

impl ShardApplyError {
    /// Sub-batch rejected because some of its points failed validation.
    pub fn rejected(shard_id: ShardId, errors: &[ValidationError]) -> Self {
        Self {
            shard_id,
            causes: errors.iter().map(FailureCause::from).collect(),
        }
    }

    pub fn from_error(shard_id: ShardId, err: &Error) -> Self {
        match err {
            Error::ShardApply(e) => Self {
                shard_id,
                causes: e.causes.clone(),
            },
            other => Self {
                shard_id,
                causes: vec![other.to_failure_cause()],
            },
        }
    }

    /// Most severe class among the causes.
    pub fn class(&self) -> ErrorClass {
        merge_classes(self.causes.iter().map(|c| c.class))
    }
}

impl fmt::Display for ShardApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shard {} failed to apply operation", self.shard_id)?;
        if let Some(first) = self.causes.first() {
            write!(f, ": {}", first)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShardApplyError {}

/// k out of n touched shards rejected an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateError {
    pub failed: usize,
    pub total: usize,
    pub class: ErrorClass,
    /// Distinct cause messages, in shard order.
    pub causes: Vec<String>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.class {
            ErrorClass::BadInput | ErrorClass::NotFound => "Wrong input",
            ErrorClass::Transient | ErrorClass::Timeout => "Service unavailable",
            ErrorClass::Internal => "Service internal error",
        };
        write!(
            f,
            "{}: {} out of {} shards failed to apply operation",
            prefix, self.failed, self.total
        )?;
        for cause in &self.causes {
            write!(f, "\n{}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Consensus-layer rejection. Always retryable against the current leader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Not leader: current leader is {}, retry against it", leader_hint(.leader))]
    NotLeader { leader: Option<String> },

    #[error("Consensus timeout: operation was not committed within {0:?}, retry later")]
    Timeout(Duration),

    #[error("Peer is still syncing: applied index {applied}, required {required}")]
    NotCaughtUp { applied: u64, required: u64 },

    #[error("Proposal at index {index} was overwritten by a newer leader, retry")]
    ProposalDropped { index: u64 },

    #[error("Consensus is not running on this peer")]
    Stopped,
}

fn leader_hint(leader: &Option<String>) -> &str {
    leader.as_deref().unwrap_or("unknown")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Peer {peer_id} is already registered with address {address}")]
    DuplicatePeerId { peer_id: PeerId, address: String },

    #[error("Peer {0} is not a member of the cluster")]
    UnknownPeer(PeerId),

    #[error("Peer {peer_id} still owns shards of collection `{collection}`")]
    PeerHasShards { peer_id: PeerId, collection: String },

    #[error("Join rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O & storage ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Write path ===
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ShardApply(#[from] ShardApplyError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    // === Coordination ===
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    // === Lookups ===
    #[error("Not found: Collection `{0}` doesn't exist!")]
    CollectionNotFound(String),

    #[error("Wrong input: Collection `{0}` already exists!")]
    CollectionExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("Wrong input: {0}")]
    BadRequest(String),

    // === Network ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Error reported by another peer.
    #[error("{0}")]
    Remote(FailureCause),

    // === Config ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Service internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(e) => e.class(),
            Error::CollectionExists(_)
            | Error::BadRequest(_)
            | Error::Membership(_)
            | Error::InvalidConfig(_) => ErrorClass::BadInput,
            Error::CollectionNotFound(_) | Error::NotFound(_) | Error::ShardNotFound(_) => {
                ErrorClass::NotFound
            }
            Error::ShardApply(e) => e.class(),
            Error::Aggregate(e) => e.class,
            Error::Consensus(ConsensusError::Timeout(_)) | Error::Timeout(_) => {
                ErrorClass::Timeout
            }
            Error::Consensus(_)
            | Error::Http(_)
            | Error::ConnectionFailed(_)
            | Error::Unavailable(_) => ErrorClass::Transient,
            Error::Remote(cause) => cause.class,
            Error::Io(_)
            | Error::Wal(_)
            | Error::Corrupted(_)
            | Error::Serialization(_)
            | Error::Internal(_)
            | Error::Other(_) => ErrorClass::Internal,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        self.class().http_status()
    }

    pub fn to_failure_cause(&self) -> FailureCause {
        match self {
            Error::Remote(cause) => cause.clone(),
            other => FailureCause::new(other.class(), other.to_string()),
        }
    }
}

/// Most severe class of a set of causes; client errors when empty.
pub fn merge_classes(classes: impl IntoIterator<Item = ErrorClass>) -> ErrorClass {
    classes
        .into_iter()
        .max_by_key(|c| c.severity())
        .unwrap_or(ErrorClass::BadInput)
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        let missing = ValidationError::MissingVectorField {
            point_id: PointId::Num(2),
            field: "text".to_string(),
        };
        assert_eq!(
            missing.to_string(),
            "Wrong input: Missed vector name error: text"
        );
        assert_eq!(missing.point_id(), Some(PointId::Num(2)));

        let dim = ValidationError::DimensionMismatch {
            point_id: PointId::Num(1),
            field: "image".to_string(),
            expected: 4,
            got: 3,
        };
        assert_eq!(
            dim.to_string(),
            "Wrong input: Vector inserting error: expected dim: 4, got 3"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            Error::CollectionNotFound("c".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Consensus(ConsensusError::NotLeader { leader: None }).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let timeout = Error::Consensus(ConsensusError::Timeout(Duration::from_secs(1)));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(timeout.to_http_status().is_server_error());
        assert_eq!(
            ErrorClass::from_http_status(StatusCode::GATEWAY_TIMEOUT),
            ErrorClass::Timeout
        );
        assert!(!Error::BadRequest("x".into()).is_retryable());
        assert_eq!(
            Error::Unavailable("no active replica".into()).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Wal("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_not_leader_message_names_leader() {
        let err = ConsensusError::NotLeader {
            leader: Some("http://peer-1:6333".into()),
        };
        assert!(err.to_string().contains("http://peer-1:6333"));
        let err = ConsensusError::NotLeader { leader: None };
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_aggregate_display() {
        let err = AggregateError {
            failed: 1,
            total: 3,
            class: ErrorClass::BadInput,
            causes: vec!["Wrong input: Missed vector name error: text".into()],
        };
        assert_eq!(
            err.to_string(),
            "Wrong input: 1 out of 3 shards failed to apply operation\nWrong input: Missed vector name error: text"
        );
    }

    #[test]
    fn test_shard_apply_class_is_most_severe() {
        let err = ShardApplyError {
            shard_id: 0,
            causes: vec![
                FailureCause::new(ErrorClass::BadInput, "a"),
                FailureCause::new(ErrorClass::Internal, "b"),
            ],
        };
        assert_eq!(err.class(), ErrorClass::Internal);
        assert_eq!(Error::from(err).to_http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
