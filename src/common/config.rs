//! Configuration for minivec peers
//!
//! Layered loading: an optional TOML file, then `MINIVEC_*` environment
//! variables (`__` separates sections, e.g. `MINIVEC_NODE__PEER_ID=7`),
//! then command-line overrides applied by the binary.

use crate::common::PeerId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub write: WriteConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `path` (or `./minivec.toml` when present)
    /// and the environment.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name("minivec").required(false)),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("MINIVEC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.consensus.validate()?;
        if self.write.timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "write.timeout_ms must be positive".into(),
            ));
        }
        if self.write.transfer_batch_size == 0 || self.write.recovery_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "write.transfer_batch_size and write.recovery_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Peer identity and addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peer id; a random one is generated when absent
    #[serde(default)]
    pub peer_id: Option<PeerId>,

    /// Bind address for the HTTP API (public + internal routes)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// URI other peers use to reach this one; defaults to `http://<bind_addr>`
    #[serde(default)]
    pub uri: Option<String>,

    /// URI of an existing peer to join; a new cluster is bootstrapped when absent
    #[serde(default)]
    pub bootstrap: Option<String>,

    /// Directory for the Raft state and shard WALs; in-memory when absent
    #[serde(default)]
    pub data_path: Option<PathBuf>,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6333))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            bind_addr: default_bind_addr(),
            uri: None,
            bootstrap: None,
            data_path: None,
        }
    }
}

impl NodeConfig {
    pub fn peer_id_or_random(&self) -> PeerId {
        self.peer_id.unwrap_or_else(|| rand::random::<u64>() >> 1)
    }

    pub fn advertised_uri(&self) -> String {
        self.uri
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr))
    }
}

/// Raft timing and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Leader heartbeat interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout; the actual timeout is drawn from [t, 2t)
    #[serde(default = "default_election_timeout")]
    pub election_timeout_ms: u64,

    /// How long a proposal may wait for its commit
    #[serde(default = "default_propose_timeout")]
    pub propose_timeout_ms: u64,

    /// Timeout of a single consensus RPC
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Maximum number of log entries per AppendEntries request
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,

    /// Applied entries kept in the log before it is compacted into a snapshot
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
}

fn default_heartbeat_interval() -> u64 {
    50
}
fn default_election_timeout() -> u64 {
    300
}
fn default_propose_timeout() -> u64 {
    10_000
}
fn default_rpc_timeout() -> u64 {
    1_000
}
fn default_max_append_entries() -> usize {
    256
}
fn default_snapshot_threshold() -> u64 {
    1_000
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            election_timeout_ms: default_election_timeout(),
            propose_timeout_ms: default_propose_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            max_append_entries: default_max_append_entries(),
            snapshot_threshold: default_snapshot_threshold(),
        }
    }
}

impl ConsensusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.heartbeat_interval_ms == 0 || self.election_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "consensus timings must be positive".into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "heartbeat interval ({}ms) must be shorter than the election timeout ({}ms)",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        if self.max_append_entries == 0 || self.snapshot_threshold == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_append_entries and snapshot_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Shard storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub wal_sync: WalSyncPolicy,
}

/// WAL fsync policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every record
    Always,
    /// flush to the OS after every record
    #[default]
    Interval,
    /// leave buffering to the writer
    Never,
}

/// Write path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// How long a synchronous write waits for all shards
    #[serde(default = "default_write_timeout")]
    pub timeout_ms: u64,

    /// Attempts for a remote shard call failing with a transient error
    #[serde(default = "default_remote_retries")]
    pub remote_retries: usize,

    /// Initial backoff between remote attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// How long a shard owner waits for its metadata to catch up with the
    /// routing peer before answering "still syncing"
    #[serde(default = "default_catch_up_timeout")]
    pub catch_up_timeout_ms: u64,

    /// Number of finished operations kept for status queries
    #[serde(default = "default_max_tracked_operations")]
    pub max_tracked_operations: usize,

    /// How long a shard move or replication may take
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,

    /// Period of the check that recovers dead replicas
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_ms: u64,

    /// Points per request when copying a shard to another peer
    #[serde(default = "default_transfer_batch_size")]
    pub transfer_batch_size: usize,
}

fn default_write_timeout() -> u64 {
    30_000
}
fn default_remote_retries() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    100
}
fn default_catch_up_timeout() -> u64 {
    2_000
}
fn default_max_tracked_operations() -> usize {
    10_000
}
fn default_transfer_timeout() -> u64 {
    60_000
}
fn default_recovery_interval() -> u64 {
    1_000
}
fn default_transfer_batch_size() -> usize {
    256
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_write_timeout(),
            remote_retries: default_remote_retries(),
            retry_delay_ms: default_retry_delay(),
            catch_up_timeout_ms: default_catch_up_timeout(),
            max_tracked_operations: default_max_tracked_operations(),
            transfer_timeout_ms: default_transfer_timeout(),
            recovery_interval_ms: default_recovery_interval(),
            transfer_batch_size: default_transfer_batch_size(),
        }
    }
}

impl WriteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.consensus.heartbeat_interval_ms, 50);
        assert_eq!(config.consensus.election_timeout_ms, 300);
        assert_eq!(config.storage.wal_sync, WalSyncPolicy::Interval);
        assert_eq!(config.node.advertised_uri(), "http://0.0.0.0:6333");
        assert_eq!(config.write.transfer_batch_size, 256);
        assert_eq!(config.write.recovery_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[node]
peer_id = 7
bind_addr = "127.0.0.1:7000"
bootstrap = "http://127.0.0.1:6333"

[consensus]
heartbeat_interval_ms = 20

[storage]
wal_sync = "always"
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.node.peer_id, Some(7));
        assert_eq!(config.node.advertised_uri(), "http://127.0.0.1:7000");
        assert_eq!(
            config.node.bootstrap.as_deref(),
            Some("http://127.0.0.1:6333")
        );
        assert_eq!(config.consensus.heartbeat_interval_ms, 20);
        assert_eq!(config.consensus.election_timeout_ms, 300);
        assert_eq!(config.storage.wal_sync, WalSyncPolicy::Always);
    }

    #[test]
    fn test_invalid_timings_rejected() {
        let consensus = ConsensusConfig {
            heartbeat_interval_ms: 500,
            election_timeout_ms: 300,
            ..Default::default()
        };
        assert!(consensus.validate().is_err());
    }
}
