//! In-process clusters for integration tests

#![allow(dead_code)]

use minivec::common::{Config, ConsensusConfig, NodeConfig, PeerId, WriteConfig};
use minivec::coordinator::transport::LocalRaftNetwork;
use minivec::shard::remote::LocalShardNetwork;
use minivec::Peer;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub fn peer_uri(id: PeerId) -> String {
    format!("local://peer-{}", id)
}

pub fn test_config(id: PeerId, bootstrap: Option<String>, data_path: Option<PathBuf>) -> Config {
    Config {
        node: NodeConfig {
            peer_id: Some(id),
            uri: Some(peer_uri(id)),
            bootstrap,
            data_path,
            ..NodeConfig::default()
        },
        consensus: ConsensusConfig {
            heartbeat_interval_ms: 20,
            election_timeout_ms: 150,
            propose_timeout_ms: 3_000,
            rpc_timeout_ms: 300,
            max_append_entries: 64,
            snapshot_threshold: 1_000,
        },
        write: WriteConfig {
            timeout_ms: 5_000,
            remote_retries: 5,
            retry_delay_ms: 20,
            catch_up_timeout_ms: 2_000,
            max_tracked_operations: 100,
            transfer_timeout_ms: 5_000,
            recovery_interval_ms: 100,
            transfer_batch_size: 64,
        },
        ..Config::default()
    }
}

pub struct TestCluster {
    pub raft_network: Arc<LocalRaftNetwork>,
    pub shard_network: Arc<LocalShardNetwork>,
    pub peers: Vec<Peer>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            raft_network: LocalRaftNetwork::new(),
            shard_network: LocalShardNetwork::new(),
            peers: Vec::new(),
        }
    }

    /// Build a peer wired to the in-process networks, without starting it.
    pub fn build_peer(&self, config: Config) -> Peer {
        let uri = config.node.advertised_uri();
        let peer = Peer::build(
            config,
            self.raft_network.transport(&uri),
            self.shard_network.transport(&uri),
        )
        .expect("peer builds");
        self.raft_network.register(&uri, peer.consensus());
        self.shard_network.register(&uri, peer.collections());
        peer
    }

    /// Start peer `id`: the first peer bootstraps, later ones join peer 1.
    pub async fn add_peer(&mut self, id: PeerId, data_path: Option<PathBuf>) {
        self.add_tuned_peer(id, data_path, |_| {}).await;
    }

    pub async fn add_tuned_peer(
        &mut self,
        id: PeerId,
        data_path: Option<PathBuf>,
        tune: fn(&mut Config),
    ) {
        let bootstrap = if self.peers.is_empty() {
            None
        } else {
            Some(peer_uri(self.peers[0].id()))
        };
        let mut config = test_config(id, bootstrap, data_path);
        tune(&mut config);
        let peer = self.build_peer(config);
        peer.start().await.expect("peer starts");
        self.peers.push(peer);
    }

    pub async fn start(size: u64) -> Self {
        Self::start_with(size, |_| {}).await
    }

    /// Start `size` peers, each with its config adjusted by `tune`.
    pub async fn start_with(size: u64, tune: fn(&mut Config)) -> Self {
        let mut cluster = Self::new();
        for id in 1..=size {
            cluster.add_tuned_peer(id, None, tune).await;
        }
        let expected = size as usize;
        cluster
            .wait_until(|c| {
                c.peers
                    .iter()
                    .all(|p| p.consensus().metadata().peers().len() == expected)
            })
            .await;
        cluster
    }

    pub fn peer(&self, id: PeerId) -> &Peer {
        self.peers
            .iter()
            .find(|p| p.id() == id)
            .expect("peer exists")
    }

    /// Peers that currently consider themselves leader.
    pub fn leaders(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|p| p.consensus().node().is_leader())
            .map(|p| p.id())
            .collect()
    }

    pub async fn wait_until(&self, check: impl Fn(&Self) -> bool) {
        for _ in 0..250 {
            if check(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 5s");
    }

    pub fn shutdown(&self) {
        for peer in &self.peers {
            peer.shutdown();
        }
    }
}

/// Poll an async condition for up to 5 seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}
