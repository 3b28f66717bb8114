//! Consensus behaviour of in-process clusters

mod common;

use common::{eventually, TestCluster};
use minivec::collection::types::{CreateCollection, Distance, VectorParams, VectorsConfig};
use minivec::common::{ConsensusError, Error, ErrorClass};
use std::collections::HashSet;
use std::time::Duration;

fn small_collection(shard_number: u32) -> CreateCollection {
    CreateCollection {
        vectors: VectorsConfig::Single(VectorParams {
            size: 4,
            distance: Distance::Dot,
            optional: false,
        }),
        shard_number,
        replication_factor: 1,
    }
}

fn collection_names(cluster: &TestCluster, id: u64) -> Vec<String> {
    cluster
        .peer(id)
        .collections()
        .list_collections()
        .collections
        .into_iter()
        .map(|c| c.name)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_cluster_has_one_leader_and_no_collections() {
    let cluster = TestCluster::start(3).await;

    cluster.wait_until(|c| c.leaders().len() == 1).await;
    let leader = cluster.leaders()[0];
    cluster
        .wait_until(|c| {
            c.peers
                .iter()
                .all(|p| p.consensus().node().leader().map(|(id, _)| id) == Some(leader))
        })
        .await;

    // Never two leaders in the same term
    for _ in 0..20 {
        let mut terms = HashSet::new();
        for peer in &cluster.peers {
            let node = peer.consensus().node();
            if node.is_leader() {
                assert!(terms.insert(node.term()), "two leaders in one term");
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for peer in &cluster.peers {
        assert!(peer.collections().list_collections().collections.is_empty());
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_proposal_reaches_every_peer() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_until(|c| c.leaders().len() == 1).await;
    let follower = cluster
        .peers
        .iter()
        .find(|p| !p.consensus().node().is_leader())
        .expect("a follower");

    follower
        .collections()
        .create_collection("docs", small_collection(4))
        .await
        .unwrap();
    // Visible on the proposer as soon as the call returns
    assert_eq!(
        follower.collections().collection_info("docs").await.unwrap().shard_count,
        4
    );

    cluster
        .wait_until(|c| (1..=3).all(|id| collection_names(c, id) == vec!["docs".to_string()]))
        .await;
    for peer in &cluster.peers {
        let info = peer.collections().cluster_info("docs").await.unwrap();
        assert_eq!(info.shard_count, 4);
    }

    // Same name again is a client error
    let err = follower
        .collections()
        .create_collection("docs", small_collection(1))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::BadInput);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_minority_proposal_times_out_with_retryable_error() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_until(|c| c.leaders().len() == 1).await;
    let leader = cluster.leaders()[0];
    let isolated = cluster
        .peers
        .iter()
        .find(|p| p.id() != leader)
        .expect("a follower");

    cluster.raft_network.isolate(isolated.uri());
    let err = isolated
        .collections()
        .create_collection("lonely", small_collection(1))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {}", err);
    assert!(matches!(
        err,
        Error::Consensus(ConsensusError::Timeout(_)) | Error::Timeout(_)
    ));
    assert!(!collection_names(&cluster, leader).contains(&"lonely".to_string()));

    // Back in the majority, the peer catches up with what it missed
    cluster
        .peer(leader)
        .collections()
        .create_collection("shared", small_collection(1))
        .await
        .unwrap();
    cluster.raft_network.heal(isolated.uri());
    let id = isolated.id();
    cluster
        .wait_until(|c| collection_names(c, id) == vec!["shared".to_string()])
        .await;
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_leader_after_leader_is_isolated() {
    let cluster = TestCluster::start(3).await;
    cluster.wait_until(|c| c.leaders().len() == 1).await;
    let old_leader = cluster.leaders()[0];
    let old_term = cluster.peer(old_leader).consensus().node().term();

    cluster
        .raft_network
        .isolate(cluster.peer(old_leader).uri());
    cluster
        .wait_until(|c| {
            c.peers.iter().any(|p| {
                p.id() != old_leader
                    && p.consensus().node().is_leader()
                    && p.consensus().node().term() > old_term
            })
        })
        .await;
    let new_leader = cluster
        .peers
        .iter()
        .find(|p| p.id() != old_leader && p.consensus().node().is_leader())
        .expect("new leader");

    new_leader
        .collections()
        .create_collection("after-failover", small_collection(2))
        .await
        .unwrap();

    // The old leader rejoins as a follower and applies the new entries
    cluster.raft_network.heal(cluster.peer(old_leader).uri());
    cluster
        .wait_until(|c| {
            collection_names(c, old_leader) == vec!["after-failover".to_string()]
                && !c.peer(old_leader).consensus().node().is_leader()
        })
        .await;
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joining_peer_catches_up_from_snapshot() {
    let mut cluster = TestCluster::start(2).await;
    for name in ["a", "b", "c"] {
        cluster.peers[0]
            .collections()
            .create_collection(name, small_collection(3))
            .await
            .unwrap();
    }

    cluster.add_peer(3, None).await;
    let joined = cluster.peer(3);
    assert_eq!(collection_names(&cluster, 3), vec!["a", "b", "c"]);
    assert_eq!(joined.consensus().metadata().peers().len(), 3);

    // And keeps following afterwards
    cluster.peers[0]
        .collections()
        .delete_collection("b")
        .await
        .unwrap();
    let cluster_ref = &cluster;
    eventually(|| async move { collection_names(cluster_ref, 3) == vec!["a", "c"] }).await;

    let status = joined.consensus().cluster_status();
    assert_eq!(status.peers.len(), 3);
    cluster.shutdown();
}
