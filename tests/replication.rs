//! Replicated shards: failed replicas, recovery, shard transfers and
//! peers that lag behind the metadata log

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{eventually, peer_uri, TestCluster};
use minivec::collection::types::ReplicaState;
use minivec::common::{Config, PeerId};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

const COLLECTION: &str = "replicated";

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn point(id: u64) -> Value {
    json!({ "id": id, "vector": [id as f32, 0.5, 0.25, 1.0], "payload": { "n": id } })
}

async fn create(cluster: &TestCluster, name: &str, shard_number: u32, replication_factor: u32) {
    let app = cluster.peers[0].router();
    let (status, body) = call(
        &app,
        "PUT",
        &format!("/collections/{}", name),
        Some(json!({
            "vectors": { "size": 4, "distance": "Dot" },
            "shard_number": shard_number,
            "replication_factor": replication_factor
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    cluster
        .wait_until(|c| {
            c.peers
                .iter()
                .all(|p| p.consensus().metadata().collection(name).is_ok())
        })
        .await;
}

async fn upsert(app: &Router, name: &str, ids: &[u64]) -> (StatusCode, Value) {
    let points: Vec<Value> = ids.iter().map(|id| point(*id)).collect();
    call(
        app,
        "PUT",
        &format!("/collections/{}/points?wait=true", name),
        Some(json!({ "points": points })),
    )
    .await
}

async fn read_ids(app: &Router, name: &str, ids: &[u64]) -> Vec<u64> {
    let (status, body) = call(
        app,
        "POST",
        &format!("/collections/{}/points", name),
        Some(json!({ "ids": ids })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body["result"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_u64().unwrap())
        .collect()
}

fn owners(cluster: &TestCluster, name: &str) -> Vec<PeerId> {
    cluster.peers[0]
        .consensus()
        .metadata()
        .collection(name)
        .unwrap()
        .replicas(0)
        .unwrap()
        .to_vec()
}

fn replica_state(cluster: &TestCluster, name: &str, peer_id: PeerId) -> Option<ReplicaState> {
    cluster.peers[0]
        .consensus()
        .metadata()
        .collection(name)
        .unwrap()
        .replica_state(0, peer_id)
}

async fn local_count(cluster: &TestCluster, name: &str, peer_id: PeerId) -> usize {
    cluster
        .peer(peer_id)
        .collections()
        .collection_info(name)
        .await
        .unwrap()
        .local_points_count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_point_lands_on_each_replica() {
    let cluster = TestCluster::start(3).await;
    create(&cluster, COLLECTION, 3, 2).await;

    let ids: Vec<u64> = (1..=12).collect();
    let (status, body) = upsert(&cluster.peers[0].router(), COLLECTION, &ids).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["result"]["status"], "completed");

    let mut total = 0;
    for peer in &cluster.peers {
        total += local_count(&cluster, COLLECTION, peer.id()).await;
    }
    assert_eq!(total, 2 * ids.len());

    for peer in &cluster.peers {
        assert_eq!(read_ids(&peer.router(), COLLECTION, &ids).await, ids);
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_replica_is_deactivated_then_recovered() {
    let cluster = TestCluster::start(3).await;
    create(&cluster, COLLECTION, 1, 2).await;
    let app = cluster.peers[0].router();

    let (status, _) = upsert(&app, COLLECTION, &[1, 2]).await;
    assert_eq!(status, StatusCode::OK);

    let victim = owners(&cluster, COLLECTION)
        .into_iter()
        .find(|id| *id != 1)
        .unwrap();
    cluster.shard_network.isolate(&peer_uri(victim));

    // The reachable replica takes the write and the other one leaves service
    let (status, body) = upsert(&app, COLLECTION, &[3]).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_ne!(
        replica_state(&cluster, COLLECTION, victim),
        Some(ReplicaState::Active)
    );
    assert_eq!(read_ids(&app, COLLECTION, &[1, 2, 3]).await, vec![1, 2, 3]);

    let (status, body) = call(&app, "GET", &format!("/collections/{}/cluster", COLLECTION), None).await;
    assert_eq!(status, StatusCode::OK);
    let states: Vec<Value> = body["result"]["local_shards"]
        .as_array()
        .unwrap()
        .iter()
        .chain(body["result"]["remote_shards"].as_array().unwrap())
        .map(|s| s["state"].clone())
        .collect();
    assert!(states.contains(&json!("active")), "{}", body);
    assert!(!states.iter().all(|s| s == "active"), "{}", body);

    cluster.shard_network.heal(&peer_uri(victim));
    let (cluster_ref, name) = (&cluster, COLLECTION);
    eventually(|| async move {
        replica_state(cluster_ref, name, victim) == Some(ReplicaState::Active)
            && local_count(cluster_ref, name, victim).await == 3
    })
    .await;

    let (status, _) = upsert(&app, COLLECTION, &[4]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(local_count(&cluster, COLLECTION, victim).await, 4);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_falls_back_to_next_replica() {
    let cluster = TestCluster::start(3).await;
    create(&cluster, COLLECTION, 1, 2).await;

    let (status, _) = upsert(&cluster.peers[0].router(), COLLECTION, &[1, 2]).await;
    assert_eq!(status, StatusCode::OK);

    let owners = owners(&cluster, COLLECTION);
    let reader = (1..=3).find(|id| !owners.contains(id)).unwrap();
    cluster.shard_network.isolate(&peer_uri(owners[0]));

    // Both replicas are still active; the first one just does not answer
    assert_eq!(
        replica_state(&cluster, COLLECTION, owners[0]),
        Some(ReplicaState::Active)
    );
    assert_eq!(
        read_ids(&cluster.peer(reader).router(), COLLECTION, &[1, 2]).await,
        vec![1, 2]
    );

    cluster.shard_network.heal(&peer_uri(owners[0]));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reassign_shard_keeps_points() {
    let cluster = TestCluster::start(3).await;
    create(&cluster, COLLECTION, 1, 1).await;
    let app = cluster.peers[0].router();

    let (status, _) = upsert(&app, COLLECTION, &[1, 2, 3]).await;
    assert_eq!(status, StatusCode::OK);

    let owner = owners(&cluster, COLLECTION)[0];
    let target = (1..=3).find(|id| *id != owner).unwrap();
    let (status, body) = call(
        &app,
        "POST",
        &format!("/collections/{}/cluster", COLLECTION),
        Some(json!({ "reassign_shard": { "shard_id": 0, "peers": [target] } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["result"], true);

    cluster
        .wait_until(|c| {
            c.peers.iter().all(|p| {
                p.consensus()
                    .metadata()
                    .collection(COLLECTION)
                    .map(|meta| meta.replicas(0) == Some(&[target][..]))
                    .unwrap_or(false)
            })
        })
        .await;
    assert_eq!(local_count(&cluster, COLLECTION, target).await, 3);
    for peer in &cluster.peers {
        assert_eq!(read_ids(&peer.router(), COLLECTION, &[1, 2, 3]).await, vec![1, 2, 3]);
    }

    // Reassigning to a peer list that repeats itself is rejected
    let (status, _) = call(
        &app,
        "POST",
        &format!("/collections/{}/cluster", COLLECTION),
        Some(json!({ "reassign_shard": { "shard_id": 0, "peers": [target, target] } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_move_shard_between_peers() {
    let cluster = TestCluster::start(3).await;
    create(&cluster, COLLECTION, 1, 1).await;
    let app = cluster.peers[0].router();

    let (status, _) = upsert(&app, COLLECTION, &[1, 2, 3]).await;
    assert_eq!(status, StatusCode::OK);

    let owner = owners(&cluster, COLLECTION)[0];
    let target = (1..=3).find(|id| *id != owner).unwrap();
    let (status, body) = call(
        &app,
        "POST",
        &format!("/collections/{}/cluster", COLLECTION),
        Some(json!({
            "move_shard": { "shard_id": 0, "from_peer_id": owner, "to_peer_id": target }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    assert_eq!(owners(&cluster, COLLECTION), vec![target]);
    assert_eq!(
        replica_state(&cluster, COLLECTION, target),
        Some(ReplicaState::Active)
    );
    let (cluster_ref, name) = (&cluster, COLLECTION);
    eventually(|| async move { local_count(cluster_ref, name, owner).await == 0 }).await;
    assert_eq!(local_count(&cluster, COLLECTION, target).await, 3);

    let (status, _) = upsert(&app, COLLECTION, &[4]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read_ids(&app, COLLECTION, &[1, 2, 3, 4]).await, vec![1, 2, 3, 4]);

    // No replica on the source any more
    let (status, _) = call(
        &app,
        "POST",
        &format!("/collections/{}/cluster", COLLECTION),
        Some(json!({
            "move_shard": { "shard_id": 0, "from_peer_id": owner, "to_peer_id": target }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    cluster.shutdown();
}

fn impatient(config: &mut Config) {
    config.write.catch_up_timeout_ms = 300;
    config.write.remote_retries = 1;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_to_lagging_owner_reports_still_syncing() {
    let cluster = TestCluster::start_with(3, impatient).await;
    create(&cluster, COLLECTION, 1, 1).await;

    let owner = owners(&cluster, COLLECTION)[0];
    let router_peer = (1..=3).find(|id| *id != owner).unwrap();
    let witness = (1..=3).find(|id| *id != owner && *id != router_peer).unwrap();

    // The owner stops hearing from consensus but still serves shard calls
    cluster.raft_network.isolate(&peer_uri(owner));
    let creator = cluster.peer(witness).router();
    let body = json!({
        "vectors": { "size": 4, "distance": "Dot" },
        "shard_number": 1,
        "replication_factor": 1
    });
    let mut created = false;
    for _ in 0..100 {
        let (status, _) = call(&creator, "PUT", "/collections/later", Some(body.clone())).await;
        if status == StatusCode::OK {
            created = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(created, "majority could not create a collection");
    cluster
        .wait_until(|c| {
            c.peer(router_peer)
                .consensus()
                .metadata()
                .collection("later")
                .is_ok()
        })
        .await;

    let (status, body) = upsert(&cluster.peer(router_peer).router(), COLLECTION, &[1]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", body);
    let error = body["status"]["error"].as_str().unwrap();
    assert!(error.contains("still syncing"), "{}", error);

    cluster.raft_network.heal(&peer_uri(owner));
    cluster.shutdown();
}
