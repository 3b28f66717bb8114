//! Sharded point writes across a 3-peer cluster, through the HTTP API

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{eventually, TestCluster};
use minivec::collection::types::{PointId, PointOperation, PointRequest, UpdateStatus};
use serde_json::{json, Value};
use tower::ServiceExt;

const COLLECTION: &str = "test_collection";

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

fn point(id: u64, with_text: bool) -> Value {
    let base = id as f32;
    let mut vector = json!({ "image": [base, 0.5, 0.25, 1.0] });
    if with_text {
        vector["text"] = json!([1.0, base, 0.0, 0.5]);
    }
    json!({ "id": id, "vector": vector, "payload": { "n": id } })
}

async fn setup() -> (TestCluster, Router) {
    let cluster = TestCluster::start(3).await;
    let app = cluster.peers[0].router();

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/collections/{}", COLLECTION),
        Some(json!({
            "vectors": {
                "image": { "size": 4, "distance": "Dot" },
                "text": { "size": 4, "distance": "Cosine" }
            },
            "shard_number": 5,
            "replication_factor": 1
        })),
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
                    .map(|meta| meta.shard_count() == 5)
                    .unwrap_or(false)
            })
        })
        .await;
    (cluster, app)
}

async fn stored_ids(cluster: &TestCluster, ids: &[u64]) -> Vec<u64> {
    let records = cluster.peers[1]
        .collections()
        .retrieve(
            COLLECTION,
            PointRequest {
                ids: ids.iter().copied().map(PointId::from).collect(),
                with_payload: true,
                with_vector: false,
            },
        )
        .await
        .unwrap();
    records
        .into_iter()
        .map(|r| match r.id {
            PointId::Num(n) => n,
            PointId::Uuid(_) => panic!("unexpected uuid id"),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_invalid_shard_fails_alone() {
    let (cluster, app) = setup().await;

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/collections/{}/points?wait=true", COLLECTION),
        Some(json!({
            "points": [point(1, true), point(2, false), point(3, true), point(4, true)]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["result"], Value::Null);
    assert!(body["time"].as_f64().unwrap() >= 0.0);
    let error = body["status"]["error"].as_str().unwrap();
    assert!(
        error.contains("Wrong input: 1 out of 3 shards failed to apply operation"),
        "{}",
        error
    );
    assert!(error.contains("Wrong input: Missed vector name error: text"));

    // Shard 2 holds ids 2 and 4 and rejects both; shards 0 and 1 commit
    assert_eq!(stored_ids(&cluster, &[1, 2, 3, 4]).await, vec![1, 3]);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_error_does_not_depend_on_submission_order() {
    let (cluster, app) = setup().await;

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/collections/{}/points?wait=true", COLLECTION),
        Some(json!({
            "points": [point(4, true), point(3, true), point(2, false), point(1, true)]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["status"]["error"],
        "Wrong input: 1 out of 3 shards failed to apply operation\nWrong input: Missed vector name error: text"
    );
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upsert_overwrites_by_id() {
    let (cluster, app) = setup().await;
    let uri = format!("/collections/{}/points?wait=true", COLLECTION);

    let (status, body) = call(&app, "PUT", &uri, Some(json!({ "points": [point(1, true), point(5, true)] }))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["result"]["status"], "completed");
    assert_eq!(body["status"], json!({}));

    let mut updated = point(1, true);
    updated["payload"] = json!({ "n": 100 });
    let (status, _) = call(&app, "PUT", &uri, Some(json!({ "points": [updated] }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/collections/{}/points", COLLECTION),
        Some(json!({ "ids": [5, 1, 9] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let records = body["result"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], 5);
    assert_eq!(records[1]["id"], 1);
    assert_eq!(records[1]["payload"]["n"], 100);

    // One copy per id across the cluster
    let mut total = 0;
    for peer in &cluster.peers {
        total += peer
            .collections()
            .collection_info(COLLECTION)
            .await
            .unwrap()
            .local_points_count;
    }
    assert_eq!(total, 2);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_wait_write_is_tracked() {
    let (cluster, app) = setup().await;

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/collections/{}/points", COLLECTION),
        Some(json!({ "points": [point(1, true), point(2, false)] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["status"], "acknowledged");
    let operation_id = body["result"]["operation_id"].as_u64().unwrap();

    let collections = cluster.peers[0].collections();
    eventually(|| async move {
        collections
            .operation_info(COLLECTION, operation_id)
            .map(|info| info.status != UpdateStatus::Acknowledged)
            .unwrap_or(false)
    })
    .await;

    let (status, body) = call(
        &app,
        "GET",
        &format!("/collections/{}/operations/{}", COLLECTION, operation_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["status"], "failed");
    assert!(body["result"]["error"]
        .as_str()
        .unwrap()
        .contains("1 out of 2 shards failed"));

    let (status, _) = call(
        &app,
        "GET",
        &format!("/collections/{}/operations/{}", COLLECTION, operation_id + 1000),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_batch_and_unknown_collection() {
    let (cluster, app) = setup().await;

    let result = cluster.peers[2]
        .collections()
        .update(COLLECTION, PointOperation::UpsertPoints { points: vec![] }, true)
        .await
        .unwrap();
    assert_eq!(result.status, UpdateStatus::Completed);

    let (status, body) = call(
        &app,
        "PUT",
        "/collections/missing/points?wait=true",
        Some(json!({ "points": [point(1, true)] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["status"]["error"]
        .as_str()
        .unwrap()
        .contains("Collection `missing` doesn't exist"));

    let (status, _) = call(
        &app,
        "PUT",
        &format!("/collections/{}/points", COLLECTION),
        Some(json!({ "points": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_and_payload_operations() {
    let (cluster, app) = setup().await;
    let points_uri = format!("/collections/{}/points?wait=true", COLLECTION);
    let (status, _) = call(
        &app,
        "PUT",
        &points_uri,
        Some(json!({ "points": [point(1, true), point(2, true), point(3, true)] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/collections/{}/points/payload?wait=true", COLLECTION),
        Some(json!({ "payload": { "tag": "x" }, "points": [1, 2] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _) = call(
        &app,
        "POST",
        &format!("/collections/{}/points/delete?wait=true", COLLECTION),
        Some(json!({ "points": [2] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored_ids(&cluster, &[1, 2, 3]).await, vec![1, 3]);

    // Payload of a missing point is rejected by its shard
    let (status, body) = call(
        &app,
        "POST",
        &format!("/collections/{}/points/payload/clear?wait=true", COLLECTION),
        Some(json!({ "points": [2] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{}", body);
    assert!(body["status"]["error"]
        .as_str()
        .unwrap()
        .contains("1 out of 1 shards failed"));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_info_and_health() {
    let (cluster, app) = setup().await;

    let (status, body) = call(&app, "GET", &format!("/collections/{}/cluster", COLLECTION), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["shard_count"], 5);
    let local = body["result"]["local_shards"].as_array().unwrap().len();
    let remote = body["result"]["remote_shards"].as_array().unwrap().len();
    assert_eq!(local + remote, 5);

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["status"], "healthy");
    assert_eq!(body["result"]["peer_id"], 1);

    let (status, body) = call(&app, "GET", "/collections", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["collections"][0]["name"], COLLECTION);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_body_is_rejected() {
    let (cluster, app) = setup().await;

    let filler = "x".repeat(minivec::coordinator::http::MAX_BODY_BYTES + 1);
    let (status, body) = call(
        &app,
        "PUT",
        &format!("/collections/{}/points?wait=true", COLLECTION),
        Some(json!({ "points": [], "filler": filler })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["status"]["error"]
        .as_str()
        .unwrap()
        .contains("limit"));

    // The limit leaves ordinary requests alone
    let (status, _) = call(
        &app,
        "PUT",
        &format!("/collections/{}/points?wait=true", COLLECTION),
        Some(json!({ "points": [point(1, true)] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    cluster.shutdown();
}
