//! HTTP API of a peer
//!
//! Public routes (`/collections`, `/cluster`, `/health`) and the
//! peer-to-peer routes (`/raft/*`, `/internal/*`) share one router. Every
//! response uses the [`ApiResponse`] envelope; failures carry the status
//! code of their error class.

use crate::collection::collections::Collections;
use crate::collection::types::{
    ClusterOperation, CreateCollection, DeletePayloadRequest, PointInsertOperations,
    PointOperation, PointRequest, PointsSelector, SetPayloadRequest,
};
use crate::common::api::ApiResponse;
use crate::common::raft::{
    AppendRequest, InstallSnapshotRequest, JoinRequest, ProposeRequest, VoteRequest,
};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, PeerId, Result, ShardId};
use crate::coordinator::consensus::Consensus;
use crate::shard::remote::{ShardRetrieveRequest, ShardUpdateRequest};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Upper bound on request bodies (point batches included).
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared peer state for HTTP handlers.
#[derive(Clone)]
pub struct PeerState {
    pub consensus: Arc<Consensus>,
    pub collections: Arc<Collections>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    #[serde(default)]
    pub wait: bool,
}

/// Envelope a handler result, timed from `start`.
fn reply<T: Serialize>(start: Instant, result: Result<T>) -> Response {
    match result {
        Ok(value) => Json(ApiResponse::ok(value, start.elapsed())).into_response(),
        Err(e) => {
            let status = e.to_http_status();
            if status.is_server_error() {
                tracing::warn!("Request failed: {}", e);
            } else {
                tracing::debug!("Request rejected: {}", e);
            }
            (
                status,
                Json(ApiResponse::<()>::error(e.to_string(), start.elapsed())),
            )
                .into_response()
        }
    }
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::BadRequest(rejection.body_text()))
}

pub fn create_router(state: PeerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cluster", get(cluster_status))
        .route("/cluster/peer/:peer_id", axum::routing::delete(remove_peer))
        .route("/collections", get(list_collections))
        .route(
            "/collections/:name",
            put(create_collection)
                .get(collection_info)
                .delete(delete_collection),
        )
        .route(
            "/collections/:name/cluster",
            get(collection_cluster_info).post(update_collection_cluster),
        )
        .route(
            "/collections/:name/points",
            put(upsert_points).post(retrieve_points),
        )
        .route("/collections/:name/points/delete", post(delete_points))
        .route("/collections/:name/points/payload", post(set_payload))
        .route("/collections/:name/points/payload/delete", post(delete_payload))
        .route("/collections/:name/points/payload/clear", post(clear_payload))
        .route("/collections/:name/operations/:id", get(operation_status))
        // Consensus RPC
        .route("/raft/vote", post(raft_vote))
        .route("/raft/append", post(raft_append))
        .route("/raft/snapshot", post(raft_snapshot))
        .route("/raft/propose", post(raft_propose))
        .route("/raft/join", post(raft_join))
        // Shard RPC
        .route(
            "/internal/collections/:name/shards/:shard_id/update",
            post(shard_update),
        )
        .route(
            "/internal/collections/:name/shards/:shard_id/retrieve",
            post(shard_retrieve),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_tracing_middleware)),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Liveness plus the peer's consensus role.
async fn health(State(state): State<PeerState>) -> Response {
    let start = Instant::now();
    let node = state.consensus.node();
    let result = json!({
        "status": "healthy",
        "peer_id": node.id(),
        "role": node.role(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    reply(start, Ok(result))
}

// === Cluster ===

async fn cluster_status(State(state): State<PeerState>) -> Response {
    let start = Instant::now();
    reply(start, Ok(state.consensus.cluster_status()))
}

async fn remove_peer(State(state): State<PeerState>, Path(peer_id): Path<PeerId>) -> Response {
    let start = Instant::now();
    let result = state.collections.remove_peer(peer_id).await.map(|()| true);
    reply(start, result)
}

// === Collections ===

async fn list_collections(State(state): State<PeerState>) -> Response {
    let start = Instant::now();
    reply(start, Ok(state.collections.list_collections()))
}

async fn create_collection(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<CreateCollection>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match body(payload) {
        Ok(req) => state
            .collections
            .create_collection(&name, req)
            .await
            .map(|()| true),
        Err(e) => Err(e),
    };
    reply(start, result)
}

async fn collection_info(State(state): State<PeerState>, Path(name): Path<String>) -> Response {
    let start = Instant::now();
    reply(start, state.collections.collection_info(&name).await)
}

async fn delete_collection(State(state): State<PeerState>, Path(name): Path<String>) -> Response {
    let start = Instant::now();
    let result = state
        .collections
        .delete_collection(&name)
        .await
        .map(|()| true);
    reply(start, result)
}

async fn collection_cluster_info(
    State(state): State<PeerState>,
    Path(name): Path<String>,
) -> Response {
    let start = Instant::now();
    reply(start, state.collections.cluster_info(&name).await)
}

async fn update_collection_cluster(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<ClusterOperation>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match body(payload) {
        Ok(op) => state
            .collections
            .update_cluster(&name, op)
            .await
            .map(|()| true),
        Err(e) => Err(e),
    };
    reply(start, result)
}

// === Points ===

async fn update_points(
    state: &PeerState,
    name: &str,
    operation: Result<PointOperation>,
    wait: bool,
) -> Response {
    let start = Instant::now();
    let result = match operation {
        Ok(operation) => state.collections.update(name, operation, wait).await,
        Err(e) => Err(e),
    };
    reply(start, result)
}

async fn upsert_points(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    Query(params): Query<WaitParams>,
    payload: std::result::Result<Json<PointInsertOperations>, JsonRejection>,
) -> Response {
    let operation = body(payload).map(|req| PointOperation::UpsertPoints { points: req.points });
    update_points(&state, &name, operation, params.wait).await
}

async fn delete_points(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    Query(params): Query<WaitParams>,
    payload: std::result::Result<Json<PointsSelector>, JsonRejection>,
) -> Response {
    let operation = body(payload).map(|req| PointOperation::DeletePoints { ids: req.points });
    update_points(&state, &name, operation, params.wait).await
}

async fn set_payload(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    Query(params): Query<WaitParams>,
    payload: std::result::Result<Json<SetPayloadRequest>, JsonRejection>,
) -> Response {
    let operation = body(payload).map(|req| PointOperation::SetPayload {
        payload: req.payload,
        points: req.points,
    });
    update_points(&state, &name, operation, params.wait).await
}

async fn delete_payload(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    Query(params): Query<WaitParams>,
    payload: std::result::Result<Json<DeletePayloadRequest>, JsonRejection>,
) -> Response {
    let operation = body(payload).map(|req| PointOperation::DeletePayload {
        keys: req.keys,
        points: req.points,
    });
    update_points(&state, &name, operation, params.wait).await
}

async fn clear_payload(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    Query(params): Query<WaitParams>,
    payload: std::result::Result<Json<PointsSelector>, JsonRejection>,
) -> Response {
    let operation = body(payload).map(|req| PointOperation::ClearPayload { points: req.points });
    update_points(&state, &name, operation, params.wait).await
}

async fn retrieve_points(
    State(state): State<PeerState>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<PointRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match body(payload) {
        Ok(req) => state.collections.retrieve(&name, req).await,
        Err(e) => Err(e),
    };
    reply(start, result)
}

async fn operation_status(
    State(state): State<PeerState>,
    Path((name, id)): Path<(String, u64)>,
) -> Response {
    let start = Instant::now();
    reply(start, state.collections.operation_info(&name, id))
}

// === Consensus RPC ===

async fn raft_vote(
    State(state): State<PeerState>,
    payload: std::result::Result<Json<VoteRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    reply(start, body(payload).and_then(|req| state.consensus.handle_vote(req)))
}

async fn raft_append(
    State(state): State<PeerState>,
    payload: std::result::Result<Json<AppendRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    reply(start, body(payload).and_then(|req| state.consensus.handle_append(req)))
}

async fn raft_snapshot(
    State(state): State<PeerState>,
    payload: std::result::Result<Json<InstallSnapshotRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    reply(start, body(payload).and_then(|req| state.consensus.handle_snapshot(req)))
}

async fn raft_propose(
    State(state): State<PeerState>,
    payload: std::result::Result<Json<ProposeRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match body(payload) {
        Ok(req) => state.consensus.propose_local(req.data).await,
        Err(e) => Err(e),
    };
    reply(start, result)
}

async fn raft_join(
    State(state): State<PeerState>,
    payload: std::result::Result<Json<JoinRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match body(payload) {
        Ok(req) => state.consensus.handle_join(req).await,
        Err(e) => Err(e),
    };
    reply(start, result)
}

// === Shard RPC ===

async fn shard_update(
    State(state): State<PeerState>,
    Path((name, shard_id)): Path<(String, ShardId)>,
    payload: std::result::Result<Json<ShardUpdateRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match body(payload) {
        Ok(mut req) => {
            req.collection = name;
            req.shard_id = shard_id;
            state.collections.apply_local(req).await
        }
        Err(e) => Err(e),
    };
    reply(start, result)
}

async fn shard_retrieve(
    State(state): State<PeerState>,
    Path((name, shard_id)): Path<(String, ShardId)>,
    payload: std::result::Result<Json<ShardRetrieveRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let result = match body(payload) {
        Ok(mut req) => {
            req.collection = name;
            req.shard_id = shard_id;
            state.collections.retrieve_local(req).await
        }
        Err(e) => Err(e),
    };
    reply(start, result)
}
