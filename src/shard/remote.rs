//! Peer-to-peer shard calls
//!
//! The routing peer sends each sub-batch to the owners of its shard. Owners
//! answer with the causes of a rejection (empty when applied), so a
//! rejected sub-batch is a normal response and only transport problems are
//! errors.

use crate::collection::collections::Collections;
use crate::collection::types::{PointId, PointOperation, Record};
use crate::common::api::read_response;
use crate::common::{Error, FailureCause, Result, ShardId};
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardUpdateRequest {
    pub collection: String,
    pub shard_id: ShardId,
    pub operation: PointOperation,
    /// Metadata index the sender routed with; the owner waits to reach it
    pub min_applied: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardUpdateResponse {
    /// Why the sub-batch was rejected; empty when it was applied
    #[serde(default)]
    pub causes: Vec<FailureCause>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRetrieveRequest {
    pub collection: String,
    pub shard_id: ShardId,
    pub ids: Vec<PointId>,
    pub with_payload: bool,
    pub with_vector: bool,
    pub min_applied: u64,
}

pub trait ShardTransport: Send + Sync {
    fn update(
        &self,
        target: &str,
        req: ShardUpdateRequest,
    ) -> BoxFuture<'static, Result<ShardUpdateResponse>>;

    fn retrieve(
        &self,
        target: &str,
        req: ShardRetrieveRequest,
    ) -> BoxFuture<'static, Result<Vec<Record>>>;
}

pub struct HttpShardTransport {
    client: reqwest::Client,
}

impl HttpShardTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn post<Req, Resp>(&self, url: String, req: Req) -> BoxFuture<'static, Result<Resp>>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let client = self.client.clone();
        async move {
            let resp = client.post(&url).json(&req).send().await?;
            read_response(resp).await
        }
        .boxed()
    }
}

fn shard_url(target: &str, collection: &str, shard_id: ShardId, action: &str) -> String {
    format!(
        "{}/internal/collections/{}/shards/{}/{}",
        target.trim_end_matches('/'),
        collection,
        shard_id,
        action
    )
}

impl ShardTransport for HttpShardTransport {
    fn update(
        &self,
        target: &str,
        req: ShardUpdateRequest,
    ) -> BoxFuture<'static, Result<ShardUpdateResponse>> {
        let url = shard_url(target, &req.collection, req.shard_id, "update");
        self.post(url, req)
    }

    fn retrieve(
        &self,
        target: &str,
        req: ShardRetrieveRequest,
    ) -> BoxFuture<'static, Result<Vec<Record>>> {
        let url = shard_url(target, &req.collection, req.shard_id, "retrieve");
        self.post(url, req)
    }
}

/// In-process shard network keyed by peer URI.
#[derive(Default)]
pub struct LocalShardNetwork {
    peers: RwLock<HashMap<String, Weak<Collections>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalShardNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, uri: &str, collections: &Arc<Collections>) {
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        peers.insert(uri.to_string(), Arc::downgrade(collections));
    }

    pub fn transport(self: &Arc<Self>, from: &str) -> Arc<dyn ShardTransport> {
        Arc::new(LocalShardTransport {
            network: self.clone(),
            from: from.to_string(),
        })
    }

    pub fn isolate(&self, uri: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|p| p.into_inner());
        isolated.insert(uri.to_string());
    }

    pub fn heal(&self, uri: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|p| p.into_inner());
        isolated.remove(uri);
    }

    fn route(&self, from: &str, target: &str) -> Result<Arc<Collections>> {
        {
            let isolated = self.isolated.read().unwrap_or_else(|p| p.into_inner());
            if isolated.contains(from) || isolated.contains(target) {
                return Err(Error::ConnectionFailed(format!(
                    "{} is unreachable from {}",
                    target, from
                )));
            }
        }
        let peers = self.peers.read().unwrap_or_else(|p| p.into_inner());
        peers
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed(format!("no peer at {}", target)))
    }
}

struct LocalShardTransport {
    network: Arc<LocalShardNetwork>,
    from: String,
}

impl ShardTransport for LocalShardTransport {
    fn update(
        &self,
        target: &str,
        req: ShardUpdateRequest,
    ) -> BoxFuture<'static, Result<ShardUpdateResponse>> {
        let peer = self.network.route(&self.from, target);
        async move { peer?.apply_local(req).await }.boxed()
    }

    fn retrieve(
        &self,
        target: &str,
        req: ShardRetrieveRequest,
    ) -> BoxFuture<'static, Result<Vec<Record>>> {
        let peer = self.network.route(&self.from, target);
        async move { peer?.retrieve_local(req).await }.boxed()
    }
}
