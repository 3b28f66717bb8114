//! Consensus RPC transports
//!
//! [`HttpRaftTransport`] posts JSON to the `/raft/*` routes of other peers.
//! [`LocalRaftNetwork`] wires peers of one process together and can cut
//! peers off to simulate partitions.

use crate::common::api::read_response;
use crate::common::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse, JoinRequest,
    JoinResponse, ProposeRequest, ProposeResponse, VoteRequest, VoteResponse,
};
use crate::common::{Error, Result};
use crate::coordinator::consensus::Consensus;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Client side of the consensus RPCs. `target` is the peer URI.
pub trait RaftTransport: Send + Sync {
    fn request_vote(&self, target: &str, req: VoteRequest)
        -> BoxFuture<'static, Result<VoteResponse>>;

    fn append_entries(
        &self,
        target: &str,
        req: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse>>;

    fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> BoxFuture<'static, Result<InstallSnapshotResponse>>;

    /// Forward a proposal to the leader.
    fn propose(&self, target: &str, req: ProposeRequest)
        -> BoxFuture<'static, Result<ProposeResponse>>;

    fn join(&self, target: &str, req: JoinRequest) -> BoxFuture<'static, Result<JoinResponse>>;
}

pub struct HttpRaftTransport {
    client: reqwest::Client,
}

impl HttpRaftTransport {
    /// `timeout` bounds a whole request; forwarded proposals wait for
    /// their commit, so it should cover the propose timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn post<Req, Resp>(&self, target: &str, path: &str, req: Req) -> BoxFuture<'static, Result<Resp>>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let client = self.client.clone();
        let url = format!("{}{}", target.trim_end_matches('/'), path);
        async move {
            let resp = client.post(&url).json(&req).send().await?;
            read_response(resp).await
        }
        .boxed()
    }
}

impl RaftTransport for HttpRaftTransport {
    fn request_vote(
        &self,
        target: &str,
        req: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse>> {
        self.post(target, "/raft/vote", req)
    }

    fn append_entries(
        &self,
        target: &str,
        req: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse>> {
        self.post(target, "/raft/append", req)
    }

    fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> BoxFuture<'static, Result<InstallSnapshotResponse>> {
        self.post(target, "/raft/snapshot", req)
    }

    fn propose(
        &self,
        target: &str,
        req: ProposeRequest,
    ) -> BoxFuture<'static, Result<ProposeResponse>> {
        self.post(target, "/raft/propose", req)
    }

    fn join(&self, target: &str, req: JoinRequest) -> BoxFuture<'static, Result<JoinResponse>> {
        self.post(target, "/raft/join", req)
    }
}

/// In-process consensus network keyed by peer URI.
#[derive(Default)]
pub struct LocalRaftNetwork {
    peers: RwLock<HashMap<String, Weak<Consensus>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalRaftNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, uri: &str, consensus: &Arc<Consensus>) {
        let mut peers = self.peers.write().unwrap_or_else(|p| p.into_inner());
        peers.insert(uri.to_string(), Arc::downgrade(consensus));
    }

    /// Transport used by the peer at `from`.
    pub fn transport(self: &Arc<Self>, from: &str) -> Arc<dyn RaftTransport> {
        Arc::new(LocalRaftTransport {
            network: self.clone(),
            from: from.to_string(),
        })
    }

    /// Drop all traffic to and from `uri`.
    pub fn isolate(&self, uri: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|p| p.into_inner());
        isolated.insert(uri.to_string());
    }

    pub fn heal(&self, uri: &str) {
        let mut isolated = self.isolated.write().unwrap_or_else(|p| p.into_inner());
        isolated.remove(uri);
    }

    fn route(&self, from: &str, target: &str) -> Result<Arc<Consensus>> {
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

struct LocalRaftTransport {
    network: Arc<LocalRaftNetwork>,
    from: String,
}

impl RaftTransport for LocalRaftTransport {
    fn request_vote(
        &self,
        target: &str,
        req: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse>> {
        let peer = self.network.route(&self.from, target);
        async move { peer?.handle_vote(req) }.boxed()
    }

    fn append_entries(
        &self,
        target: &str,
        req: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse>> {
        let peer = self.network.route(&self.from, target);
        async move { peer?.handle_append(req) }.boxed()
    }

    fn install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> BoxFuture<'static, Result<InstallSnapshotResponse>> {
        let peer = self.network.route(&self.from, target);
        async move { peer?.handle_snapshot(req) }.boxed()
    }

    fn propose(
        &self,
        target: &str,
        req: ProposeRequest,
    ) -> BoxFuture<'static, Result<ProposeResponse>> {
        let peer = self.network.route(&self.from, target);
        async move { peer?.propose_local(req.data).await }.boxed()
    }

    fn join(&self, target: &str, req: JoinRequest) -> BoxFuture<'static, Result<JoinResponse>> {
        let peer = self.network.route(&self.from, target);
        async move { peer?.handle_join(req).await }.boxed()
    }
}
