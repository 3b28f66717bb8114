//! Peer server

use crate::collection::collections::Collections;
use crate::common::{Config, PeerId, Result};
use crate::coordinator::consensus::Consensus;
use crate::coordinator::http::{create_router, PeerState};
use crate::coordinator::metadata::ClusterMetadataStore;
use crate::coordinator::raft_node::{RaftNode, RaftTimings};
use crate::coordinator::raft_storage::RaftStorage;
use crate::coordinator::transport::{HttpRaftTransport, RaftTransport};
use crate::shard::holder::ShardHolder;
use crate::shard::remote::{HttpShardTransport, ShardTransport};
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub struct Peer {
    config: Config,
    consensus: Arc<Consensus>,
    holder: Arc<ShardHolder>,
    collections: Arc<Collections>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Wire up a peer over the given transports. Nothing runs until
    /// [`Peer::start`].
    pub fn build(
        config: Config,
        raft_transport: Arc<dyn RaftTransport>,
        shard_transport: Arc<dyn ShardTransport>,
    ) -> Result<Self> {
        let storage = match &config.node.data_path {
            Some(dir) => Some(RaftStorage::open(dir.join("raft"))?),
            None => None,
        };

        // A restarted peer keeps the id its data directory was created with
        let persisted_id = match &storage {
            Some(storage) => storage.load()?.map(|state| state.peer_id),
            None => None,
        };
        let peer_id: PeerId = match (config.node.peer_id, persisted_id) {
            (Some(id), _) => id,
            (None, Some(id)) => id,
            (None, None) => config.node.peer_id_or_random(),
        };
        let uri = config.node.advertised_uri();

        tracing::info!("Starting peer: {}", peer_id);
        tracing::info!("  HTTP API: {}", config.node.bind_addr);
        tracing::info!("  Advertised URI: {}", uri);
        match &config.node.data_path {
            Some(dir) => tracing::info!("  Data path: {}", dir.display()),
            None => tracing::info!("  Data path: none (in-memory)"),
        }

        let timings = RaftTimings {
            heartbeat_interval: config.consensus.heartbeat_interval(),
            election_timeout: config.consensus.election_timeout(),
        };
        let node = RaftNode::new(peer_id, uri, timings, storage)?;
        let metadata = Arc::new(ClusterMetadataStore::new());
        let consensus = Consensus::new(node, metadata, raft_transport, config.consensus.clone());

        let holder = Arc::new(ShardHolder::new(
            peer_id,
            config.node.data_path.clone(),
            config.storage.wal_sync,
        ));
        consensus.add_hook(holder.clone());

        let collections = Arc::new(Collections::new(
            consensus.clone(),
            holder.clone(),
            shard_transport,
            config.write.clone(),
        ));

        Ok(Self {
            config,
            consensus,
            holder,
            collections,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Peer talking HTTP to the rest of the cluster.
    pub fn with_http_transports(config: Config) -> Result<Self> {
        let raft_transport = Arc::new(HttpRaftTransport::new(config.consensus.rpc_timeout())?);
        let shard_transport = Arc::new(HttpShardTransport::new(config.write.timeout())?);
        Self::build(config, raft_transport, shard_transport)
    }

    pub fn id(&self) -> PeerId {
        self.consensus.node().id()
    }

    pub fn uri(&self) -> &str {
        self.consensus.node().uri()
    }

    pub fn consensus(&self) -> &Arc<Consensus> {
        &self.consensus
    }

    pub fn collections(&self) -> &Arc<Collections> {
        &self.collections
    }

    pub fn holder(&self) -> &Arc<ShardHolder> {
        &self.holder
    }

    pub fn router(&self) -> Router {
        create_router(PeerState {
            consensus: self.consensus.clone(),
            collections: self.collections.clone(),
        })
    }

    /// Start consensus and shard transfers, then bootstrap a cluster or join
    /// the configured one.
    pub async fn start(&self) -> Result<()> {
        let handles = self.consensus.start();
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.extend(handles);
            tasks.push(self.collections.start());
        }

        match &self.config.node.bootstrap {
            Some(bootstrap) => self.consensus.join(bootstrap).await?,
            None => self.consensus.init_cluster().await?,
        }
        tracing::info!(
            "✓ Peer {} ready ({})",
            self.id(),
            self.consensus.node().role()
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        self.consensus.shutdown();
        self.collections.close();
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            handle.abort();
        }
    }

    /// Serve the HTTP API until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.node.bind_addr).await?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        // Joining needs our own endpoints up: the leader replicates to us
        // before the join returns
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        });

        if let Err(e) = self.start().await {
            tracing::error!("Peer {} failed to start: {}", self.id(), e);
            server.abort();
            self.shutdown();
            return Err(e);
        }

        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
            Err(e) => tracing::error!("HTTP server task failed: {}", e),
        }
        tracing::info!("Peer {} shutting down", self.id());
        self.shutdown();
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
