//! Peer binary

use clap::{Parser, Subcommand};
use minivec::common::parse_duration;
use minivec::{Config, Peer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minivec-peer")]
#[command(about = "minivec peer: Raft-replicated metadata and shard replicas")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a peer
    Serve {
        /// Peer ID (random when absent and no data dir says otherwise)
        #[arg(long)]
        id: Option<u64>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// URI other peers use to reach this one
        #[arg(long)]
        uri: Option<String>,

        /// URI of a cluster member to join; bootstraps a new cluster when absent
        #[arg(long)]
        bootstrap: Option<String>,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write timeout, e.g. "30s"
        #[arg(long, value_parser = parse_duration)]
        write_timeout: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            uri,
            bootstrap,
            data,
            config,
            write_timeout,
        } => {
            // File and environment first, CLI flags win
            let mut config = Config::load(config.as_deref())?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            if id.is_some() {
                config.node.peer_id = id;
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            if uri.is_some() {
                config.node.uri = uri;
            }
            if bootstrap.is_some() {
                config.node.bootstrap = bootstrap;
            }
            if data.is_some() {
                config.node.data_path = data;
            }
            if let Some(timeout) = write_timeout {
                config.write.timeout_ms = timeout.as_millis() as u64;
            }
            config.validate()?;

            let peer = Peer::with_http_transports(config)?;
            peer.serve().await?;
        }
    }

    Ok(())
}
