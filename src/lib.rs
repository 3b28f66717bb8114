//! # minivec
//!
//! Coordination layer of a distributed vector store:
//! - Raft consensus over the cluster metadata (peers, collections, placement)
//! - Collections split into a fixed number of shards, replicated on peers
//! - Write-ahead log (WAL) per shard replica for durability
//! - Point batches fanned out per shard and merged into one result
//! - HTTP/JSON for the public API and for peer-to-peer traffic
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Peer                       │
//! │  HTTP API ─► Collections ─► per-shard queues │
//! │                 │                  │         │
//! │          Consensus (Raft)    ShardHolder     │
//! │                 │             (WAL + store)  │
//! │     ClusterMetadataStore                     │
//! └─────────┬──────────────────────┬─────────────┘
//!           │ /raft/*              │ /internal/*
//!     ┌─────▼─────┐          ┌─────▼─────┐
//!     │  Peer 2   │          │  Peer 3   │
//!     └───────────┘          └───────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a cluster
//! ```bash
//! minivec-peer serve --id 1 --bind 0.0.0.0:6333 --data ./peer1
//! minivec-peer serve --id 2 --bind 0.0.0.0:6334 --data ./peer2 \
//!   --bootstrap http://localhost:6333
//! ```
//!
//! ### Use the CLI
//! ```bash
//! minivec create docs --vector image:4:dot --vector text:4:cosine --shards 5
//! minivec upsert docs --file ./points.json --wait
//! minivec get docs 1 2 3
//! minivec cluster
//! ```

pub mod collection;
pub mod common;
pub mod coordinator;
pub mod shard;

// Re-export commonly used types
pub use collection::Collections;
pub use common::{Config, Error, Result};
pub use coordinator::Peer;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
