//! Raft-replicated key/value cluster with consistent hashing and live shard
//! migration.
//!
//! This crate provides the building blocks of a sharded key/value node:
//! - **Raft** consensus for an ordered, majority-committed write log
//! - A **consistent hash ring** with weighted virtual nodes for placement
//! - A **shard manager** that moves, splits, merges and rebalances segments
//! - A five-stage **migration** pipeline that copies data before flipping ownership
//! - **WAL storage** with snapshots, crash replay and lazy TTL expiry
//!
//! # Example
//!
//! ```rust,no_run
//! use shardkv::{ClusterConfig, ClusterCoordinator, PeerConfig, TcpTransport, TransportConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let peers = vec![
//!         PeerConfig::new("node-1", "127.0.0.1", 7001),
//!         PeerConfig::new("node-2", "127.0.0.1", 7002),
//!         PeerConfig::new("node-3", "127.0.0.1", 7003),
//!     ];
//!     let config = ClusterConfig::new("node-1", "./data/node-1")
//!         .with_peers(peers.clone())
//!         .with_listen_addr("127.0.0.1:7001".parse()?);
//!
//!     let transport = TcpTransport::new("node-1", TransportConfig::default());
//!     for peer in peers.iter().filter(|p| p.id != "node-1") {
//!         transport.add_peer(peer.id.clone(), peer.socket_addr()?);
//!     }
//!     let node = ClusterCoordinator::start(config, Arc::new(transport)).await?;
//!
//!     // Writes are accepted by the leader and go through the Raft log.
//!     if node.is_leader() {
//!         node.set("user:123", "Alice", None).await?;
//!     }
//!
//!     // Reads are served from local storage.
//!     if let Some(value) = node.get("user:123") {
//!         println!("Found: {:?}", value);
//!     }
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          ClusterCoordinator API             │
//! │  • get / set / delete / clear               │
//! │  • route_key / replicas_for_key             │
//! │  • schedule_migration / split / merge       │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┬──────────────┐
//!     ▼               ▼               ▼              ▼
//! ┌─────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐
//! │  Raft   │   │ HashRing │   │ Sharding │   │  Storage  │
//! │Consensus│   │          │   │+Migration│   │ WAL+Snap  │
//! └─────────┘   └──────────┘   └──────────┘   └───────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: committed by a majority before they are applied anywhere
//! - **Ownership changes**: proposed through Raft, so every node flips at the same index
//! - **Reads**: local, and may lag the leader on followers

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod error;
pub mod migration;
pub mod network;
pub mod partitioning;
pub mod sharding;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cluster::{ClusterCoordinator, ClusterTransport, Node, NodeStatus, OperationInfo};
pub use config::{
    ClusterConfig, MigrationConfig, PeerConfig, RaftConfig, ShardingConfig, StorageConfig,
    TransportConfig,
};
pub use error::{Error, Result};
pub use types::{ClusterStatus, Command, LogEntry, LogIndex, NodeId, RingUpdate, Term};

// Re-export consensus types
pub use consensus::{RaftNode, RaftStatus, Role};

// Re-export partitioning types
pub use partitioning::{HashRange, HashRing, ShardRange};

// Re-export sharding and migration types
pub use migration::{MigrationEngine, MigrationOperation, MigrationStatus};
pub use sharding::{ShardInfo, ShardManager, ShardOperation, ShardOperationStatus, ShardOperationType};

// Re-export storage and network types
pub use network::{NetworkServer, TcpTransport};
pub use storage::StorageEngine;
