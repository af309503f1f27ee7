//! Partitioning module for distributing keys across cluster nodes.
//!
//! Keys are placed on a consistent hash ring with virtual nodes, ensuring:
//! - Even distribution of keys across nodes
//! - Minimal key redistribution when nodes join/leave
//! - Shard boundaries that stay fixed while ownership moves
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        HashRing                              │
//! │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐            │
//! │  │ s0:a│→│ s1:b│→│ s2:c│→│ s3:a│→│ s4:b│→│ s5:c│ → (wrap)   │
//! │  └─────┘ └─────┘ └─────┘ └─────┘ └─────┘ └─────┘            │
//! │      150 × weight virtual nodes per physical node            │
//! │                                                              │
//! │  Key "user:123" → xxh3 → position → next vnode → node b      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod hashring;

pub use hashring::{
    hash_position, HashRange, HashRing, ReplicaChange, RingLayout, ShardRange, VirtualNode,
    DEFAULT_VNODES_PER_WEIGHT,
};
