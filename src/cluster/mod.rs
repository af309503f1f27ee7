//! Cluster node assembly.
//!
//! ```text
//!                 ┌──────────────────────┐
//!   API layer ──▶ │  ClusterCoordinator  │
//!                 └──────────┬───────────┘
//!          writes            │             shard operations
//!     ┌──────────────────────┼──────────────────────────┐
//!     ▼                      ▼                          ▼
//! ┌─────────┐   apply   ┌──────────────────────┐   ┌──────────────┐
//! │RaftNode │ ────────▶ │ ClusterStateMachine  │   │ ShardManager │
//! └─────────┘           │  storage + hash ring │   │ + Migrations │
//!     ▲                 └──────────────────────┘   └──────┬───────┘
//!     │ RPCs                                              │ ring changes
//! ┌───┴────────────┐                           ┌──────────┴───────┐
//! │ ClusterHandler │                           │ ConsensusRouting │
//! └────────────────┘                           └──────────────────┘
//! ```
//!
//! Ring changes are proposed through Raft and applied by the state machine,
//! so every node flips shard ownership at the same log index.

mod coordinator;
mod handler;
pub mod membership;
mod routing;
mod state_machine;

pub use coordinator::{ClusterCoordinator, ClusterTransport, OperationInfo};
pub use handler::ClusterHandler;
pub use membership::{Node, NodeMetadata, NodeRegistry, NodeStatus};
pub use routing::ConsensusRouting;
pub use state_machine::{ClusterStateMachine, RingReplay};
