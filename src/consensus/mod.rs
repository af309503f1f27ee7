//! Raft consensus: leader election, log replication and commit tracking.
//!
//! [`RaftNode`] is the entry point. It owns nothing but channels; the Raft
//! state lives in a single task and talks to the rest of the system through
//! two seams:
//!
//! - [`StateMachine`] receives committed entries in index order and supplies
//!   snapshots for lagging followers.
//! - [`RaftTransport`] carries outbound RPCs to peers.

pub mod hard_state;
pub mod log;
pub mod log_store;
pub mod messages;
pub mod node;
pub mod state_machine;
pub mod transport;

pub use hard_state::{HardState, HardStateStore};
pub use log::RaftLog;
pub use log_store::{LogStore, RaftStorage};
pub use messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
pub use node::{RaftEvent, RaftNode, RaftStatus, Role};
pub use state_machine::{SnapshotData, StateMachine};
pub use transport::RaftTransport;
