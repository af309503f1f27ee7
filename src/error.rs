//! Error types for the cluster.

use crate::types::{LogIndex, NodeId};
use std::io;
use thiserror::Error;

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cluster.
#[derive(Error, Debug)]
pub enum Error {
    /// Raft consensus errors.
    #[error("raft error: {0}")]
    Raft(#[from] RaftError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Shard lookup and scheduling errors.
    #[error("shard error: {0}")]
    Shard(#[from] ShardError),

    /// Migration pipeline errors.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Leader hint carried by a not-leader error.
    pub fn leader_hint(&self) -> Option<&NodeId> {
        match self {
            Error::Raft(RaftError::NotLeader { leader }) => leader.as_ref(),
            _ => None,
        }
    }

    /// Whether this error is a not-leader redirect.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Error::Raft(RaftError::NotLeader { .. }))
    }
}

/// Raft consensus related errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader, includes leader hint if known.
    #[error("not leader, leader is: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    /// Proposal was overwritten by a new leader before it committed.
    #[error("proposal dropped")]
    ProposalDropped,

    /// Storage failed while applying; the node refuses writes and leadership.
    #[error("writes fenced after storage failure")]
    WritesFenced,

    /// The consensus loop has stopped.
    #[error("raft stopped")]
    Stopped,

    /// Term or log mismatch that could not be resolved internally.
    #[error("consensus: {0}")]
    Consensus(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No address is known for the peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// The peer did not answer in time or is partitioned away.
    #[error("peer unreachable: {0}")]
    Unreachable(NodeId),

    /// A frame exceeded the configured size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with a message of the wrong kind.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The peer reported an error while handling the request.
    #[error("remote error: {0}")]
    Remote(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// WAL or snapshot I/O failed.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    /// Truncation would drop entries not yet covered by a snapshot or not applied.
    #[error("cannot truncate wal before {index}: limit is {limit:?}")]
    InvalidTruncation {
        index: LogIndex,
        limit: Option<LogIndex>,
    },

    /// Snapshot file failed validation.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// A reservation would exceed configured capacity.
    #[error("capacity exceeded: requested {requested} bytes, available {available}")]
    CapacityExceeded { requested: u64, available: u64 },

    /// Encoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Shard manager errors.
#[derive(Error, Debug)]
pub enum ShardError {
    /// No shard with this id.
    #[error("unknown shard: {0}")]
    UnknownShard(String),

    /// No operation with this id.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Target node is unknown or equals the source.
    #[error("invalid migration target: {0}")]
    InvalidTarget(String),

    /// The shard is not owned by the given source.
    #[error("shard {shard_id} is owned by {owner}, not {source_node}")]
    WrongOwner {
        shard_id: String,
        owner: NodeId,
        source_node: NodeId,
    },

    /// No eligible node could be picked automatically.
    #[error("no eligible target node")]
    NoTarget,

    /// Writes to this shard are frozen while its data moves.
    #[error("shard {0} is migrating, retry later")]
    Migrating(String),

    /// The operation is not in a state that allows the request.
    #[error("operation {id} is {status}")]
    InvalidState { id: String, status: String },

    /// Split or merge cannot be applied to this shard.
    #[error("cannot reshape shard: {0}")]
    Reshape(String),
}

/// Migration pipeline errors.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Source and target disagree after transfer.
    #[error("checksum mismatch: source {source_sum:#010x}, target {target_sum:#010x}")]
    ChecksumMismatch { source_sum: u32, target_sum: u32 },

    /// No data store is reachable for this node.
    #[error("no data store for node {0}")]
    StoreUnavailable(NodeId),

    /// The operation was cancelled.
    #[error("migration cancelled")]
    Cancelled,

    /// Routing flip failed and was not applied.
    #[error("routing update failed: {0}")]
    Routing(String),

    /// Routing flip was submitted but whether it took effect is unknown.
    #[error("routing update outcome unknown: {0}")]
    RoutingUnresolved(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Storage(StorageError::Io(e))
    }
}
