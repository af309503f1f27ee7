//! Core types shared across the cluster.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a physical node (e.g. `"node-1"`).
pub type NodeId = String;

/// Consensus epoch.
pub type Term = u64;

/// Position of an entry in the replicated log, dense from 0.
pub type LogIndex = u64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A change to the layout of the hash ring that must be applied identically on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingUpdate {
    /// A node joins with `weight × vnodes_per_weight` virtual nodes.
    AddNode { node_id: NodeId, weight: u32 },
    /// A node leaves; its segments fall to their successors.
    RemoveNode { node_id: NodeId },
    /// Insert a boundary at `at` inside the segment ending at `position`.
    Split { position: u32, at: u32 },
    /// Remove the boundary at `position`, joining its segment with the next one.
    Merge { position: u32 },
}

/// Commands replicated through the consensus log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Set a key, optionally expiring `ttl` milliseconds after the entry timestamp.
    Set {
        key: String,
        value: Bytes,
        ttl: Option<u64>,
    },
    /// Delete a key.
    Delete { key: String },
    /// Remove every key.
    Clear,
    /// Flip ownership of the segment ending at `position` to `target`.
    MigrateShard {
        operation_id: String,
        shard_id: String,
        position: u32,
        source: NodeId,
        target: NodeId,
    },
    /// Apply a ring layout change.
    UpdateMembership { update: RingUpdate },
    /// No-op used by a new leader to commit entries from earlier terms.
    Heartbeat,
}

impl Command {
    /// Create a set command.
    pub fn set(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        }
    }

    /// Create a set command with a TTL in milliseconds.
    pub fn set_with_ttl(key: impl Into<String>, value: impl Into<Bytes>, ttl: u64) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        }
    }

    /// Create a delete command.
    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    /// The key this command writes, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => Some(key),
            _ => None,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Delete { .. } => "delete",
            Command::Clear => "clear",
            Command::MigrateShard { .. } => "migrate_shard",
            Command::UpdateMembership { .. } => "update_membership",
            Command::Heartbeat => "heartbeat",
        }
    }
}

/// One entry of the replicated log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
    /// Milliseconds since the Unix epoch, set by the leader that created the entry.
    pub timestamp: u64,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
            timestamp: now_millis(),
        }
    }
}

/// Snapshot of cluster state as seen from one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub term: Term,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
    pub members: Vec<NodeId>,
    pub shard_count: usize,
    pub key_count: usize,
    pub active_migrations: usize,
}
