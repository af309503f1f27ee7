//! Testing utilities for the cluster.
//!
//! - [`MemoryStateMachine`] and [`NullTransport`] drive a lone [`RaftNode`](crate::consensus::RaftNode).
//! - [`LocalNetwork`] connects nodes in-process and can cut links between them.
//! - `TestCluster` (test builds only) starts full cluster nodes on a
//!   `LocalNetwork` with temporary data directories.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   LocalTransport    ┌──────────────┐
//! │ Coordinator  │ ──── call() ──────▶ │ LocalNetwork │
//! │   node-1     │                     │  handlers    │
//! └──────────────┘                     │  cut links   │
//!        ▲                             └──────┬───────┘
//!        │     MessageHandler::handle()       │
//!        └────────────────────────────────────┘
//! ```
//!
//! Envelopes are encoded and decoded on every hop so the local network
//! exercises the same serialization as TCP.

#[cfg(test)]
mod cluster;
mod network;
#[cfg(test)]
mod utils;

#[cfg(test)]
mod cluster_tests;
#[cfg(test)]
mod log_matching_tests;
#[cfg(test)]
mod raft_tests;

#[cfg(test)]
pub(crate) use cluster::TestCluster;
pub use network::{LocalNetwork, LocalTransport};

use crate::consensus::{RaftNode, SnapshotData, StateMachine};
use crate::error::{NetworkError, Result, StorageError};
use crate::network::{Envelope, Message, MessageHandler, PongResponse, RpcClient};
use crate::types::{LogEntry, LogIndex, Term};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// State machine that keeps every applied entry in memory.
#[derive(Debug, Default)]
pub struct MemoryStateMachine {
    applied: Mutex<Vec<LogEntry>>,
    base: Mutex<Option<(LogIndex, Term)>>,
    snapshot_point: Mutex<Option<(LogIndex, Term)>>,
    failing: AtomicBool,
}

impl MemoryStateMachine {
    /// Entries applied since start or the last restore, in order.
    pub fn applied(&self) -> Vec<LogEntry> {
        self.applied.lock().clone()
    }

    /// Make every following `apply` fail.
    pub fn fail_applies(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Declare everything applied so far durable, allowing the log to be
    /// compacted up to it.
    pub fn checkpoint(&self) {
        *self.snapshot_point.lock() = self.last_applied();
    }
}

impl StateMachine for MemoryStateMachine {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected apply failure")).into());
        }
        self.applied.lock().push(entry.clone());
        Ok(())
    }

    fn last_applied(&self) -> Option<(LogIndex, Term)> {
        self.applied
            .lock()
            .last()
            .map(|e| (e.index, e.term))
            .or(*self.base.lock())
    }

    fn snapshot_point(&self) -> Option<(LogIndex, Term)> {
        *self.snapshot_point.lock()
    }

    fn snapshot(&self) -> Result<Option<SnapshotData>> {
        let Some((index, term)) = self.last_applied() else {
            return Ok(None);
        };
        let data = bincode::serialize(&(*self.base.lock(), self.applied()))?;
        Ok(Some(SnapshotData {
            last_included_index: index,
            last_included_term: term,
            data: Bytes::from(data),
        }))
    }

    fn restore(&self, snapshot: &SnapshotData) -> Result<()> {
        let (base, entries): (Option<(LogIndex, Term)>, Vec<LogEntry>) =
            bincode::deserialize(&snapshot.data)
                .map_err(|e| StorageError::CorruptSnapshot(e.to_string()))?;
        *self.base.lock() = base;
        *self.applied.lock() = entries;
        *self.snapshot_point.lock() =
            Some((snapshot.last_included_index, snapshot.last_included_term));
        Ok(())
    }
}

/// Transport whose peers are never reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait::async_trait]
impl RpcClient for NullTransport {
    async fn call(&self, target: &str, _message: Message, _term: Option<Term>) -> Result<Message> {
        Err(NetworkError::Unreachable(target.to_string()).into())
    }
}

/// Serves Raft RPCs for a bare [`RaftNode`], without storage or sharding.
pub struct RaftHandler {
    raft: RaftNode,
}

impl RaftHandler {
    pub fn new(raft: RaftNode) -> Self {
        Self { raft }
    }

    async fn dispatch(&self, message: Message) -> Result<Message> {
        Ok(match message {
            Message::AppendEntries(request) => {
                Message::AppendEntriesResponse(self.raft.handle_append_entries(request).await?)
            }
            Message::RequestVote(request) => {
                Message::VoteResponse(self.raft.handle_request_vote(request).await?)
            }
            Message::InstallSnapshot(request) => {
                Message::InstallSnapshotResponse(self.raft.handle_install_snapshot(request).await?)
            }
            Message::Ping => Message::Pong(PongResponse {
                node_id: self.raft.id().to_string(),
                leader_id: self.raft.leader_id(),
            }),
            other => Message::Error(format!("{} not served", other.kind())),
        })
    }
}

#[async_trait::async_trait]
impl MessageHandler for RaftHandler {
    async fn handle(&self, envelope: Envelope) -> Option<Envelope> {
        let reply = match self.dispatch(envelope.message).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(node_id = %self.raft.id(), from = %envelope.from, error = %e, "Raft RPC failed");
                Message::Error(e.to_string())
            }
        };
        Some(Envelope::new(self.raft.id(), self.raft.term(), reply))
    }
}
