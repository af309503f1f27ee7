//! Applies committed log entries to storage and the hash ring.

use crate::consensus::{SnapshotData, StateMachine};
use crate::error::{Result, StorageError};
use crate::migration::apply_ring_update;
use crate::partitioning::{HashRing, RingLayout};
use crate::storage::{ReplayObserver, StorageEngine};
use crate::types::{Command, LogEntry, LogIndex, NodeId, Term};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Encode the ring as a snapshot auxiliary blob.
fn encode_layout(ring: &HashRing) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(&ring.layout())?))
}

fn decode_layout(aux: &[u8]) -> std::result::Result<RingLayout, StorageError> {
    bincode::deserialize(aux).map_err(|e| StorageError::CorruptSnapshot(format!("ring layout: {e}")))
}

/// Apply a routing command to the ring. Returns whether the command was one.
fn apply_routing(ring: &mut HashRing, command: &Command) -> bool {
    match command {
        Command::MigrateShard {
            operation_id,
            position,
            target,
            ..
        } => {
            if !ring.reassign(*position, target) {
                warn!(operation_id = %operation_id, position, "Committed migration names no virtual node");
            }
            true
        }
        Command::UpdateMembership { update } => {
            apply_ring_update(ring, update);
            true
        }
        _ => false,
    }
}

/// Replays the WAL into the ring alongside storage recovery.
///
/// Writes for keys the local node does not replicate are skipped so that
/// recovery reproduces exactly what live application stored.
pub struct RingReplay {
    node_id: NodeId,
    ring: Arc<RwLock<HashRing>>,
}

impl RingReplay {
    pub fn new(node_id: impl Into<NodeId>, ring: Arc<RwLock<HashRing>>) -> Self {
        Self {
            node_id: node_id.into(),
            ring,
        }
    }
}

impl ReplayObserver for RingReplay {
    fn restore(&mut self, aux: &[u8]) -> std::result::Result<(), StorageError> {
        let layout = decode_layout(aux)?;
        self.ring.write().restore(layout);
        Ok(())
    }

    fn admit(&mut self, entry: &LogEntry) -> bool {
        let mut ring = self.ring.write();
        if apply_routing(&mut ring, &entry.command) {
            return false;
        }
        match &entry.command {
            Command::Set { key, .. } => ring.is_replica(&self.node_id, key),
            _ => true,
        }
    }
}

/// The replicated state machine of a cluster node.
///
/// Key/value commands go to storage, routing commands to the ring. Sets for
/// keys outside this node's replica set are only recorded, so every node
/// advances through the same log while storing only its share of the data.
pub struct ClusterStateMachine {
    node_id: NodeId,
    storage: Arc<StorageEngine>,
    ring: Arc<RwLock<HashRing>>,
}

impl ClusterStateMachine {
    pub fn new(
        node_id: impl Into<NodeId>,
        storage: Arc<StorageEngine>,
        ring: Arc<RwLock<HashRing>>,
    ) -> Result<Self> {
        let machine = Self {
            node_id: node_id.into(),
            storage,
            ring,
        };
        machine.sync_layout()?;
        Ok(machine)
    }

    fn sync_layout(&self) -> Result<()> {
        let aux = encode_layout(&self.ring.read())?;
        self.storage.set_snapshot_aux(aux);
        Ok(())
    }
}

impl StateMachine for ClusterStateMachine {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        match &entry.command {
            Command::Set { key, .. } => {
                if self.ring.read().is_replica(&self.node_id, key) {
                    self.storage.apply(entry)?;
                } else {
                    self.storage.record(entry)?;
                }
            }
            Command::Delete { .. } | Command::Clear => self.storage.apply(entry)?,
            command @ (Command::MigrateShard { .. } | Command::UpdateMembership { .. }) => {
                {
                    let mut ring = self.ring.write();
                    apply_routing(&mut ring, command);
                }
                self.sync_layout()?;
                self.storage.record(entry)?;
                info!(
                    node_id = %self.node_id,
                    index = entry.index,
                    command = command.kind(),
                    "Routing change applied"
                );
            }
            Command::Heartbeat => self.storage.record(entry)?,
        }
        Ok(())
    }

    fn last_applied(&self) -> Option<(LogIndex, Term)> {
        self.storage.last_applied()
    }

    fn snapshot_point(&self) -> Option<(LogIndex, Term)> {
        self.storage.snapshot_point()
    }

    fn snapshot(&self) -> Result<Option<SnapshotData>> {
        // A fresh snapshot always covers the log base, so the follower can
        // continue from entries the leader still holds.
        self.storage.compact()?;
        Ok(self
            .storage
            .snapshot_bytes()?
            .map(|(index, term, data)| SnapshotData {
                last_included_index: index,
                last_included_term: term,
                data,
            }))
    }

    fn restore(&self, snapshot: &SnapshotData) -> Result<()> {
        let aux = self.storage.install_snapshot(
            snapshot.last_included_index,
            snapshot.last_included_term,
            &snapshot.data,
        )?;
        if !aux.is_empty() {
            let layout = decode_layout(&aux)?;
            self.ring.write().restore(layout);
        }
        debug!(
            node_id = %self.node_id,
            index = snapshot.last_included_index,
            "Ring restored from snapshot"
        );
        Ok(())
    }
}
