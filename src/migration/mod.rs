//! Shard migration between nodes.
//!
//! A migration moves the data of one ring segment from its current owner to
//! another node and then hands the segment over. Every operation walks the
//! same forward-only pipeline:
//!
//! ```text
//! pending -> preparing -> transferring -> verifying -> updating_routing -> cleaning_up -> completed
//!    \___________\_____________\______________\______________\________________\--> failed | cancelled
//! ```
//!
//! - **preparing** reserves room on the target for the segment's current size.
//! - **transferring** copies entries in key order, one bounded chunk at a time.
//! - **verifying** compares CRC32 checksums of the range on both ends.
//! - **updating_routing** flips the segment's owner in a single ring update.
//! - **cleaning_up** drops the range from the source when it no longer replicates it.
//!
//! Writes into the segment are rejected from `transferring` through
//! `updating_routing` so the copy cannot go stale before the flip.

mod engine;
mod routing;
mod store;

pub use engine::MigrationEngine;
pub use routing::{DirectRouting, RoutingAuthority};
pub(crate) use routing::apply_ring_update;
pub use store::{ShardDataStore, StaticResolver, StoreResolver};

use crate::partitioning::HashRange;
use crate::types::{now_millis, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Status of a migration operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationStatus {
    Pending,
    Preparing,
    Transferring,
    Verifying,
    UpdatingRouting,
    CleaningUp,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Preparing => "preparing",
            MigrationStatus::Transferring => "transferring",
            MigrationStatus::Verifying => "verifying",
            MigrationStatus::UpdatingRouting => "updating_routing",
            MigrationStatus::CleaningUp => "cleaning_up",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl MigrationStatus {
    /// Whether the operation has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }

    /// Whether writes to the migrating range must be held back.
    pub fn freezes_writes(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Transferring
                | MigrationStatus::Verifying
                | MigrationStatus::UpdatingRouting
        )
    }

    /// Position in the pipeline, used to keep transitions forward-only.
    fn rank(&self) -> u8 {
        match self {
            MigrationStatus::Pending => 0,
            MigrationStatus::Preparing => 1,
            MigrationStatus::Transferring => 2,
            MigrationStatus::Verifying => 3,
            MigrationStatus::UpdatingRouting => 4,
            MigrationStatus::CleaningUp => 5,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled => 6,
        }
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: MigrationStatus,
    /// Milliseconds since the Unix epoch.
    pub at: u64,
}

/// A migration and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationOperation {
    pub id: String,
    pub shard_id: String,
    pub range: HashRange,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub status: MigrationStatus,
    /// Percent of `total_data_size` copied, 0-100, never decreasing.
    pub progress: f64,
    pub data_transferred: u64,
    pub total_data_size: u64,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub error: Option<String>,
    pub transitions: Vec<StatusTransition>,
}

impl MigrationOperation {
    pub(crate) fn new(
        id: String,
        shard_id: String,
        range: HashRange,
        source_node_id: NodeId,
        target_node_id: NodeId,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            shard_id,
            range,
            source_node_id,
            target_node_id,
            status: MigrationStatus::Pending,
            progress: 0.0,
            data_transferred: 0,
            total_data_size: 0,
            start_time: now,
            end_time: None,
            error: None,
            transitions: vec![StatusTransition {
                status: MigrationStatus::Pending,
                at: now,
            }],
        }
    }

    /// Ring position of the virtual node closing the migrating segment.
    pub fn position(&self) -> u32 {
        self.range.end
    }

    /// Move to `status`. Returns false for backward moves or moves out of a terminal state.
    pub(crate) fn transition(&mut self, status: MigrationStatus) -> bool {
        if self.status.is_terminal() || status.rank() <= self.status.rank() {
            return false;
        }
        let at = now_millis();
        info!(
            operation_id = %self.id,
            shard_id = %self.shard_id,
            from = %self.status,
            to = %status,
            "Migration status changed"
        );
        self.status = status;
        self.transitions.push(StatusTransition { status, at });
        if status.is_terminal() {
            self.end_time = Some(at);
        }
        true
    }

    /// Count bytes copied and recompute progress.
    pub(crate) fn record_transfer(&mut self, bytes: u64) {
        self.data_transferred += bytes;
        let progress = if self.total_data_size == 0 {
            100.0
        } else {
            (self.data_transferred as f64 / self.total_data_size as f64 * 100.0).min(100.0)
        };
        self.progress = self.progress.max(progress);
    }
}
