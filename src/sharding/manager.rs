//! Shard table and shard operation lifecycle.

use crate::config::ShardingConfig;
use crate::error::{Result, ShardError};
use crate::migration::{MigrationEngine, MigrationStatus};
use crate::partitioning::{HashRing, ShardRange};
use crate::storage::StorageEngine;
use crate::types::{now_millis, NodeId, RingUpdate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kind of shard operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardOperationType {
    Move,
    Split,
    Merge,
}

impl fmt::Display for ShardOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardOperationType::Move => write!(f, "move"),
            ShardOperationType::Split => write!(f, "split"),
            ShardOperationType::Merge => write!(f, "merge"),
        }
    }
}

/// Lifecycle of a shard operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardOperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for ShardOperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardOperationStatus::Pending => write!(f, "pending"),
            ShardOperationStatus::InProgress => write!(f, "in_progress"),
            ShardOperationStatus::Completed => write!(f, "completed"),
            ShardOperationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl ShardOperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShardOperationStatus::Completed | ShardOperationStatus::Failed
        )
    }
}

/// A scheduled change to one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardOperation {
    pub id: String,
    pub op_type: ShardOperationType,
    pub shard_id: String,
    /// Ring position closing the shard when the operation was scheduled.
    pub position: u32,
    pub source_node_id: NodeId,
    pub target_node_id: Option<NodeId>,
    pub status: ShardOperationStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
    /// Migration carrying out a move.
    pub migration_id: Option<String>,
    /// Cancellation asked for before the migration existed.
    #[serde(default)]
    pub cancel_requested: bool,
}

/// A shard with its last measured load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: String,
    /// Exclusive start of the ring segment.
    pub start_hash: u32,
    /// Inclusive end of the ring segment; also the closing vnode's position.
    pub end_hash: u32,
    pub node_id: NodeId,
    pub key_count: u64,
    pub size: u64,
    pub last_updated: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ShardLoad {
    key_count: u64,
    size: u64,
    last_updated: u64,
}

/// Owns the shard view of the ring and runs shard operations.
///
/// Moves are executed by the [`MigrationEngine`]; splits and merges go
/// straight to its routing authority. Shards are derived from the ring on
/// every call, so they always reflect the latest applied ownership.
pub struct ShardManager {
    config: ShardingConfig,
    ring: Arc<RwLock<HashRing>>,
    migrations: Arc<MigrationEngine>,
    operations: RwLock<HashMap<String, ShardOperation>>,
    loads: RwLock<HashMap<u32, ShardLoad>>,
}

impl ShardManager {
    pub fn new(config: ShardingConfig, migrations: Arc<MigrationEngine>) -> Self {
        let ring = migrations.routing().ring();
        Self {
            config,
            ring,
            migrations,
            operations: RwLock::new(HashMap::new()),
            loads: RwLock::new(HashMap::new()),
        }
    }

    pub fn ring(&self) -> Arc<RwLock<HashRing>> {
        self.ring.clone()
    }

    pub fn migrations(&self) -> &Arc<MigrationEngine> {
        &self.migrations
    }

    fn info(&self, shard: ShardRange) -> ShardInfo {
        let load = self
            .loads
            .read()
            .get(&shard.position())
            .copied()
            .unwrap_or_default();
        ShardInfo {
            id: shard.id,
            start_hash: shard.range.start,
            end_hash: shard.range.end,
            node_id: shard.node_id,
            key_count: load.key_count,
            size: load.size,
            last_updated: load.last_updated,
        }
    }

    /// All shards in ring order.
    pub fn shards(&self) -> Vec<ShardInfo> {
        let shards = self.ring.read().shards();
        shards.into_iter().map(|s| self.info(s)).collect()
    }

    pub fn shard(&self, shard_id: &str) -> Option<ShardInfo> {
        let shard = self.ring.read().shard(shard_id)?;
        Some(self.info(shard))
    }

    pub fn shard_for_key(&self, key: &str) -> Option<ShardInfo> {
        let shard = self.ring.read().shard_for_key(key)?;
        Some(self.info(shard))
    }

    /// Primary owner of a key.
    pub fn route_key(&self, key: &str) -> Option<NodeId> {
        self.ring.read().route(key)
    }

    /// Up to `count` distinct nodes for a key, primary first.
    pub fn replicas_for_key(&self, key: &str, count: usize) -> Vec<NodeId> {
        self.ring.read().replicas(key, count)
    }

    /// Shard id of an in-flight migration blocking writes to `key`.
    pub fn write_frozen(&self, key: &str) -> Option<String> {
        self.migrations.frozen_shard_for_key(key)
    }

    /// The registered node owning the fewest shards, excluding `exclude`.
    pub fn find_best_target_node(&self, exclude: &str) -> Option<NodeId> {
        self.ring
            .read()
            .shard_counts()
            .into_iter()
            .filter(|(node, _)| node != exclude)
            .min_by_key(|(_, count)| *count)
            .map(|(node, _)| node)
    }

    fn insert_operation(
        &self,
        op_type: ShardOperationType,
        shard: &ShardRange,
        target: Option<NodeId>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let operation = ShardOperation {
            id: id.clone(),
            op_type,
            shard_id: shard.id.clone(),
            position: shard.position(),
            source_node_id: shard.node_id.clone(),
            target_node_id: target,
            status: ShardOperationStatus::Pending,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
            error: None,
            migration_id: None,
            cancel_requested: false,
        };
        info!(
            operation_id = %id,
            op_type = %op_type,
            shard_id = %shard.id,
            source = %shard.node_id,
            target = ?operation.target_node_id,
            "Shard operation scheduled"
        );
        self.operations.write().insert(id.clone(), operation);
        id
    }

    fn lookup(&self, shard_id: &str) -> Result<ShardRange> {
        self.ring
            .read()
            .shard(shard_id)
            .ok_or_else(|| ShardError::UnknownShard(shard_id.to_string()).into())
    }

    /// Schedule moving `shard_id` from `source` to `target`, or to the least
    /// loaded node when no target is given.
    pub fn schedule_shard_migration(
        &self,
        shard_id: &str,
        source: &str,
        target: Option<&str>,
    ) -> Result<String> {
        let shard = self.lookup(shard_id)?;
        if shard.node_id != source {
            return Err(ShardError::WrongOwner {
                shard_id: shard_id.to_string(),
                owner: shard.node_id,
                source_node: source.to_string(),
            }
            .into());
        }
        let target = match target {
            Some(target) => {
                if target == source || !self.ring.read().contains_node(target) {
                    return Err(ShardError::InvalidTarget(target.to_string()).into());
                }
                target.to_string()
            }
            None => self
                .find_best_target_node(source)
                .ok_or(ShardError::NoTarget)?,
        };
        Ok(self.insert_operation(ShardOperationType::Move, &shard, Some(target)))
    }

    /// Schedule splitting `shard_id` at its midpoint.
    pub fn schedule_split(&self, shard_id: &str) -> Result<String> {
        let shard = self.lookup(shard_id)?;
        if shard.range.midpoint().is_none() {
            return Err(ShardError::Reshape(format!("{shard_id} is too narrow to split")).into());
        }
        Ok(self.insert_operation(ShardOperationType::Split, &shard, None))
    }

    /// Schedule merging `shard_id` with its predecessor; both must share an owner.
    pub fn schedule_merge(&self, shard_id: &str) -> Result<String> {
        let shard = self.lookup(shard_id)?;
        self.merge_partner(&shard)?;
        Ok(self.insert_operation(ShardOperationType::Merge, &shard, None))
    }

    fn merge_partner(&self, shard: &ShardRange) -> Result<ShardRange> {
        let ring = self.ring.read();
        let previous = ring
            .shard_at(shard.range.start)
            .filter(|p| p.position() != shard.position())
            .ok_or_else(|| ShardError::Reshape(format!("{} has no neighbour", shard.id)))?;
        if previous.node_id != shard.node_id {
            return Err(ShardError::Reshape(format!(
                "{} and {} have different owners",
                previous.id, shard.id
            ))
            .into());
        }
        Ok(previous)
    }

    /// Run a pending operation to completion.
    ///
    /// Finished operations report their status again without re-running.
    pub async fn execute_shard_operation(&self, id: &str) -> Result<ShardOperationStatus> {
        let operation = {
            let mut operations = self.operations.write();
            let operation = operations
                .get_mut(id)
                .ok_or_else(|| ShardError::UnknownOperation(id.to_string()))?;
            match operation.status {
                ShardOperationStatus::Pending => {}
                status if status.is_terminal() => return Ok(status),
                status => {
                    return Err(ShardError::InvalidState {
                        id: id.to_string(),
                        status: status.to_string(),
                    }
                    .into())
                }
            }
            operation.status = ShardOperationStatus::InProgress;
            operation.started_at = Some(now_millis());
            operation.clone()
        };
        debug!(operation_id = id, op_type = %operation.op_type, "Shard operation started");

        let outcome = match operation.op_type {
            ShardOperationType::Move => self.run_move(&operation).await,
            ShardOperationType::Split => self.run_split(&operation).await,
            ShardOperationType::Merge => self.run_merge(&operation).await,
        };

        let mut operations = self.operations.write();
        let operation = operations
            .get_mut(id)
            .ok_or_else(|| ShardError::UnknownOperation(id.to_string()))?;
        operation.completed_at = Some(now_millis());
        match outcome {
            Ok(()) => {
                operation.status = ShardOperationStatus::Completed;
                info!(operation_id = id, shard_id = %operation.shard_id, "Shard operation completed");
            }
            Err(e) => {
                operation.status = ShardOperationStatus::Failed;
                operation.error = Some(e.to_string());
                warn!(operation_id = id, shard_id = %operation.shard_id, error = %e, "Shard operation failed");
            }
        }
        Ok(operation.status)
    }

    fn current_shard(&self, operation: &ShardOperation) -> Result<ShardRange> {
        self.ring
            .read()
            .shard_at(operation.position)
            .ok_or_else(|| ShardError::UnknownShard(operation.shard_id.clone()).into())
    }

    async fn run_move(&self, operation: &ShardOperation) -> Result<()> {
        let shard = self.current_shard(operation)?;
        if shard.node_id != operation.source_node_id {
            return Err(ShardError::WrongOwner {
                shard_id: shard.id,
                owner: shard.node_id,
                source_node: operation.source_node_id.clone(),
            }
            .into());
        }
        let target = operation
            .target_node_id
            .clone()
            .ok_or(ShardError::NoTarget)?;
        let migration_id =
            self.migrations
                .create(shard.id, shard.range, operation.source_node_id.clone(), target)?;
        let cancel_requested = match self.operations.write().get_mut(&operation.id) {
            Some(op) => {
                op.migration_id = Some(migration_id.clone());
                op.cancel_requested
            }
            None => false,
        };
        if cancel_requested {
            debug!(operation_id = %operation.id, migration_id = %migration_id, "Cancelling migration before it starts");
            self.migrations.cancel(&migration_id);
        }

        match self.migrations.execute(&migration_id).await? {
            MigrationStatus::Completed => Ok(()),
            status => {
                let reason = self
                    .migrations
                    .get(&migration_id)
                    .and_then(|m| m.error)
                    .unwrap_or_else(|| format!("migration {status}"));
                Err(ShardError::InvalidState {
                    id: migration_id,
                    status: reason,
                }
                .into())
            }
        }
    }

    async fn run_split(&self, operation: &ShardOperation) -> Result<()> {
        let shard = self.current_shard(operation)?;
        let at = shard
            .range
            .midpoint()
            .ok_or_else(|| ShardError::Reshape(format!("{} is too narrow to split", shard.id)))?;
        self.migrations
            .routing()
            .update_ring(RingUpdate::Split {
                position: shard.position(),
                at,
            })
            .await
    }

    async fn run_merge(&self, operation: &ShardOperation) -> Result<()> {
        let shard = self.current_shard(operation)?;
        let previous = self.merge_partner(&shard)?;
        self.migrations
            .routing()
            .update_ring(RingUpdate::Merge {
                position: previous.position(),
            })
            .await
    }

    pub fn get_operation(&self, id: &str) -> Option<ShardOperation> {
        self.operations.read().get(id).cloned()
    }

    pub fn operations(&self) -> Vec<ShardOperation> {
        let mut operations: Vec<_> = self.operations.read().values().cloned().collect();
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        operations
    }

    /// Cancel a shard operation, or the migration it started.
    ///
    /// Pending operations fail immediately; a running move is cancelled
    /// through its migration, or as soon as that migration is created.
    /// Migration ids are accepted too.
    pub fn cancel_operation(&self, id: &str) -> bool {
        let mut operations = self.operations.write();
        if let Some(operation) = operations.get_mut(id) {
            return match operation.status {
                ShardOperationStatus::Pending => {
                    operation.status = ShardOperationStatus::Failed;
                    operation.error = Some("cancelled".to_string());
                    operation.completed_at = Some(now_millis());
                    info!(operation_id = id, "Shard operation cancelled");
                    true
                }
                ShardOperationStatus::InProgress => match operation.migration_id.as_deref() {
                    Some(migration_id) => self.migrations.cancel(migration_id),
                    None if operation.op_type == ShardOperationType::Move => {
                        operation.cancel_requested = true;
                        info!(operation_id = id, "Shard operation cancellation requested");
                        true
                    }
                    None => false,
                },
                _ => false,
            };
        }
        drop(operations);
        self.migrations.cancel(id)
    }

    /// Whether shard counts are spread wider than the configured threshold.
    ///
    /// True when the standard deviation of per-node shard counts exceeds
    /// `rebalance_threshold × mean`.
    pub fn needs_rebalancing(&self) -> bool {
        let counts: Vec<f64> = self
            .ring
            .read()
            .shard_counts()
            .values()
            .map(|c| *c as f64)
            .collect();
        if counts.len() < 2 {
            return false;
        }
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        if mean == 0.0 {
            return false;
        }
        let variance =
            counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
        variance.sqrt() > self.config.rebalance_threshold * mean
    }

    /// Schedule moves from overloaded to underloaded nodes.
    ///
    /// A node above `mean × (1 + threshold)` sheds shards down to the mean;
    /// receivers are the nodes below `mean × (1 - threshold)`, taken
    /// round-robin. Returns the scheduled operation ids; nothing is executed.
    pub fn rebalance(&self) -> Result<Vec<String>> {
        let (mut counts, shards) = {
            let ring = self.ring.read();
            (ring.shard_counts(), ring.shards())
        };
        // Count scheduled moves as done so repeated calls do not plan them twice.
        let pending: Vec<ShardOperation> = self
            .operations
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        for op in pending.iter().filter(|o| o.op_type == ShardOperationType::Move) {
            if let Some(count) = counts.get_mut(&op.source_node_id) {
                *count = count.saturating_sub(1);
            }
            if let Some(count) = op.target_node_id.as_ref().and_then(|t| counts.get_mut(t)) {
                *count += 1;
            }
        }
        let busy: Vec<u32> = pending.iter().map(|o| o.position).collect();
        if counts.len() < 2 {
            return Ok(Vec::new());
        }
        let total: usize = counts.values().sum();
        let mean = total as f64 / counts.len() as f64;
        let high = mean * (1.0 + self.config.rebalance_threshold);
        let low = mean * (1.0 - self.config.rebalance_threshold);

        let receivers: Vec<&NodeId> = counts
            .iter()
            .filter(|(_, c)| (**c as f64) < low)
            .map(|(n, _)| n)
            .collect();
        if receivers.is_empty() {
            return Ok(Vec::new());
        }

        let mut scheduled = Vec::new();
        let mut next_receiver = 0;
        for (node, count) in &counts {
            if (*count as f64) <= high {
                continue;
            }
            let excess = count.saturating_sub(mean.ceil() as usize);
            let movable = shards
                .iter()
                .filter(|s| &s.node_id == node && !busy.contains(&s.position()))
                .take(excess);
            for shard in movable {
                let target = receivers[next_receiver % receivers.len()];
                next_receiver += 1;
                let id = self.schedule_shard_migration(&shard.id, node, Some(target))?;
                scheduled.push(id);
            }
        }
        info!(scheduled = scheduled.len(), mean, "Rebalance planned");
        Ok(scheduled)
    }

    /// Recompute key count and size of every shard from `storage`.
    pub fn refresh_metrics(&self, storage: &StorageEngine) {
        let shards = self.ring.read().shards();
        let now = now_millis();
        let loads: HashMap<u32, ShardLoad> = shards
            .iter()
            .map(|shard| {
                let stats = storage.range_stats(shard.range);
                (
                    shard.position(),
                    ShardLoad {
                        key_count: stats.key_count,
                        size: stats.size,
                        last_updated: now,
                    },
                )
            })
            .collect();
        debug!(shards = loads.len(), "Shard metrics refreshed");
        *self.loads.write() = loads;
    }
}
