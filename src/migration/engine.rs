//! Runs migration operations through their stages.
//!
//! Handing one segment to a new owner also shifts the replica sets of the
//! segments that walk into it when more than one replica is kept. A run
//! therefore works from the full list of [`ReplicaChange`]s: every node that
//! joins a set receives that range before the flip, and only nodes that leave
//! a set drop it afterwards.

use crate::config::MigrationConfig;
use crate::error::{Error, MigrationError, Result, ShardError};
use crate::migration::{
    MigrationOperation, MigrationStatus, RoutingAuthority, ShardDataStore, StoreResolver,
};
use crate::partitioning::{HashRange, ReplicaChange};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Tracked {
    operation: MigrationOperation,
    running: bool,
    cancel_requested: bool,
    /// Ranges whose writes are held while the operation is in flight.
    frozen: Vec<HashRange>,
}

/// A range copied to a node that joins its replica set.
#[derive(Debug, Clone)]
struct RangeCopy {
    range: HashRange,
    from: NodeId,
    to: NodeId,
}

/// Copies needed so every joining replica holds its range. The operation's
/// source serves a range whenever it held it before.
fn plan_copies(operation: &MigrationOperation, changes: &[ReplicaChange]) -> Vec<RangeCopy> {
    let mut copies = Vec::new();
    for change in changes {
        let from = if change.before.contains(&operation.source_node_id) {
            operation.source_node_id.clone()
        } else {
            match change.before.first() {
                Some(node) => node.clone(),
                None => continue,
            }
        };
        copies.extend(change.joining().map(|to| RangeCopy {
            range: change.range,
            from: from.clone(),
            to: to.clone(),
        }));
    }
    copies
}

/// What a run has done so far, for unwinding on failure.
#[derive(Default)]
struct RunState {
    reserved: Vec<(NodeId, u64)>,
    ingested: Vec<(NodeId, HashRange)>,
    /// Set once the flip committed or may still commit.
    keep_copies: bool,
}

/// Executes migrations, at most `max_concurrent` at a time.
pub struct MigrationEngine {
    config: MigrationConfig,
    resolver: Arc<dyn StoreResolver>,
    routing: Arc<dyn RoutingAuthority>,
    operations: RwLock<HashMap<String, Tracked>>,
    permits: Arc<Semaphore>,
}

impl MigrationEngine {
    pub fn new(
        config: MigrationConfig,
        resolver: Arc<dyn StoreResolver>,
        routing: Arc<dyn RoutingAuthority>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            resolver,
            routing,
            operations: RwLock::new(HashMap::new()),
            permits,
        }
    }

    pub fn routing(&self) -> &Arc<dyn RoutingAuthority> {
        &self.routing
    }

    /// Register a pending migration of `range` from `source` to `target`.
    pub fn create(
        &self,
        shard_id: impl Into<String>,
        range: HashRange,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> Result<String> {
        let (source, target) = (source.into(), target.into());
        if source == target {
            return Err(ShardError::InvalidTarget(format!(
                "source and target are both {source}"
            ))
            .into());
        }
        let id = Uuid::new_v4().to_string();
        let operation = MigrationOperation::new(id.clone(), shard_id.into(), range, source, target);
        info!(
            operation_id = %id,
            shard_id = %operation.shard_id,
            source = %operation.source_node_id,
            target = %operation.target_node_id,
            range = %range,
            "Migration created"
        );
        self.operations.write().insert(
            id.clone(),
            Tracked {
                operation,
                running: false,
                cancel_requested: false,
                frozen: vec![range],
            },
        );
        Ok(id)
    }

    /// Run an operation to a terminal status and return it.
    ///
    /// A terminal operation is not run again; its status is returned as is.
    pub async fn execute(&self, id: &str) -> Result<MigrationStatus> {
        {
            let mut operations = self.operations.write();
            let tracked = operations
                .get_mut(id)
                .ok_or_else(|| ShardError::UnknownOperation(id.to_string()))?;
            if tracked.operation.status.is_terminal() {
                debug!(operation_id = id, status = %tracked.operation.status, "Migration already finished");
                return Ok(tracked.operation.status);
            }
            if tracked.running {
                return Err(ShardError::InvalidState {
                    id: id.to_string(),
                    status: tracked.operation.status.to_string(),
                }
                .into());
            }
            tracked.running = true;
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("migration permits closed".into()))?;

        let mut state = RunState::default();
        let outcome = self.run(id, &mut state).await;
        let status = self.finish(id, outcome, state).await;
        drop(permit);
        Ok(status)
    }

    /// Replica set changes the flip of `operation` would cause right now.
    fn replica_changes(&self, operation: &MigrationOperation) -> Result<Vec<ReplicaChange>> {
        let ring = self.routing.ring();
        let ring = ring.read();
        let position = operation.position();
        if ring.shard_at(position).map(|s| s.range) != Some(operation.range) {
            return Err(MigrationError::Routing(format!(
                "segment {} no longer matches the ring",
                operation.range
            ))
            .into());
        }
        Ok(ring.reassign_changes(position, &operation.target_node_id))
    }

    async fn run(&self, id: &str, state: &mut RunState) -> Result<()> {
        let operation = self.advance(id, MigrationStatus::Preparing)?;
        let changes = self.replica_changes(&operation)?;
        let copies = plan_copies(&operation, &changes);
        {
            let frozen = changes.iter().map(|c| c.range).chain([operation.range]);
            if let Some(tracked) = self.operations.write().get_mut(id) {
                tracked.frozen = frozen.collect();
            }
        }

        let mut total = 0u64;
        for copy in &copies {
            let stats = self.store(&copy.from)?.range_stats(copy.range).await?;
            self.store(&copy.to)?.reserve(stats.size).await?;
            state.reserved.push((copy.to.clone(), stats.size));
            total += stats.size;
        }
        self.update(id, |op| op.total_data_size = total);
        debug!(
            operation_id = id,
            ranges = changes.len(),
            copies = copies.len(),
            bytes = total,
            "Capacity reserved"
        );

        self.advance(id, MigrationStatus::Transferring)?;
        for copy in &copies {
            self.copy_range(id, copy, state).await?;
        }
        self.update(id, |op| op.record_transfer(0));

        self.advance(id, MigrationStatus::Verifying)?;
        for copy in &copies {
            let source_sum = self.store(&copy.from)?.checksum(copy.range).await?;
            let target_sum = self.store(&copy.to)?.checksum(copy.range).await?;
            if source_sum != target_sum {
                error!(
                    operation_id = id,
                    range = %copy.range,
                    from = %copy.from,
                    to = %copy.to,
                    source_sum,
                    target_sum,
                    "Checksum mismatch after transfer"
                );
                return Err(MigrationError::ChecksumMismatch {
                    source_sum,
                    target_sum,
                }
                .into());
            }
        }

        let operation = self.advance(id, MigrationStatus::UpdatingRouting)?;
        if self.replica_changes(&operation)? != changes {
            return Err(MigrationError::Routing("replica sets changed during transfer".into()).into());
        }
        match self.routing.reassign(&operation).await {
            Ok(()) => {}
            Err(Error::Migration(MigrationError::RoutingUnresolved(reason))) => {
                // The change may still commit, so no copy can be undone.
                state.keep_copies = true;
                let owner = self.routing.ring().read().route_position(operation.position());
                if owner.as_deref() != Some(operation.target_node_id.as_str()) {
                    warn!(operation_id = id, reason = %reason, "Routing outcome unknown, keeping copies");
                    return Err(MigrationError::RoutingUnresolved(reason).into());
                }
                info!(operation_id = id, reason = %reason, "Ownership change visible despite routing error");
            }
            Err(e) => return Err(e),
        }
        state.keep_copies = true;

        self.advance(id, MigrationStatus::CleaningUp)?;
        for change in &changes {
            for node in change.leaving() {
                if self.routing.is_replica(node, change.range.end) {
                    debug!(operation_id = id, node_id = %node, range = %change.range, "Node replicates the range again, keeping its copy");
                    continue;
                }
                let store = self.store(node)?;
                let removed = store.delete_range(change.range).await?;
                store.persist().await?;
                debug!(operation_id = id, node_id = %node, range = %change.range, removed, "Range cleaned up");
            }
        }
        Ok(())
    }

    /// Stream one range in chunks and persist it on the receiving node.
    async fn copy_range(&self, id: &str, copy: &RangeCopy, state: &mut RunState) -> Result<()> {
        let source = self.store(&copy.from)?;
        let target = self.store(&copy.to)?;
        let mut after: Option<String> = None;
        let mut chunks = 0u64;
        loop {
            let chunk = source
                .read_chunk(copy.range, after.clone(), self.config.chunk_size)
                .await?;
            let last_key = match chunk.last() {
                Some(entry) => entry.key.clone(),
                None => break,
            };
            let entries = chunk.len();
            if chunks == 0 {
                state.ingested.push((copy.to.clone(), copy.range));
            }
            let bytes = target.ingest(chunk).await?;
            after = Some(last_key);
            chunks += 1;
            self.update(id, |op| op.record_transfer(bytes));
            debug!(operation_id = id, to = %copy.to, chunk = chunks, entries, bytes, "Chunk transferred");
            if !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
        }
        target.persist().await
    }

    async fn finish(&self, id: &str, outcome: Result<()>, state: RunState) -> MigrationStatus {
        for (node, bytes) in &state.reserved {
            if *bytes == 0 {
                continue;
            }
            if let Some(store) = self.resolver.store(node) {
                if let Err(e) = store.release(*bytes).await {
                    warn!(operation_id = id, node_id = %node, error = %e, "Failed to release reservation");
                }
            }
        }

        let (status, message) = match &outcome {
            Ok(()) => (MigrationStatus::Completed, None),
            Err(Error::Migration(MigrationError::Cancelled)) => (MigrationStatus::Cancelled, None),
            Err(e) => (MigrationStatus::Failed, Some(e.to_string())),
        };

        // Undo partial copies unless the node already replicated the range.
        if status != MigrationStatus::Completed && !state.keep_copies {
            for (node, range) in &state.ingested {
                if self.routing.is_replica(node, range.end) {
                    continue;
                }
                let Some(store) = self.resolver.store(node) else {
                    continue;
                };
                let rollback = async {
                    let removed = store.delete_range(*range).await?;
                    store.persist().await?;
                    Ok::<_, Error>(removed)
                };
                match rollback.await {
                    Ok(removed) => debug!(operation_id = id, node_id = %node, removed, "Rolled back partial copy"),
                    Err(e) => warn!(operation_id = id, node_id = %node, error = %e, "Failed to roll back partial copy"),
                }
            }
        }

        let mut operations = self.operations.write();
        if let Some(tracked) = operations.get_mut(id) {
            tracked.running = false;
            tracked.operation.error = message.clone();
            tracked.operation.transition(status);
        }
        match message {
            Some(error) => warn!(operation_id = id, error = %error, "Migration failed"),
            None => info!(operation_id = id, status = %status, "Migration finished"),
        }
        status
    }

    fn store(&self, node_id: &str) -> Result<Arc<dyn ShardDataStore>> {
        self.resolver
            .store(node_id)
            .ok_or_else(|| MigrationError::StoreUnavailable(node_id.to_string()).into())
    }

    /// Enter the next stage unless cancellation was requested.
    fn advance(&self, id: &str, status: MigrationStatus) -> Result<MigrationOperation> {
        let mut operations = self.operations.write();
        let tracked = operations
            .get_mut(id)
            .ok_or_else(|| ShardError::UnknownOperation(id.to_string()))?;
        if tracked.cancel_requested {
            return Err(MigrationError::Cancelled.into());
        }
        tracked.operation.transition(status);
        Ok(tracked.operation.clone())
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut MigrationOperation)) {
        if let Some(tracked) = self.operations.write().get_mut(id) {
            f(&mut tracked.operation);
        }
    }

    /// Snapshot of an operation.
    pub fn get(&self, id: &str) -> Option<MigrationOperation> {
        self.operations
            .read()
            .get(id)
            .map(|t| t.operation.clone())
    }

    /// All operations, oldest first.
    pub fn list(&self) -> Vec<MigrationOperation> {
        let mut operations: Vec<_> = self
            .operations
            .read()
            .values()
            .map(|t| t.operation.clone())
            .collect();
        operations.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        operations
    }

    /// Request cancellation.
    ///
    /// A queued operation is cancelled at once; a running one stops at its next
    /// stage boundary. Routing already flipped stays flipped. Returns false for
    /// unknown or finished operations.
    pub fn cancel(&self, id: &str) -> bool {
        let mut operations = self.operations.write();
        let tracked = match operations.get_mut(id) {
            Some(tracked) => tracked,
            None => return false,
        };
        if tracked.operation.status.is_terminal() {
            return false;
        }
        tracked.cancel_requested = true;
        if !tracked.running {
            tracked.operation.transition(MigrationStatus::Cancelled);
        } else {
            info!(operation_id = id, status = %tracked.operation.status, "Migration cancellation requested");
        }
        true
    }

    /// Operations not yet finished.
    pub fn active_count(&self) -> usize {
        self.operations
            .read()
            .values()
            .filter(|t| !t.operation.status.is_terminal())
            .count()
    }

    /// Shard id of a migration currently freezing writes to `key`.
    pub fn frozen_shard_for_key(&self, key: &str) -> Option<String> {
        self.operations
            .read()
            .values()
            .find(|t| {
                t.operation.status.freezes_writes()
                    && t.frozen.iter().any(|range| range.contains_key(key))
            })
            .map(|t| t.operation.shard_id.clone())
    }
}
