//! Who may change the ring, and how.

use crate::error::{MigrationError, Result, ShardError};
use crate::migration::MigrationOperation;
use crate::partitioning::HashRing;
use crate::types::RingUpdate;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Applies ownership and membership changes to the ring.
///
/// In a cluster every change goes through consensus so all nodes apply it
/// at the same log index; standalone, [`DirectRouting`] edits the ring in place.
#[async_trait::async_trait]
pub trait RoutingAuthority: Send + Sync {
    /// Hand the migrating segment to the operation's target in one step.
    async fn reassign(&self, operation: &MigrationOperation) -> Result<()>;

    /// Apply a membership or shape change.
    async fn update_ring(&self, update: RingUpdate) -> Result<()>;

    /// The ring routing lookups read from.
    fn ring(&self) -> Arc<RwLock<HashRing>>;

    /// Whether `node_id` currently replicates the segment closed at `position`.
    fn is_replica(&self, node_id: &str, position: u32) -> bool {
        self.ring().read().is_replica_at(node_id, position)
    }
}

/// Apply a ring update, returning whether it changed anything.
///
/// Every variant is idempotent so replaying a committed update is harmless.
pub(crate) fn apply_ring_update(ring: &mut HashRing, update: &RingUpdate) -> bool {
    match update {
        RingUpdate::AddNode { node_id, weight } => {
            if ring.contains_node(node_id) {
                return false;
            }
            ring.add_node(node_id, *weight);
            true
        }
        RingUpdate::RemoveNode { node_id } => {
            let present = ring.contains_node(node_id);
            ring.remove_node(node_id);
            present
        }
        RingUpdate::Split { position, at } => ring.split(*position, *at),
        RingUpdate::Merge { position } => ring.merge(*position),
    }
}

/// Routing authority that owns the ring directly.
#[derive(Debug, Clone)]
pub struct DirectRouting {
    ring: Arc<RwLock<HashRing>>,
}

impl DirectRouting {
    pub fn new(ring: Arc<RwLock<HashRing>>) -> Self {
        Self { ring }
    }
}

#[async_trait::async_trait]
impl RoutingAuthority for DirectRouting {
    async fn reassign(&self, operation: &MigrationOperation) -> Result<()> {
        let position = operation.position();
        if !self
            .ring
            .write()
            .reassign(position, &operation.target_node_id)
        {
            return Err(MigrationError::Routing(format!(
                "no virtual node at {position:#010x}"
            ))
            .into());
        }
        info!(
            operation_id = %operation.id,
            shard_id = %operation.shard_id,
            target = %operation.target_node_id,
            "Shard ownership flipped"
        );
        Ok(())
    }

    async fn update_ring(&self, update: RingUpdate) -> Result<()> {
        let mut ring = self.ring.write();
        if !apply_ring_update(&mut ring, &update) {
            if let RingUpdate::Split { .. } | RingUpdate::Merge { .. } = update {
                return Err(ShardError::Reshape(format!("{update:?} does not apply")).into());
            }
        }
        Ok(())
    }

    fn ring(&self) -> Arc<RwLock<HashRing>> {
        self.ring.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::HashRange;

    fn ring() -> Arc<RwLock<HashRing>> {
        let mut ring = HashRing::new(4, 1);
        ring.add_node("a", 1);
        ring.add_node("b", 1);
        Arc::new(RwLock::new(ring))
    }

    #[tokio::test]
    async fn test_direct_reassign() {
        let routing = DirectRouting::new(ring());
        let shard = routing
            .ring()
            .read()
            .shards()
            .into_iter()
            .find(|s| s.node_id == "a")
            .unwrap();
        let op = MigrationOperation::new(
            "m".into(),
            shard.id.clone(),
            shard.range,
            "a".into(),
            "b".into(),
        );
        routing.reassign(&op).await.unwrap();
        assert!(routing.is_replica("b", shard.position()));
        assert!(!routing.is_replica("a", shard.position()));

        let missing = MigrationOperation::new(
            "m2".into(),
            "s99".into(),
            HashRange::new(shard.position(), shard.position().wrapping_add(1)),
            "a".into(),
            "b".into(),
        );
        assert!(routing.ring().read().shard_at(missing.position()).is_none());
        assert!(routing.reassign(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_ring_updates_are_idempotent() {
        let routing = DirectRouting::new(ring());
        routing
            .update_ring(RingUpdate::AddNode {
                node_id: "c".into(),
                weight: 1,
            })
            .await
            .unwrap();
        let vnodes = routing.ring().read().vnode_count();
        routing
            .update_ring(RingUpdate::AddNode {
                node_id: "c".into(),
                weight: 1,
            })
            .await
            .unwrap();
        assert_eq!(routing.ring().read().vnode_count(), vnodes);

        routing
            .update_ring(RingUpdate::RemoveNode { node_id: "c".into() })
            .await
            .unwrap();
        routing
            .update_ring(RingUpdate::RemoveNode { node_id: "c".into() })
            .await
            .unwrap();
        assert!(!routing.ring().read().contains_node("c"));

        let err = routing
            .update_ring(RingUpdate::Merge { position: 12345 })
            .await;
        assert!(err.is_err());
    }
}
