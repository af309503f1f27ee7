//! Ring changes decided through consensus.

use crate::consensus::RaftNode;
use crate::error::{Error, MigrationError, RaftError, Result, ShardError};
use crate::migration::{apply_ring_update, MigrationOperation, RoutingAuthority};
use crate::partitioning::HashRing;
use crate::types::{Command, RingUpdate};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Classify a failed ownership proposal.
///
/// Only a proposal refused before it reached the log, or overwritten by a
/// newer leader, is known not to commit. After a timeout, a shutdown or a
/// fence the entry may still be committed by a later leader.
fn routing_error(e: Error) -> MigrationError {
    match &e {
        Error::Raft(RaftError::NotLeader { .. } | RaftError::ProposalDropped) => {
            MigrationError::Routing(e.to_string())
        }
        _ => MigrationError::RoutingUnresolved(e.to_string()),
    }
}

/// Routing authority that proposes every ring change to the Raft log.
///
/// The change takes effect when the entry is applied, on every node at the
/// same index. `propose` only returns once the entry has been applied
/// locally, so the leader's ring already reflects the change afterwards.
pub struct ConsensusRouting {
    raft: RaftNode,
    ring: Arc<RwLock<HashRing>>,
}

impl ConsensusRouting {
    pub fn new(raft: RaftNode, ring: Arc<RwLock<HashRing>>) -> Self {
        Self { raft, ring }
    }
}

#[async_trait::async_trait]
impl RoutingAuthority for ConsensusRouting {
    async fn reassign(&self, operation: &MigrationOperation) -> Result<()> {
        let position = operation.position();
        let known = self
            .ring
            .read()
            .shard_at(position)
            .is_some_and(|s| s.position() == position);
        if !known {
            return Err(MigrationError::Routing(format!("no virtual node at {position:#010x}")).into());
        }

        let entry = self
            .raft
            .propose(Command::MigrateShard {
                operation_id: operation.id.clone(),
                shard_id: operation.shard_id.clone(),
                position,
                source: operation.source_node_id.clone(),
                target: operation.target_node_id.clone(),
            })
            .await
            .map_err(routing_error)?;

        let owner = self.ring.read().route_position(position);
        if owner.as_deref() != Some(operation.target_node_id.as_str()) {
            return Err(MigrationError::Routing(format!(
                "segment {position:#010x} owned by {owner:?} after index {}",
                entry.index
            ))
            .into());
        }
        info!(
            operation_id = %operation.id,
            shard_id = %operation.shard_id,
            index = entry.index,
            term = entry.term,
            "Ownership change committed"
        );
        Ok(())
    }

    async fn update_ring(&self, update: RingUpdate) -> Result<()> {
        let applies = {
            let mut preview = self.ring.read().clone();
            apply_ring_update(&mut preview, &update)
        };
        if !applies {
            if let RingUpdate::Split { .. } | RingUpdate::Merge { .. } = update {
                return Err(ShardError::Reshape(format!("{update:?} does not apply")).into());
            }
            return Ok(());
        }
        self.raft.propose(Command::UpdateMembership { update }).await?;
        Ok(())
    }

    fn ring(&self) -> Arc<RwLock<HashRing>> {
        self.ring.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_refused_proposals_are_definite() {
        let refused = routing_error(RaftError::NotLeader { leader: None }.into());
        assert!(matches!(refused, MigrationError::Routing(_)));
        let dropped = routing_error(RaftError::ProposalDropped.into());
        assert!(matches!(dropped, MigrationError::Routing(_)));

        for unknown in [
            Error::Timeout,
            RaftError::Stopped.into(),
            RaftError::WritesFenced.into(),
        ] {
            assert!(matches!(
                routing_error(unknown),
                MigrationError::RoutingUnresolved(_)
            ));
        }
    }
}
