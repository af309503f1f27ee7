//! Registry of the fixed cluster membership.
//!
//! Members are known from configuration; the registry only tracks what this
//! node currently believes about each of them: its Raft role, when it was
//! last heard from, whether it takes part in a migration, and which shards
//! it owns.

use crate::config::PeerConfig;
use crate::consensus::Role;
use crate::types::{now_millis, NodeId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

/// Status of a member as seen from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Leader,
    Follower,
    Candidate,
    Migrating,
    Offline,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Leader => write!(f, "leader"),
            NodeStatus::Follower => write!(f, "follower"),
            NodeStatus::Candidate => write!(f, "candidate"),
            NodeStatus::Migrating => write!(f, "migrating"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Descriptive data attached to a member.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub capabilities: Vec<String>,
    /// Share of all shards owned by the node, 0.0-1.0.
    pub load: f64,
    /// Ids of the shards the node owns.
    pub shards: Vec<String>,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    /// Milliseconds since the Unix epoch; 0 when never heard from.
    pub last_seen: u64,
    pub metadata: NodeMetadata,
}

#[derive(Default)]
struct RegistryState {
    nodes: BTreeMap<NodeId, Node>,
    /// Members heard from since they were last marked offline.
    reachable: HashSet<NodeId>,
    migrating: HashSet<NodeId>,
    leader: Option<NodeId>,
    local_role: Option<Role>,
}

impl RegistryState {
    fn derive_status(&self, node_id: &str, local: &str) -> NodeStatus {
        if self.migrating.contains(node_id) {
            return NodeStatus::Migrating;
        }
        if self.leader.as_deref() == Some(node_id) {
            return NodeStatus::Leader;
        }
        if node_id == local {
            return match self.local_role {
                Some(Role::Candidate) => NodeStatus::Candidate,
                Some(Role::Leader) => NodeStatus::Leader,
                _ => NodeStatus::Follower,
            };
        }
        if self.reachable.contains(node_id) {
            NodeStatus::Follower
        } else {
            NodeStatus::Offline
        }
    }

    fn refresh(&mut self, local: &str) {
        let statuses: Vec<(NodeId, NodeStatus)> = self
            .nodes
            .keys()
            .map(|id| (id.clone(), self.derive_status(id, local)))
            .collect();
        for (id, status) in statuses {
            if let Some(node) = self.nodes.get_mut(&id) {
                if node.status != status {
                    debug!(node_id = %id, from = %node.status, to = %status, "Node status changed");
                    node.status = status;
                }
            }
        }
    }
}

/// Owned store of [`Node`] records.
pub struct NodeRegistry {
    local: NodeId,
    state: RwLock<RegistryState>,
}

impl NodeRegistry {
    /// Build the registry from the configured members. Other members start
    /// offline until they are heard from.
    pub fn new(local: impl Into<NodeId>, peers: &[PeerConfig]) -> Self {
        let local = local.into();
        let mut state = RegistryState::default();
        for peer in peers {
            state.nodes.insert(
                peer.id.clone(),
                Node {
                    id: peer.id.clone(),
                    address: peer.address.clone(),
                    port: peer.port,
                    status: NodeStatus::Offline,
                    last_seen: 0,
                    metadata: NodeMetadata {
                        capabilities: vec!["storage".into(), "raft".into()],
                        ..Default::default()
                    },
                },
            );
        }
        state.reachable.insert(local.clone());
        if let Some(node) = state.nodes.get_mut(&local) {
            node.last_seen = now_millis();
        }
        state.refresh(&local);
        Self {
            local,
            state: RwLock::new(state),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.state.read().nodes.get(node_id).cloned()
    }

    /// All members ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes.values().cloned().collect()
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.state.read().nodes.keys().cloned().collect()
    }

    /// Record this node's Raft role and the leader it knows of.
    pub fn apply_raft_state(&self, role: Role, leader: Option<NodeId>) {
        let mut state = self.state.write();
        if state.leader != leader {
            info!(node_id = %self.local, leader = ?leader, "Leader changed");
        }
        if let Some(leader) = &leader {
            state.reachable.insert(leader.clone());
        }
        state.leader = leader;
        state.local_role = Some(role);
        state.refresh(&self.local);
    }

    /// Record contact from a member.
    pub fn mark_seen(&self, node_id: &str) {
        let mut state = self.state.write();
        let Some(node) = state.nodes.get_mut(node_id) else {
            return;
        };
        node.last_seen = now_millis();
        if state.reachable.insert(node_id.to_string()) {
            state.refresh(&self.local);
        }
    }

    /// Record that a member stopped answering.
    pub fn mark_offline(&self, node_id: &str) {
        if node_id == self.local {
            return;
        }
        let mut state = self.state.write();
        if state.reachable.remove(node_id) {
            info!(node_id, "Node marked offline");
            state.refresh(&self.local);
        }
    }

    /// Replace the set of members taking part in a migration.
    pub fn set_migrating(&self, nodes: HashSet<NodeId>) {
        let mut state = self.state.write();
        if state.migrating != nodes {
            state.migrating = nodes;
            state.refresh(&self.local);
        }
    }

    /// Update shard ownership metadata from the ring's current layout.
    pub fn set_shards(&self, owned: HashMap<NodeId, Vec<String>>) {
        let mut state = self.state.write();
        let total: usize = owned.values().map(Vec::len).sum();
        for node in state.nodes.values_mut() {
            let shards = owned.get(&node.id).cloned().unwrap_or_default();
            node.metadata.load = if total == 0 {
                0.0
            } else {
                shards.len() as f64 / total as f64
            };
            node.metadata.shards = shards;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        let peers: Vec<PeerConfig> = (1..=3)
            .map(|i| PeerConfig::new(format!("node-{i}"), "127.0.0.1", 7000 + i as u16))
            .collect();
        NodeRegistry::new("node-1", &peers)
    }

    #[test]
    fn test_initial_statuses() {
        let registry = registry();
        assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Follower);
        assert_eq!(registry.get("node-2").unwrap().status, NodeStatus::Offline);
        assert_eq!(registry.get("node-2").unwrap().port, 7002);
        assert!(registry.get("node-9").is_none());
    }

    #[test]
    fn test_status_follows_raft_and_contact() {
        let registry = registry();
        registry.apply_raft_state(Role::Candidate, None);
        assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Candidate);

        registry.apply_raft_state(Role::Follower, Some("node-2".into()));
        assert_eq!(registry.get("node-2").unwrap().status, NodeStatus::Leader);
        assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Follower);
        assert_eq!(registry.get("node-3").unwrap().status, NodeStatus::Offline);

        registry.mark_seen("node-3");
        let node3 = registry.get("node-3").unwrap();
        assert_eq!(node3.status, NodeStatus::Follower);
        assert!(node3.last_seen > 0);

        registry.mark_offline("node-3");
        assert_eq!(registry.get("node-3").unwrap().status, NodeStatus::Offline);
        registry.mark_offline("node-1");
        assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Follower);
    }

    #[test]
    fn test_migrating_overrides_role() {
        let registry = registry();
        registry.apply_raft_state(Role::Leader, Some("node-1".into()));
        registry.set_migrating(HashSet::from(["node-1".to_string()]));
        assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Migrating);
        registry.set_migrating(HashSet::new());
        assert_eq!(registry.get("node-1").unwrap().status, NodeStatus::Leader);
    }

    #[test]
    fn test_shard_metadata() {
        let registry = registry();
        registry.set_shards(HashMap::from([
            ("node-1".to_string(), vec!["s0".to_string(), "s2".to_string()]),
            ("node-2".to_string(), vec!["s1".to_string()]),
        ]));
        let node1 = registry.get("node-1").unwrap();
        assert_eq!(node1.metadata.shards, vec!["s0", "s2"]);
        assert!((node1.metadata.load - 2.0 / 3.0).abs() < 1e-9);
        assert!(registry.get("node-3").unwrap().metadata.shards.is_empty());
    }
}
