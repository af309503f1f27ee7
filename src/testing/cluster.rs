//! Full cluster nodes on a [`LocalNetwork`].

use crate::cluster::ClusterCoordinator;
use crate::config::{ClusterConfig, PeerConfig, RaftConfig};
use crate::testing::network::LocalNetwork;
use crate::testing::utils::node_ids;
use crate::types::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::sleep;

/// A test cluster for integration testing.
///
/// Nodes keep their data directory across [`crash`](Self::crash) and
/// [`restart`](Self::restart), so a restart recovers from the WAL.
pub(crate) struct TestCluster {
    pub network: Arc<LocalNetwork>,
    configs: BTreeMap<NodeId, ClusterConfig>,
    nodes: BTreeMap<NodeId, Arc<ClusterCoordinator>>,
    _dir: TempDir,
}

impl TestCluster {
    /// Start `count` nodes with default settings.
    pub async fn start(count: usize) -> Self {
        Self::start_with(count, |config| config).await
    }

    /// Start `count` nodes, letting `tweak` adjust each configuration.
    pub async fn start_with(count: usize, tweak: impl Fn(ClusterConfig) -> ClusterConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ids = node_ids(count);
        let peers: Vec<PeerConfig> = ids
            .iter()
            .map(|id| PeerConfig::new(id.clone(), "127.0.0.1", 0))
            .collect();

        let mut cluster = Self {
            network: LocalNetwork::new(),
            configs: BTreeMap::new(),
            nodes: BTreeMap::new(),
            _dir: dir,
        };
        for id in &ids {
            let config = ClusterConfig::new(id.clone(), cluster._dir.path().join(id))
                .with_peers(peers.clone())
                .with_raft_config(
                    RaftConfig::default()
                        .with_propose_timeout(Duration::from_secs(3)),
                );
            cluster.configs.insert(id.clone(), tweak(config));
        }
        for id in ids {
            cluster.restart(&id).await;
        }
        cluster
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.configs.keys().cloned().collect()
    }

    /// A running node. Panics if it is not running.
    pub fn node(&self, id: &str) -> &Arc<ClusterCoordinator> {
        self.nodes.get(id).unwrap_or_else(|| panic!("{id} is not running"))
    }

    pub fn running(&self) -> Vec<&Arc<ClusterCoordinator>> {
        self.nodes.values().collect()
    }

    /// Current leader among running nodes, if exactly one claims it.
    pub fn leader(&self) -> Option<&Arc<ClusterCoordinator>> {
        let leaders: Vec<_> = self.nodes.values().filter(|n| n.is_leader()).collect();
        match leaders.as_slice() {
            [leader] => Some(*leader),
            _ => None,
        }
    }

    /// Running nodes other than `id`.
    pub fn others(&self, id: &str) -> Vec<&Arc<ClusterCoordinator>> {
        self.nodes
            .iter()
            .filter(|(node_id, _)| node_id.as_str() != id)
            .map(|(_, node)| node)
            .collect()
    }

    /// Wait until exactly one running node leads.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        self.wait_for_leader_among(&ids, timeout).await
    }

    /// Wait until exactly one of `ids` leads and the rest of them follow it.
    pub async fn wait_for_leader_among(&self, ids: &[NodeId], timeout: Duration) -> Option<NodeId> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let members: Vec<_> = ids.iter().filter_map(|id| self.nodes.get(id)).collect();
            let leaders: Vec<_> = members.iter().filter(|n| n.is_leader()).collect();
            if let [leader] = leaders.as_slice() {
                let id = leader.node_id().to_string();
                if members
                    .iter()
                    .all(|n| n.leader_id().as_deref() == Some(id.as_str()))
                {
                    return Some(id);
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Stop a node and detach it from the network. Its data stays on disk.
    pub async fn crash(&mut self, id: &str) {
        self.network.unregister(id);
        if let Some(node) = self.nodes.remove(id) {
            node.shutdown().await;
        }
    }

    /// Start (or start again) a node from its data directory.
    pub async fn restart(&mut self, id: &str) {
        let config = self.configs[id].clone();
        let transport = Arc::new(self.network.transport(id));
        let node = ClusterCoordinator::start(config, transport).await.unwrap();
        self.network.register(id, node.handler());
        self.nodes.insert(id.to_string(), node);
    }

    pub fn isolate(&self, id: &str) {
        self.network.isolate(id);
    }

    pub fn heal(&self, id: &str) {
        self.network.heal(id);
    }

    pub async fn shutdown(mut self) {
        for id in self.ids() {
            self.crash(&id).await;
        }
    }
}
