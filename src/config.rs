//! Configuration types for the cluster.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// A member of the cluster, known at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Unique node id.
    pub id: NodeId,

    /// Host or IP address.
    pub address: String,

    /// Port for inter-node RPCs.
    pub port: u16,

    /// Ring weight; the node receives `weight × vnodes_per_weight` virtual nodes.
    pub weight: u32,
}

impl PeerConfig {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            weight: 1,
        }
    }

    /// Set the ring weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Resolve to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid address for {}: {e}", self.id)))
    }
}

/// Main configuration for a cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Address to bind for inter-node RPCs. `None` runs without a TCP server.
    pub listen_addr: Option<SocketAddr>,

    /// Every cluster member, including this node.
    pub peers: Vec<PeerConfig>,

    /// Directory for the WAL, snapshots and Raft hard state.
    pub data_dir: PathBuf,

    /// Raft-specific configuration.
    pub raft: RaftConfig,

    /// Storage engine configuration.
    pub storage: StorageConfig,

    /// Hash ring and shard configuration.
    pub sharding: ShardingConfig,

    /// Migration pipeline configuration.
    pub migration: MigrationConfig,

    /// TCP transport configuration.
    pub transport: TransportConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            listen_addr: None,
            peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            raft: RaftConfig::default(),
            storage: StorageConfig::default(),
            sharding: ShardingConfig::default(),
            migration: MigrationConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: impl Into<NodeId>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the cluster membership.
    pub fn with_peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.peers = peers;
        self
    }

    /// Set the RPC listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set Raft configuration.
    pub fn with_raft_config(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Set storage configuration.
    pub fn with_storage_config(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Set sharding configuration.
    pub fn with_sharding_config(mut self, sharding: ShardingConfig) -> Self {
        self.sharding = sharding;
        self
    }

    /// Set migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set transport configuration.
    pub fn with_transport_config(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Ids of every other member.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|p| p.id != self.node_id)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node_id must not be empty".into()));
        }
        if !self.peers.iter().any(|p| p.id == self.node_id) {
            return Err(Error::Config(format!(
                "peer list does not contain local node {}",
                self.node_id
            )));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id.as_str()) {
                return Err(Error::Config(format!("duplicate peer id {}", peer.id)));
            }
        }
        self.raft.validate()?;
        if self.sharding.vnodes_per_weight == 0 {
            return Err(Error::Config("vnodes_per_weight must be positive".into()));
        }
        if self.sharding.replication_factor == 0 {
            return Err(Error::Config("replication_factor must be positive".into()));
        }
        if self.migration.chunk_size == 0 || self.migration.max_concurrent == 0 {
            return Err(Error::Config(
                "migration chunk_size and max_concurrent must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Raft-specific configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base election timeout T; the actual timeout is drawn from [T, 2T).
    pub election_timeout: Duration,

    /// Interval between leader heartbeats.
    pub heartbeat_interval: Duration,

    /// Upper bound on a single peer RPC.
    pub rpc_timeout: Duration,

    /// Maximum entries shipped in one AppendEntries.
    pub max_entries_per_append: usize,

    /// How long `propose` waits for the entry to be applied.
    pub propose_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(100),
            max_entries_per_append: 64,
            propose_timeout: Duration::from_secs(5),
        }
    }
}

impl RaftConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base election timeout.
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the maximum batch size for AppendEntries.
    pub fn with_max_entries_per_append(mut self, max: usize) -> Self {
        self.max_entries_per_append = max;
        self
    }

    /// Set the proposal timeout.
    pub fn with_propose_timeout(mut self, timeout: Duration) -> Self {
        self.propose_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.election_timeout.is_zero()
            || self.heartbeat_interval.is_zero()
            || self.rpc_timeout.is_zero()
        {
            return Err(Error::Config("raft timeouts must be positive".into()));
        }
        if self.heartbeat_interval >= self.election_timeout {
            return Err(Error::Config(
                "heartbeat_interval must be shorter than election_timeout".into(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(Error::Config("max_entries_per_append must be positive".into()));
        }
        Ok(())
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Take a snapshot and truncate the WAL after this many applied entries. 0 disables.
    pub snapshot_threshold: u64,

    /// LZ4-compress snapshot bodies.
    pub compress_snapshots: bool,

    /// fsync the WAL after every append.
    pub sync_writes: bool,

    /// Byte budget used by migration reservations. `None` means unlimited.
    pub capacity_bytes: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 10_000,
            compress_snapshots: true,
            sync_writes: false,
            capacity_bytes: None,
        }
    }
}

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the automatic snapshot threshold.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Enable or disable snapshot compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_snapshots = compress;
        self
    }

    /// Enable or disable fsync after each WAL append.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the capacity budget.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }
}

/// Hash ring and shard configuration.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Virtual nodes generated per unit of node weight.
    pub vnodes_per_weight: u32,

    /// Number of distinct nodes that store each key.
    pub replication_factor: usize,

    /// Rebalance when the shard-count standard deviation exceeds this fraction of the mean.
    pub rebalance_threshold: f64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            vnodes_per_weight: 150,
            replication_factor: 3,
            rebalance_threshold: 0.2,
        }
    }
}

impl ShardingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set virtual nodes per weight unit.
    pub fn with_vnodes_per_weight(mut self, vnodes: u32) -> Self {
        self.vnodes_per_weight = vnodes;
        self
    }

    /// Set the replication factor.
    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor;
        self
    }

    /// Set the rebalance threshold.
    pub fn with_rebalance_threshold(mut self, threshold: f64) -> Self {
        self.rebalance_threshold = threshold;
        self
    }
}

/// Migration pipeline configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Maximum bytes moved per transfer chunk.
    pub chunk_size: u64,

    /// Maximum migrations in a non-terminal, non-pending state at once.
    pub max_concurrent: usize,

    /// Optional pause between transfer chunks.
    pub chunk_delay: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_concurrent: 2,
            chunk_delay: Duration::ZERO,
        }
    }
}

impl MigrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size in bytes.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the concurrency cap.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the pause between chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Timeout for a request/response round trip.
    pub request_timeout: Duration,

    /// Maximum encoded frame size.
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_peers() -> Vec<PeerConfig> {
        (1..=3)
            .map(|i| PeerConfig::new(format!("node-{i}"), "127.0.0.1", 7000 + i as u16))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout, Duration::from_millis(150));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(ShardingConfig::default().vnodes_per_weight, 150);
        assert_eq!(MigrationConfig::default().chunk_size, 256 * 1024);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ClusterConfig::new("node-2", "/tmp/x")
            .with_peers(three_peers())
            .with_raft_config(RaftConfig::new().with_election_timeout(Duration::from_millis(300)));

        assert_eq!(config.node_id, "node-2");
        assert_eq!(config.raft.election_timeout, Duration::from_millis(300));
        assert_eq!(config.peer_ids(), vec!["node-1".to_string(), "node-3".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_self() {
        let config = ClusterConfig::new("node-9", "/tmp/x").with_peers(three_peers());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_timeouts() {
        let mut peers = three_peers();
        peers.push(PeerConfig::new("node-1", "127.0.0.1", 9999));
        let config = ClusterConfig::new("node-1", "/tmp/x").with_peers(peers);
        assert!(config.validate().is_err());

        let config = ClusterConfig::new("node-1", "/tmp/x")
            .with_peers(three_peers())
            .with_raft_config(
                RaftConfig::new().with_heartbeat_interval(Duration::from_millis(200)),
            );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_socket_addr() {
        let peer = PeerConfig::new("n", "127.0.0.1", 8080);
        assert_eq!(peer.socket_addr().unwrap().port(), 8080);
        assert!(PeerConfig::new("n", "not an ip", 1).socket_addr().is_err());
    }
}
