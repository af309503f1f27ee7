//! Composition root of a cluster node.

use crate::cluster::handler::ClusterHandler;
use crate::cluster::membership::{Node, NodeRegistry};
use crate::cluster::routing::ConsensusRouting;
use crate::cluster::state_machine::{ClusterStateMachine, RingReplay};
use crate::config::ClusterConfig;
use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, RaftEvent, RaftNode, RaftStorage,
    RaftTransport, Role, VoteRequest, VoteResponse,
};
use crate::error::{RaftError, Result, ShardError};
use crate::migration::{
    MigrationEngine, MigrationOperation, MigrationStatus, StaticResolver, StoreResolver,
};
use crate::network::{Message, NetworkServer, RpcClient, TcpTransport};
use crate::partitioning::HashRing;
use crate::sharding::{ShardInfo, ShardManager, ShardOperation, ShardOperationStatus};
use crate::storage::StorageEngine;
use crate::types::{ClusterStatus, Command, LogEntry, NodeId, Term};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// What a cluster node needs from its network: request/response RPCs to
/// peers (which also makes it a Raft transport) and data stores of remote
/// nodes for migrations.
pub trait ClusterTransport: RpcClient + StoreResolver {
    /// Called with this node's term whenever it changes.
    fn observe_local_term(&self, _term: Term) {}
}

impl ClusterTransport for TcpTransport {
    fn observe_local_term(&self, term: Term) {
        self.set_term(term);
    }
}

/// Result of looking up an operation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationInfo {
    Shard(ShardOperation),
    Migration(MigrationOperation),
}

/// Ids of the shards each node owns.
fn owned_shards(ring: &HashRing) -> HashMap<NodeId, Vec<String>> {
    let mut owned: HashMap<NodeId, Vec<String>> = HashMap::new();
    for shard in ring.shards() {
        owned.entry(shard.node_id).or_default().push(shard.id);
    }
    owned
}

/// One node of the cluster: storage, consensus, sharding and migrations
/// wired together behind the operations an API layer calls.
///
/// Writes are accepted only on the leader and go through the Raft log.
/// Reads are served from local storage; a node holds the keys it replicates,
/// so with fewer replicas than nodes a read must be sent to one of
/// [`replicas_for_key`](Self::replicas_for_key).
pub struct ClusterCoordinator {
    node_id: NodeId,
    config: ClusterConfig,
    storage: Arc<StorageEngine>,
    raft: RaftNode,
    shards: Arc<ShardManager>,
    registry: Arc<NodeRegistry>,
    handler: Arc<ClusterHandler>,
    local_addr: Option<SocketAddr>,
    server_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterCoordinator {
    /// Recover local state and start the node.
    ///
    /// The ring is built from the configured members and then brought up to
    /// date by the storage snapshot and WAL replay. Consensus starts on top
    /// of whatever storage has applied.
    pub async fn start<T: ClusterTransport>(
        config: ClusterConfig,
        transport: Arc<T>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let node_id = config.node_id.clone();

        let mut ring = HashRing::new(
            config.sharding.vnodes_per_weight,
            config.sharding.replication_factor,
        );
        for peer in &config.peers {
            ring.add_node(&peer.id, peer.weight);
        }
        let ring = Arc::new(RwLock::new(ring));

        let mut replay = RingReplay::new(node_id.clone(), ring.clone());
        let storage = Arc::new(StorageEngine::open_with(
            &config.data_dir,
            config.storage.clone(),
            &mut replay,
        )?);
        let raft_storage = RaftStorage::open(&config.data_dir, config.storage.sync_writes)?;
        info!(
            node_id = %node_id,
            term = raft_storage.hard_state().current_term,
            last_log_index = ?raft_storage.log().last_index(),
            last_applied = ?storage.last_applied(),
            "Local state recovered"
        );

        let state_machine = Arc::new(ClusterStateMachine::new(
            node_id.clone(),
            storage.clone(),
            ring.clone(),
        )?);
        let raft_transport: Arc<dyn RaftTransport> = transport.clone();
        let (raft, events, raft_task) = RaftNode::spawn(
            node_id.clone(),
            config.peer_ids(),
            config.raft.clone(),
            raft_storage,
            state_machine,
            raft_transport,
        );

        let remote: Arc<dyn StoreResolver> = transport.clone();
        let resolver = StaticResolver::new().with_fallback(remote);
        resolver.insert(node_id.clone(), storage.clone());
        let routing = Arc::new(ConsensusRouting::new(raft.clone(), ring.clone()));
        let migrations = Arc::new(MigrationEngine::new(
            config.migration.clone(),
            Arc::new(resolver),
            routing,
        ));
        let shards = Arc::new(ShardManager::new(config.sharding.clone(), migrations));

        let registry = Arc::new(NodeRegistry::new(node_id.clone(), &config.peers));
        registry.set_shards(owned_shards(&ring.read()));
        let handler = Arc::new(ClusterHandler::new(
            node_id.clone(),
            raft.clone(),
            storage.clone(),
            registry.clone(),
        ));

        let mut tasks = vec![raft_task];
        tasks.push(tokio::spawn(consume_events(
            events,
            registry.clone(),
            ring,
            transport.clone(),
        )));
        tasks.push(tokio::spawn(probe_peers(
            config.peer_ids(),
            config.raft.election_timeout * 4,
            registry.clone(),
            transport,
        )));

        let mut local_addr = None;
        let mut server_shutdown = None;
        if let Some(addr) = config.listen_addr {
            let (server, shutdown) = NetworkServer::bind(
                addr,
                node_id.clone(),
                handler.clone(),
                config.transport.max_frame_size,
            )
            .await?;
            local_addr = Some(server.local_addr()?);
            server_shutdown = Some(shutdown);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "Network server stopped");
                }
            }));
        }

        info!(node_id = %node_id, peers = config.peers.len(), addr = ?local_addr, "Cluster node started");
        Ok(Arc::new(Self {
            node_id,
            config,
            storage,
            raft,
            shards,
            registry,
            handler,
            local_addr,
            server_shutdown: Mutex::new(server_shutdown),
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn raft(&self) -> &RaftNode {
        &self.raft
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn shard_manager(&self) -> &Arc<ShardManager> {
        &self.shards
    }

    /// Handler to register with a transport for inbound RPCs.
    pub fn handler(&self) -> Arc<ClusterHandler> {
        self.handler.clone()
    }

    /// Address of the TCP server, when one was started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.leader_id()
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.raft.is_leader() {
            Ok(())
        } else {
            Err(RaftError::NotLeader {
                leader: self.raft.leader_id(),
            }
            .into())
        }
    }

    fn ensure_writable(&self, key: &str) -> Result<()> {
        self.ensure_leader()?;
        match self.shards.write_frozen(key) {
            Some(shard_id) => Err(ShardError::Migrating(shard_id).into()),
            None => Ok(()),
        }
    }

    // ==================== Key/value ====================

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.storage.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.storage.has(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.storage.keys()
    }

    pub fn size(&self) -> usize {
        self.storage.size()
    }

    /// Replicate a write and wait until it is applied here.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<LogEntry> {
        let key = key.into();
        self.ensure_writable(&key)?;
        let command = Command::Set {
            key,
            value: value.into(),
            ttl: ttl.map(|t| t.as_millis() as u64),
        };
        self.raft.propose(command).await
    }

    pub async fn delete(&self, key: &str) -> Result<LogEntry> {
        self.ensure_writable(key)?;
        self.raft.propose(Command::delete(key)).await
    }

    /// Remove every key. Refused while any shard's writes are frozen.
    pub async fn clear(&self) -> Result<LogEntry> {
        self.ensure_leader()?;
        if let Some(op) = self
            .shards
            .migrations()
            .list()
            .into_iter()
            .find(|m| m.status.freezes_writes())
        {
            return Err(ShardError::Migrating(op.shard_id).into());
        }
        self.raft.propose(Command::Clear).await
    }

    // ==================== Consensus surface ====================

    /// Append a command to the leader's log without waiting for commit.
    pub async fn append_command(&self, command: Command) -> Result<LogEntry> {
        self.raft.append_command(command).await
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.raft.handle_append_entries(request).await
    }

    pub async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.raft.handle_request_vote(request).await
    }

    // ==================== Routing ====================

    pub fn route_key(&self, key: &str) -> Option<NodeId> {
        self.shards.route_key(key)
    }

    pub fn replicas_for_key(&self, key: &str, count: usize) -> Vec<NodeId> {
        self.shards.replicas_for_key(key, count)
    }

    /// Shards with freshly measured local key counts and sizes.
    pub fn shards(&self) -> Vec<ShardInfo> {
        self.shards.refresh_metrics(&self.storage);
        self.shards.shards()
    }

    // ==================== Shard operations ====================

    fn spawn_operation(&self, id: String) {
        let shards = self.shards.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = shards.execute_shard_operation(&id).await {
                debug!(operation_id = %id, error = %e, "Shard operation not run");
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Schedule moving a shard and start it in the background.
    pub fn schedule_migration(
        &self,
        shard_id: &str,
        source: &str,
        target: Option<&str>,
    ) -> Result<String> {
        self.ensure_leader()?;
        let id = self.shards.schedule_shard_migration(shard_id, source, target)?;
        self.spawn_operation(id.clone());
        Ok(id)
    }

    /// Schedule splitting a shard at its midpoint and start it.
    pub fn split_shard(&self, shard_id: &str) -> Result<String> {
        self.ensure_leader()?;
        let id = self.shards.schedule_split(shard_id)?;
        self.spawn_operation(id.clone());
        Ok(id)
    }

    /// Schedule merging a shard into its predecessor and start it.
    pub fn merge_shard(&self, shard_id: &str) -> Result<String> {
        self.ensure_leader()?;
        let id = self.shards.schedule_merge(shard_id)?;
        self.spawn_operation(id.clone());
        Ok(id)
    }

    /// Plan and start the moves that even out shard counts.
    pub fn rebalance(&self) -> Result<Vec<String>> {
        self.ensure_leader()?;
        let ids = self.shards.rebalance()?;
        for id in &ids {
            self.spawn_operation(id.clone());
        }
        Ok(ids)
    }

    pub fn needs_rebalancing(&self) -> bool {
        self.shards.needs_rebalancing()
    }

    /// Look up a shard operation, or a migration by its own id.
    pub fn get_operation(&self, id: &str) -> Option<OperationInfo> {
        if let Some(op) = self.shards.get_operation(id) {
            return Some(OperationInfo::Shard(op));
        }
        self.shards
            .migrations()
            .get(id)
            .map(OperationInfo::Migration)
    }

    pub fn cancel_operation(&self, id: &str) -> bool {
        self.shards.cancel_operation(id)
    }

    /// Wait until a shard operation reaches a terminal status.
    pub async fn wait_for_operation(&self, id: &str, timeout: Duration) -> Option<ShardOperation> {
        let poll = async {
            loop {
                match self.shards.get_operation(id) {
                    Some(op) if op.status.is_terminal() => return Some(op),
                    Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                    None => return None,
                }
            }
        };
        tokio::time::timeout(timeout, poll).await.ok().flatten()
    }

    /// Run a scheduled operation in the caller's task.
    pub async fn execute_operation(&self, id: &str) -> Result<ShardOperationStatus> {
        self.shards.execute_shard_operation(id).await
    }

    // ==================== Membership ====================

    /// Members with their current status.
    pub fn nodes(&self) -> Vec<Node> {
        let migrating: HashSet<NodeId> = self
            .shards
            .migrations()
            .list()
            .into_iter()
            .filter(|m| !m.status.is_terminal() && m.status != MigrationStatus::Pending)
            .flat_map(|m| [m.source_node_id, m.target_node_id])
            .collect();
        self.registry.set_migrating(migrating);
        self.registry.nodes()
    }

    pub fn status(&self) -> ClusterStatus {
        let raft = self.raft.status();
        ClusterStatus {
            node_id: self.node_id.clone(),
            is_leader: raft.role == Role::Leader,
            leader_id: raft.leader,
            term: raft.term,
            commit_index: raft.commit_index,
            last_applied: raft.last_applied,
            members: self.registry.member_ids(),
            shard_count: self.shards.ring().read().vnode_count(),
            key_count: self.storage.size(),
            active_migrations: self.shards.migrations().active_count(),
        }
    }

    /// Stop consensus, the server and background tasks.
    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
        let shutdown = self.server_shutdown.lock().take();
        if let Some(tx) = shutdown {
            let _ = tx.send(()).await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(node_id = %self.node_id, "Cluster node stopped");
    }
}

/// Track role and ownership changes published by consensus.
async fn consume_events<T: ClusterTransport>(
    mut events: mpsc::UnboundedReceiver<RaftEvent>,
    registry: Arc<NodeRegistry>,
    ring: Arc<RwLock<HashRing>>,
    transport: Arc<T>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RaftEvent::StateChanged { role, term, leader } => {
                transport.observe_local_term(term);
                registry.apply_raft_state(role, leader);
            }
            RaftEvent::Committed(entry) => {
                if matches!(
                    entry.command,
                    Command::MigrateShard { .. } | Command::UpdateMembership { .. }
                ) {
                    let owned = owned_shards(&ring.read());
                    registry.set_shards(owned);
                }
            }
        }
    }
}

/// Ping every peer periodically so the registry notices silent members.
async fn probe_peers<T: ClusterTransport>(
    peers: Vec<NodeId>,
    interval: Duration,
    registry: Arc<NodeRegistry>,
    transport: Arc<T>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for peer in &peers {
            match transport.call(peer, Message::Ping, None).await {
                Ok(Message::Pong(_)) => registry.mark_seen(peer),
                Ok(_) | Err(_) => registry.mark_offline(peer),
            }
        }
    }
}
