//! Multi-node consensus tests over the local network.
//!
//! These run bare Raft nodes with in-memory state machines, so failures
//! point at consensus rather than storage or sharding. The Raft log and hard
//! state are kept on disk so nodes can be crashed and restarted.

use crate::config::RaftConfig;
use crate::consensus::{RaftNode, RaftStorage, Role};
use crate::testing::network::LocalNetwork;
use crate::testing::utils::{node_ids, wait_for};
use crate::testing::{MemoryStateMachine, RaftHandler};
use crate::types::{Command, LogEntry, NodeId, Term};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use test_log::test;
use tokio::time::sleep;

struct RaftGroup {
    network: Arc<LocalNetwork>,
    ids: Vec<NodeId>,
    config: RaftConfig,
    nodes: BTreeMap<NodeId, (RaftNode, Arc<MemoryStateMachine>)>,
    dir: TempDir,
}

impl RaftGroup {
    fn spawn(count: usize, config: RaftConfig) -> Self {
        let mut group = Self {
            network: LocalNetwork::new(),
            ids: node_ids(count),
            config,
            nodes: BTreeMap::new(),
            dir: tempfile::tempdir().unwrap(),
        };
        for id in group.ids.clone() {
            group.start(&id);
        }
        group
    }

    /// Start a node from its data directory with an empty state machine, so
    /// everything it applies comes from its recovered log or its peers.
    fn start(&mut self, id: &str) {
        let storage = RaftStorage::open(self.dir.path().join(id), false).unwrap();
        let sm = Arc::new(MemoryStateMachine::default());
        let (raft, _events, _task) = RaftNode::spawn(
            id.to_string(),
            self.ids.clone(),
            self.config.clone(),
            storage,
            sm.clone(),
            Arc::new(self.network.transport(id)),
        );
        self.network
            .register(id, Arc::new(RaftHandler::new(raft.clone())));
        self.nodes.insert(id.to_string(), (raft, sm));
    }

    async fn crash(&mut self, id: &str) {
        self.network.unregister(id);
        if let Some((raft, _)) = self.nodes.remove(id) {
            raft.shutdown().await;
        }
    }

    fn raft(&self, id: &str) -> &RaftNode {
        &self.nodes[id].0
    }

    fn sm(&self, id: &str) -> &Arc<MemoryStateMachine> {
        &self.nodes[id].1
    }

    /// Wait until exactly one of `ids` leads and the others know it.
    async fn leader_among(&self, ids: &[NodeId], timeout: Duration) -> Option<NodeId> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let statuses: Vec<_> = ids.iter().map(|id| self.raft(id).status()).collect();
            let leaders: Vec<_> = statuses.iter().filter(|s| s.role == Role::Leader).collect();
            if let [leader] = leaders.as_slice() {
                let term = leader.term;
                if statuses
                    .iter()
                    .all(|s| s.leader.as_deref() == Some(leader.node_id.as_str()) && s.term == term)
                {
                    return Some(leader.node_id.clone());
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
        None
    }

    async fn leader(&self, timeout: Duration) -> Option<NodeId> {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        self.leader_among(&ids, timeout).await
    }

    fn keys_applied(&self, id: &str) -> Vec<String> {
        self.sm(id)
            .applied()
            .into_iter()
            .filter_map(|e| match e.command {
                Command::Set { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }

    async fn shutdown(self) {
        for (raft, _) in self.nodes.values() {
            raft.shutdown().await;
        }
    }
}

/// Record every (term, leader) pair any node publishes.
fn watch_leaders(group: &RaftGroup) -> Arc<Mutex<HashMap<Term, HashSet<NodeId>>>> {
    let seen = Arc::new(Mutex::new(HashMap::<Term, HashSet<NodeId>>::new()));
    for (raft, _) in group.nodes.values() {
        let mut rx = raft.subscribe();
        let seen = seen.clone();
        tokio::spawn(async move {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if status.role == Role::Leader {
                        seen.lock()
                            .entry(status.term)
                            .or_default()
                            .insert(status.node_id.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }
    seen
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_three_nodes_elect_single_leader() {
    let group = RaftGroup::spawn(3, RaftConfig::default());
    let leader = group.leader(Duration::from_secs(2)).await.expect("leader");

    let term = group.raft(&leader).term();
    for id in group.nodes.keys() {
        assert_eq!(group.raft(id).term(), term);
    }
    group.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_at_most_one_leader_per_term_under_churn() {
    let group = RaftGroup::spawn(5, RaftConfig::default());
    let seen = watch_leaders(&group);

    // Repeatedly cut off whoever leads, forcing fresh elections.
    for _ in 0..4 {
        let Some(leader) = group.leader(Duration::from_secs(3)).await else {
            continue;
        };
        group.network.isolate(leader.clone());
        sleep(Duration::from_millis(400)).await;
        group.network.heal(&leader);
    }
    sleep(Duration::from_millis(300)).await;

    let seen = seen.lock();
    assert!(seen.len() >= 2, "expected several terms with leaders: {seen:?}");
    for (term, leaders) in seen.iter() {
        assert_eq!(leaders.len(), 1, "term {term} had leaders {leaders:?}");
    }
    drop(seen);
    group.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_entries_replicate_in_order() {
    let group = RaftGroup::spawn(3, RaftConfig::default());
    let leader = group.leader(Duration::from_secs(2)).await.expect("leader");

    let mut indexes = Vec::new();
    for i in 0..10 {
        let entry = group
            .raft(&leader)
            .propose(Command::set(format!("k{i}"), "v"))
            .await
            .unwrap();
        indexes.push(entry.index);
    }
    assert!(indexes.windows(2).all(|w| w[1] == w[0] + 1));

    let expected: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
    for id in group.nodes.keys() {
        assert!(
            wait_for(
                || group.keys_applied(id) == expected,
                Duration::from_secs(2),
                Duration::from_millis(10)
            )
            .await,
            "{id} applied {:?}",
            group.keys_applied(id)
        );
    }
    let reference: Vec<LogEntry> = group.sm(&leader).applied();
    for id in group.nodes.keys() {
        assert_eq!(group.sm(id).applied(), reference);
    }
    group.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_failover_keeps_committed_entries() {
    let mut group = RaftGroup::spawn(3, RaftConfig::default());
    let leader = group.leader(Duration::from_secs(2)).await.expect("leader");
    for i in 0..5 {
        group
            .raft(&leader)
            .propose(Command::set(format!("before-{i}"), "v"))
            .await
            .unwrap();
    }

    group.crash(&leader).await;

    let rest: Vec<NodeId> = group.nodes.keys().cloned().collect();
    let new_leader = group
        .leader_among(&rest, Duration::from_secs(3))
        .await
        .expect("new leader");
    assert_ne!(new_leader, leader);

    group
        .raft(&new_leader)
        .propose(Command::set("after", "v"))
        .await
        .unwrap();
    let mut expected: Vec<String> = (0..5).map(|i| format!("before-{i}")).collect();
    expected.push("after".into());
    for id in &rest {
        assert!(
            wait_for(
                || group.keys_applied(id) == expected,
                Duration::from_secs(2),
                Duration::from_millis(10)
            )
            .await,
            "{id} applied {:?}",
            group.keys_applied(id)
        );
    }
    group.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_minority_leader_cannot_commit() {
    let config = RaftConfig::default().with_propose_timeout(Duration::from_millis(500));
    let group = RaftGroup::spawn(3, config);
    let leader = group.leader(Duration::from_secs(2)).await.expect("leader");
    group
        .raft(&leader)
        .propose(Command::set("committed", "v"))
        .await
        .unwrap();

    group.network.isolate(leader.clone());
    let result = group.raft(&leader).propose(Command::set("lost", "v")).await;
    assert!(result.is_err());
    assert!(!group.keys_applied(&leader).contains(&"lost".to_string()));

    let rest: Vec<NodeId> = group.nodes.keys().filter(|id| **id != leader).cloned().collect();
    let new_leader = group
        .leader_among(&rest, Duration::from_secs(3))
        .await
        .expect("majority elects");
    group
        .raft(&new_leader)
        .propose(Command::set("majority", "v"))
        .await
        .unwrap();

    group.network.heal(&leader);
    let expected = vec!["committed".to_string(), "majority".to_string()];
    for id in group.nodes.keys() {
        assert!(
            wait_for(
                || group.keys_applied(id) == expected,
                Duration::from_secs(3),
                Duration::from_millis(10)
            )
            .await,
            "{id} applied {:?}",
            group.keys_applied(id)
        );
    }
    assert_ne!(group.raft(&leader).status().role, Role::Leader);
    group.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let group = RaftGroup::spawn(3, RaftConfig::default());
    let leader = group.leader(Duration::from_secs(2)).await.expect("leader");
    let lagging = group
        .nodes
        .keys()
        .find(|id| **id != leader)
        .cloned()
        .unwrap();

    group.network.isolate(lagging.clone());
    for i in 0..20 {
        group
            .raft(&leader)
            .propose(Command::set(format!("k{i}"), "v"))
            .await
            .unwrap();
    }
    // Compaction happens on the next apply after a checkpoint.
    group.sm(&leader).checkpoint();
    group
        .raft(&leader)
        .propose(Command::set("k20", "v"))
        .await
        .unwrap();

    group.network.heal(&lagging);
    let leader_sm = group.sm(&leader).clone();
    let follower_sm = group.sm(&lagging).clone();
    assert!(
        wait_for(
            || follower_sm.applied() == leader_sm.applied(),
            Duration::from_secs(3),
            Duration::from_millis(20)
        )
        .await,
        "follower applied {} of {} entries",
        follower_sm.applied().len(),
        leader_sm.applied().len()
    );
    group.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_committed_entry_survives_follower_restart() {
    let mut group = RaftGroup::spawn(3, RaftConfig::default());
    let leader = group.leader(Duration::from_secs(2)).await.expect("leader");
    let followers: Vec<NodeId> = group.ids.iter().filter(|id| **id != leader).cloned().collect();
    let (acked, lagging) = (followers[0].clone(), followers[1].clone());

    // Commit with the leader and one follower only.
    group.network.isolate(lagging.clone());
    group
        .raft(&leader)
        .propose(Command::set("k", "v"))
        .await
        .unwrap();

    // The only other holder of the entry restarts before the old leader
    // can tell anyone it committed.
    group.network.isolate(leader.clone());
    group.crash(&acked).await;
    group.start(&acked);
    group.network.heal(&lagging);

    let pair = vec![acked.clone(), lagging.clone()];
    let new_leader = group
        .leader_among(&pair, Duration::from_secs(3))
        .await
        .expect("new leader");
    assert_eq!(new_leader, acked, "only a node holding the entry can win");
    for id in &pair {
        assert!(
            wait_for(
                || group.keys_applied(id) == ["k".to_string()],
                Duration::from_secs(3),
                Duration::from_millis(10)
            )
            .await,
            "{id} applied {:?}",
            group.keys_applied(id)
        );
    }
    group.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_whole_group_restart_keeps_log() {
    let mut group = RaftGroup::spawn(3, RaftConfig::default());
    let leader = group.leader(Duration::from_secs(2)).await.expect("leader");
    for i in 0..5 {
        group
            .raft(&leader)
            .propose(Command::set(format!("k{i}"), "v"))
            .await
            .unwrap();
    }
    let term = group.raft(&leader).term();

    for id in group.ids.clone() {
        group.crash(&id).await;
    }
    for id in group.ids.clone() {
        group.start(&id);
    }

    let leader = group.leader(Duration::from_secs(3)).await.expect("leader after restart");
    assert!(group.raft(&leader).term() > term);
    let expected: Vec<String> = (0..5).map(|i| format!("k{i}")).collect();
    for id in group.ids.clone() {
        assert!(
            wait_for(
                || group.keys_applied(&id) == expected,
                Duration::from_secs(3),
                Duration::from_millis(10)
            )
            .await,
            "{id} applied {:?}",
            group.keys_applied(&id)
        );
    }
    group.shutdown().await;
}
