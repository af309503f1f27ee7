//! End-to-end tests of cluster nodes: replication, routing, shard
//! operations and recovery.

use crate::cluster::{ClusterCoordinator, NodeStatus};
use crate::config::{ClusterConfig, ShardingConfig, TransportConfig};
use crate::error::{Error, RaftError};
use crate::network::TcpTransport;
use crate::sharding::ShardOperationStatus;
use crate::testing::utils::{allocate_os_ports, node_ids, wait_for};
use crate::testing::TestCluster;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

const SETTLE: Duration = Duration::from_secs(3);
const POLL: Duration = Duration::from_millis(20);

fn value(v: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(v.as_bytes()))
}

fn single_replica(config: ClusterConfig) -> ClusterConfig {
    config.with_sharding_config(
        ShardingConfig::default()
            .with_vnodes_per_weight(16)
            .with_replication_factor(1),
    )
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_three_node_cluster_replicates_writes() {
    let cluster = TestCluster::start(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("leader elected");
    let leader = cluster.node(&leader_id);

    let entry = leader.set("k", "v", None).await.unwrap();
    assert_eq!(entry.index, 0);
    assert_eq!(leader.get("k"), value("v"));

    for node in cluster.running() {
        assert!(
            wait_for(|| node.get("k") == value("v"), SETTLE, POLL).await,
            "{} never saw the write",
            node.node_id()
        );
    }

    leader.delete("k").await.unwrap();
    for node in cluster.running() {
        assert!(wait_for(|| !node.has("k"), SETTLE, POLL).await);
    }

    let status = leader.status();
    assert!(status.is_leader);
    assert_eq!(status.members.len(), 3);
    assert_eq!(status.commit_index, Some(1));
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_followers_reject_writes_with_leader_hint() {
    let cluster = TestCluster::start(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("leader elected");

    for follower in cluster.others(&leader_id) {
        match follower.set("k", "v", None).await {
            Err(Error::Raft(RaftError::NotLeader { leader })) => {
                assert_eq!(leader.as_deref(), Some(leader_id.as_str()));
            }
            other => panic!("expected NotLeader, got {other:?}"),
        }
        assert!(follower.delete("k").await.unwrap_err().is_not_leader());
        assert!(follower.split_shard("s0").unwrap_err().is_not_leader());
    }
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ttl_expiry_is_visible_on_every_replica() {
    let cluster = TestCluster::start(3).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(2)).await.unwrap();
    let leader = cluster.node(&leader_id);

    leader
        .set("short", "v", Some(Duration::from_millis(200)))
        .await
        .unwrap();
    leader.set("long", "v", None).await.unwrap();
    for node in cluster.running() {
        assert!(wait_for(|| node.has("long"), SETTLE, POLL).await);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    for node in cluster.running() {
        assert_eq!(node.get("short"), None);
        assert_eq!(node.get("long"), value("v"));
    }
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_migration_moves_key_to_target_node() {
    let cluster = TestCluster::start_with(3, single_replica).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(2)).await.unwrap();
    let leader = cluster.node(&leader_id);

    leader.set("user:42", "alice", None).await.unwrap();
    let owner = leader.route_key("user:42").unwrap();
    let target = cluster
        .ids()
        .into_iter()
        .find(|id| *id != owner)
        .unwrap();
    assert!(
        wait_for(|| cluster.node(&owner).has("user:42"), SETTLE, POLL).await,
        "owner {owner} never stored the key"
    );
    for node in cluster.others(&owner) {
        assert!(!node.has("user:42"));
    }

    let shard = leader
        .shard_manager()
        .shard_for_key("user:42")
        .expect("shard for key");
    let op_id = leader
        .schedule_migration(&shard.id, &owner, Some(&target))
        .unwrap();
    let op = leader
        .wait_for_operation(&op_id, Duration::from_secs(5))
        .await
        .expect("operation finished");
    assert_eq!(op.status, ShardOperationStatus::Completed, "{:?}", op.error);

    for node in cluster.running() {
        assert!(
            wait_for(|| node.route_key("user:42").as_deref() == Some(target.as_str()), SETTLE, POLL).await,
            "{} still routes to {:?}",
            node.node_id(),
            node.route_key("user:42")
        );
    }
    assert_eq!(cluster.node(&target).get("user:42"), value("alice"));
    assert!(!cluster.node(&owner).has("user:42"));

    // New writes land on the new owner only.
    leader.set("user:42", "bob", None).await.unwrap();
    assert!(wait_for(|| cluster.node(&target).get("user:42") == value("bob"), SETTLE, POLL).await);
    assert!(!cluster.node(&owner).has("user:42"));
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_moves_keep_every_replica_complete() {
    let cluster = TestCluster::start_with(4, |config| {
        config.with_sharding_config(
            ShardingConfig::default()
                .with_vnodes_per_weight(16)
                .with_replication_factor(2),
        )
    })
    .await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(2)).await.unwrap();
    let leader = cluster.node(&leader_id);

    let keys: Vec<String> = (0..60).map(|i| format!("user:{i}")).collect();
    for key in &keys {
        leader.set(key, "v", None).await.unwrap();
    }
    let placed = |key: &str| {
        let replicas = leader.replicas_for_key(key, 2);
        cluster
            .running()
            .into_iter()
            .all(|node| node.has(key) == replicas.iter().any(|r| r == node.node_id()))
    };
    for key in &keys {
        assert!(wait_for(|| placed(key), SETTLE, POLL).await, "{key} not replicated");
    }

    for key in keys.iter().step_by(20) {
        let shard = leader.shard_manager().shard_for_key(key).unwrap();
        let replicas = leader.replicas_for_key(key, 2);
        let target = cluster
            .ids()
            .into_iter()
            .find(|id| !replicas.contains(id))
            .unwrap();
        let op_id = leader
            .schedule_migration(&shard.id, &shard.node_id, Some(&target))
            .unwrap();
        let op = leader
            .wait_for_operation(&op_id, Duration::from_secs(5))
            .await
            .expect("operation finished");
        assert_eq!(op.status, ShardOperationStatus::Completed, "{:?}", op.error);
        assert_eq!(leader.route_key(key), Some(target));
    }

    for key in &keys {
        let replicas = leader.replicas_for_key(key, 2);
        assert!(placed(key), "{key} misplaced, replicas {replicas:?}");
        for id in &replicas {
            assert_eq!(cluster.node(id).get(key), value("v"), "{key} missing on {id}");
        }
    }
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_split_and_merge_reach_every_node() {
    let cluster = TestCluster::start_with(3, single_replica).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(2)).await.unwrap();
    let leader = cluster.node(&leader_id);
    let before = leader.shards().len();
    let shard = leader
        .shards()
        .into_iter()
        .max_by_key(|s| s.end_hash.wrapping_sub(s.start_hash))
        .unwrap();

    let split = leader.split_shard(&shard.id).unwrap();
    let op = leader.wait_for_operation(&split, SETTLE).await.unwrap();
    assert_eq!(op.status, ShardOperationStatus::Completed, "{:?}", op.error);
    for node in cluster.running() {
        assert!(wait_for(|| node.shards().len() == before + 1, SETTLE, POLL).await);
    }

    // The upper half keeps the original end; merging it with the lower half
    // removes the split point again.
    let upper = leader
        .shards()
        .into_iter()
        .find(|s| s.end_hash == shard.end_hash)
        .unwrap();
    assert_ne!(upper.start_hash, shard.start_hash);
    let merge = leader.merge_shard(&upper.id).unwrap();
    let op = leader.wait_for_operation(&merge, SETTLE).await.unwrap();
    assert_eq!(op.status, ShardOperationStatus::Completed, "{:?}", op.error);
    for node in cluster.running() {
        assert!(wait_for(|| node.shards().len() == before, SETTLE, POLL).await);
    }
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_new_leader_after_isolation_keeps_data() {
    let cluster = TestCluster::start(3).await;
    let old_leader = cluster.wait_for_leader(Duration::from_secs(2)).await.unwrap();
    cluster.node(&old_leader).set("a", "1", None).await.unwrap();

    cluster.isolate(&old_leader);
    let rest: Vec<_> = cluster
        .ids()
        .into_iter()
        .filter(|id| *id != old_leader)
        .collect();
    let new_leader = cluster
        .wait_for_leader_among(&rest, SETTLE)
        .await
        .expect("majority elects a leader");
    assert_ne!(new_leader, old_leader);
    cluster.node(&new_leader).set("b", "2", None).await.unwrap();

    cluster.heal(&old_leader);
    let old = cluster.node(&old_leader);
    assert!(wait_for(|| old.get("b") == value("2"), SETTLE, POLL).await);
    assert_eq!(old.get("a"), value("1"));
    assert!(!old.is_leader());
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_restart_recovers_from_wal() {
    let mut cluster = TestCluster::start(3).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(2)).await.unwrap();
    let mut last = 0;
    for i in 0..10 {
        last = cluster
            .node(&leader_id)
            .set(format!("k{i}"), format!("v{i}"), None)
            .await
            .unwrap()
            .index;
    }
    let term_before = cluster.node(&leader_id).status().term;

    // A follower restarts alone and catches up.
    let follower = cluster.others(&leader_id)[0].node_id().to_string();
    cluster.crash(&follower).await;
    cluster.node(&leader_id).set("while-down", "x", None).await.unwrap();
    cluster.restart(&follower).await;
    let node = cluster.node(&follower);
    assert!(wait_for(|| node.get("while-down") == value("x"), SETTLE, POLL).await);
    assert_eq!(node.get("k9"), value("v9"));

    for node in cluster.running() {
        assert!(wait_for(|| node.size() == 11, SETTLE, POLL).await);
    }

    // The whole cluster restarts from disk.
    for id in cluster.ids() {
        cluster.crash(&id).await;
    }
    for id in cluster.ids() {
        cluster.restart(&id).await;
    }
    for node in cluster.running() {
        assert_eq!(node.size(), 11, "{} lost data", node.node_id());
        assert_eq!(node.get("k3"), value("v3"));
    }
    let leader_id = cluster.wait_for_leader(SETTLE).await.expect("leader after restart");
    let leader = cluster.node(&leader_id);
    assert!(leader.status().term > term_before);
    let entry = leader.set("after-restart", "y", None).await.unwrap();
    assert!(entry.index > last + 1);
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_crashed_member_reported_offline() {
    let mut cluster = TestCluster::start(3).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(2)).await.unwrap();
    let follower = cluster.others(&leader_id)[0].node_id().to_string();

    let status_of = |cluster: &TestCluster, id: &str| {
        cluster
            .node(&leader_id)
            .nodes()
            .into_iter()
            .find(|n| n.id == id)
            .map(|n| n.status)
    };
    assert_eq!(status_of(&cluster, &leader_id), Some(NodeStatus::Leader));

    cluster.crash(&follower).await;
    assert!(
        wait_for(
            || status_of(&cluster, &follower) == Some(NodeStatus::Offline),
            SETTLE,
            POLL
        )
        .await
    );
    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_tcp_cluster_replicates_writes() {
    let dir = tempfile::tempdir().unwrap();
    let peers = allocate_os_ports(&node_ids(3)).await;

    let mut nodes: Vec<Arc<ClusterCoordinator>> = Vec::new();
    for peer in &peers {
        let transport = TcpTransport::new(peer.id.clone(), TransportConfig::default());
        for other in peers.iter().filter(|p| p.id != peer.id) {
            transport.add_peer(other.id.clone(), other.socket_addr().unwrap());
        }
        let config = ClusterConfig::new(peer.id.clone(), dir.path().join(&peer.id))
            .with_peers(peers.clone())
            .with_listen_addr(peer.socket_addr().unwrap());
        nodes.push(
            ClusterCoordinator::start(config, Arc::new(transport))
                .await
                .unwrap(),
        );
    }

    assert!(wait_for(|| nodes.iter().any(|n| n.is_leader()), SETTLE, POLL).await);
    let leader = nodes.iter().find(|n| n.is_leader()).unwrap();
    assert!(leader.local_addr().is_some());
    leader.set("tcp", "works", None).await.unwrap();
    for node in &nodes {
        assert!(
            wait_for(|| node.get("tcp") == value("works"), SETTLE, POLL).await,
            "{} never saw the write",
            node.node_id()
        );
    }
    for node in &nodes {
        node.shutdown().await;
    }
}
