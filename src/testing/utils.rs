use crate::config::PeerConfig;
use crate::types::NodeId;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Allocate OS-assigned ports by briefly binding to port 0.
pub(crate) async fn allocate_os_ports(node_ids: &[NodeId]) -> Vec<PeerConfig> {
    let mut peers = Vec::with_capacity(node_ids.len());
    for node_id in node_ids {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener); // Release the port immediately
        peers.push(PeerConfig::new(node_id.clone(), "127.0.0.1", port));
    }
    peers
}

/// `node-1` ... `node-n`.
pub(crate) fn node_ids(count: usize) -> Vec<NodeId> {
    (1..=count).map(|i| format!("node-{i}")).collect()
}

/// Wait for a condition with timeout
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}

