//! Outbound TCP transport for Raft and migration RPCs.

use crate::config::TransportConfig;
use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, VoteRequest, VoteResponse,
};
use crate::error::{NetworkError, Result};
use crate::migration::{ShardDataStore, StoreResolver};
use crate::network::rpc::{read_frame, write_frame, Envelope, Message, PongResponse};
use crate::partitioning::HashRange;
use crate::storage::{RangeStats, StorageEntry};
use crate::types::{NodeId, Term};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Idle connections kept per peer.
const MAX_IDLE_PER_PEER: usize = 4;

struct Inner {
    node_id: NodeId,
    config: TransportConfig,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
    idle: Mutex<HashMap<NodeId, Vec<TcpStream>>>,
    term: AtomicU64,
}

/// TCP client side of the wire protocol.
///
/// Each call checks out an idle connection (or opens one), performs a single
/// request/response exchange under the request timeout and returns the
/// connection to the pool. A failed exchange drops the connection and is
/// reported to the caller; nothing is retried here.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    pub fn new(node_id: impl Into<NodeId>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id: node_id.into(),
                config,
                peers: RwLock::new(HashMap::new()),
                idle: Mutex::new(HashMap::new()),
                term: AtomicU64::new(0),
            }),
        }
    }

    /// Register a peer address, replacing any previous one.
    pub fn add_peer(&self, node_id: impl Into<NodeId>, addr: SocketAddr) {
        let node_id = node_id.into();
        let previous = self.inner.peers.write().insert(node_id.clone(), addr);
        if previous.is_some_and(|old| old != addr) {
            self.inner.idle.lock().remove(&node_id);
        }
    }

    pub fn remove_peer(&self, node_id: &str) {
        self.inner.peers.write().remove(node_id);
        self.inner.idle.lock().remove(node_id);
    }

    pub fn peer_addr(&self, node_id: &str) -> Option<SocketAddr> {
        self.inner.peers.read().get(node_id).copied()
    }

    /// Term stamped on data-plane envelopes.
    pub fn set_term(&self, term: Term) {
        self.inner.term.fetch_max(term, Ordering::Relaxed);
    }

    /// Ask a peer who it is and whom it follows.
    pub async fn ping(&self, target: &str) -> Result<PongResponse> {
        match self.call(target, Message::Ping, None).await? {
            Message::Pong(pong) => Ok(pong),
            other => Err(unexpected(other)),
        }
    }

    async fn checkout(&self, target: &str, addr: SocketAddr) -> Result<TcpStream> {
        if let Some(stream) = self.inner.idle.lock().get_mut(target).and_then(Vec::pop) {
            return Ok(stream);
        }
        let stream = tokio::time::timeout(self.inner.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timed out".into(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        debug!(peer = %target, addr = %addr, "Connected");
        Ok(stream)
    }

    fn checkin(&self, target: &str, stream: TcpStream) {
        let mut idle = self.inner.idle.lock();
        let pool = idle.entry(target.to_string()).or_default();
        if pool.len() < MAX_IDLE_PER_PEER {
            pool.push(stream);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }
}

/// Request/response exchange with a peer.
///
/// Every implementation is also a [`RaftTransport`].
#[async_trait::async_trait]
pub trait RpcClient: Send + Sync + 'static {
    /// Send `message` to `target` and wait for the reply. `term` overrides the
    /// term stamped on the envelope.
    async fn call(&self, target: &str, message: Message, term: Option<Term>) -> Result<Message>;
}

pub(crate) fn unexpected(message: Message) -> crate::Error {
    NetworkError::UnexpectedResponse(message.kind().to_string()).into()
}

#[async_trait::async_trait]
impl RpcClient for TcpTransport {
    async fn call(&self, target: &str, message: Message, term: Option<Term>) -> Result<Message> {
        let addr = self
            .peer_addr(target)
            .ok_or_else(|| NetworkError::UnknownPeer(target.to_string()))?;
        let term = term.unwrap_or_else(|| self.inner.term.load(Ordering::Relaxed));
        let kind = message.kind();
        let envelope = Envelope::new(self.inner.node_id.clone(), term, message);
        let max = self.inner.config.max_frame_size;
        let timeout = match envelope.message {
            Message::InstallSnapshot(_) | Message::Ingest(_) => self.inner.config.request_timeout * 10,
            _ => self.inner.config.request_timeout,
        };

        let exchange = async {
            let mut stream = self.checkout(target, addr).await?;
            write_frame(&mut stream, &envelope, max).await?;
            let reply = read_frame(&mut stream, max)
                .await?
                .ok_or(NetworkError::ConnectionClosed)?;
            Ok::<_, crate::Error>((stream, reply))
        };

        let (stream, reply) = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                trace!(peer = %target, kind, error = %e, "RPC failed");
                return Err(e);
            }
            Err(_) => {
                trace!(peer = %target, kind, "RPC timed out");
                return Err(NetworkError::Unreachable(target.to_string()).into());
            }
        };
        self.checkin(target, stream);
        self.set_term(reply.term);

        match reply.message {
            Message::Error(reason) => Err(NetworkError::Remote(reason).into()),
            message => Ok(message),
        }
    }
}

#[async_trait::async_trait]
impl<C: RpcClient> RaftTransport for C {
    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let term = request.term;
        match self.call(target, Message::AppendEntries(request), Some(term)).await? {
            Message::AppendEntriesResponse(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse> {
        let term = request.term;
        match self.call(target, Message::RequestVote(request), Some(term)).await? {
            Message::VoteResponse(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &self,
        target: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let term = request.term;
        match self.call(target, Message::InstallSnapshot(request), Some(term)).await? {
            Message::InstallSnapshotResponse(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }
}

impl StoreResolver for TcpTransport {
    fn store(&self, node_id: &str) -> Option<Arc<dyn ShardDataStore>> {
        self.peer_addr(node_id)?;
        Some(Arc::new(RemoteShardStore::new(self.clone(), node_id)))
    }
}

/// [`ShardDataStore`] of a remote node, reached through an [`RpcClient`].
#[derive(Clone)]
pub struct RemoteShardStore<C> {
    client: C,
    node_id: NodeId,
}

impl<C: RpcClient> RemoteShardStore<C> {
    pub fn new(client: C, node_id: impl Into<NodeId>) -> Self {
        Self {
            client,
            node_id: node_id.into(),
        }
    }

    async fn call(&self, message: Message) -> Result<Message> {
        self.client.call(&self.node_id, message, None).await
    }

    async fn ack(&self, message: Message) -> Result<()> {
        match self.call(message).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait::async_trait]
impl<C: RpcClient> ShardDataStore for RemoteShardStore<C> {
    async fn range_stats(&self, range: HashRange) -> Result<RangeStats> {
        match self.call(Message::ShardStats { range }).await? {
            Message::ShardStatsResponse(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    async fn reserve(&self, bytes: u64) -> Result<()> {
        self.ack(Message::Reserve { bytes }).await
    }

    async fn release(&self, bytes: u64) -> Result<()> {
        self.ack(Message::Release { bytes }).await
    }

    async fn read_chunk(
        &self,
        range: HashRange,
        after: Option<String>,
        max_bytes: u64,
    ) -> Result<Vec<StorageEntry>> {
        match self
            .call(Message::ReadChunk {
                range,
                after,
                max_bytes,
            })
            .await?
        {
            Message::Chunk(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    async fn ingest(&self, entries: Vec<StorageEntry>) -> Result<u64> {
        match self.call(Message::Ingest(entries)).await? {
            Message::Ingested { bytes } => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    async fn checksum(&self, range: HashRange) -> Result<u32> {
        match self.call(Message::Checksum { range }).await? {
            Message::ChecksumResponse { checksum } => Ok(checksum),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_range(&self, range: HashRange) -> Result<u64> {
        match self.call(Message::DeleteRange { range }).await? {
            Message::Deleted { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    async fn persist(&self) -> Result<()> {
        self.ack(Message::Persist).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::network::server::{MessageHandler, NetworkServer};

    struct FixedHandler;

    #[async_trait::async_trait]
    impl MessageHandler for FixedHandler {
        async fn handle(&self, envelope: Envelope) -> Option<Envelope> {
            let reply = match envelope.message {
                Message::RequestVote(req) => Message::VoteResponse(VoteResponse {
                    term: req.term,
                    vote_granted: req.candidate_id == "node-1",
                }),
                Message::Checksum { .. } => Message::ChecksumResponse { checksum: 0xabcd },
                Message::Reserve { bytes } if bytes > 100 => Message::Error("capacity exceeded".into()),
                Message::Reserve { .. } => Message::Ack,
                Message::Ping => Message::Pong(PongResponse {
                    node_id: "node-2".into(),
                    leader_id: Some("node-1".into()),
                }),
                _ => Message::Ack,
            };
            Some(Envelope::new("node-2", 9, reply))
        }
    }

    async fn serve() -> (SocketAddr, tokio::sync::mpsc::Sender<()>) {
        let (server, shutdown) = NetworkServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "node-2".into(),
            Arc::new(FixedHandler),
            1 << 20,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_raft_and_store_calls() {
        let (addr, _shutdown) = serve().await;
        let transport = TcpTransport::new("node-1", TransportConfig::default());
        transport.add_peer("node-2", addr);

        let vote = transport
            .request_vote(
                "node-2",
                VoteRequest {
                    term: 3,
                    candidate_id: "node-1".into(),
                    last_log_index: None,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap();
        assert!(vote.vote_granted);
        assert_eq!(vote.term, 3);

        let store = transport.store("node-2").unwrap();
        assert_eq!(store.checksum(HashRange::full()).await.unwrap(), 0xabcd);
        store.reserve(10).await.unwrap();
        let err = store.reserve(1000).await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::Remote(_))));
        // Responses raise the stamped term.
        assert_eq!(transport.inner.term.load(Ordering::Relaxed), 9);

        let pong = transport.ping("node-2").await.unwrap();
        assert_eq!(pong.leader_id.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable_peers() {
        let transport = TcpTransport::new(
            "node-1",
            TransportConfig::default().with_connect_timeout(Duration::from_millis(100)),
        );
        assert!(transport.store("ghost").is_none());
        let err = transport.ping("ghost").await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::UnknownPeer(_))));

        // Bind then drop so nothing listens on the port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        transport.add_peer("gone", addr);
        assert!(transport.ping("gone").await.is_err());
    }
}
