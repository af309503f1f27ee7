//! In-process network with link failure injection.

use crate::cluster::ClusterTransport;
use crate::error::{NetworkError, Result};
use crate::migration::{ShardDataStore, StoreResolver};
use crate::network::rpc::{decode_envelope, encode_envelope};
use crate::network::{Envelope, Message, MessageHandler, RemoteShardStore, RpcClient};
use crate::types::{NodeId, Term};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Routes envelopes between handlers registered in this process.
///
/// Links are cut per direction; an isolated node can neither send nor
/// receive. Unregistered nodes look like crashed ones.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    isolated: RwLock<HashSet<NodeId>>,
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach (or replace) the handler serving `node_id`.
    pub fn register(&self, node_id: impl Into<NodeId>, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(node_id.into(), handler);
    }

    pub fn unregister(&self, node_id: &str) {
        self.handlers.write().remove(node_id);
    }

    pub fn is_registered(&self, node_id: &str) -> bool {
        self.handlers.read().contains_key(node_id)
    }

    /// Cut every link to and from `node_id`.
    pub fn isolate(&self, node_id: impl Into<NodeId>) {
        self.isolated.write().insert(node_id.into());
    }

    /// Cut every link between the two sides, in both directions.
    pub fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        let mut cut = self.cut.write();
        for a in side_a {
            for b in side_b {
                cut.insert((a.clone(), b.clone()));
                cut.insert((b.clone(), a.clone()));
            }
        }
    }

    /// Restore the links of an isolated node.
    pub fn heal(&self, node_id: &str) {
        self.isolated.write().remove(node_id);
        self.cut
            .write()
            .retain(|(from, to)| from != node_id && to != node_id);
    }

    pub fn heal_all(&self) {
        self.isolated.write().clear();
        self.cut.write().clear();
    }

    /// Whether an envelope from `from` reaches `to`.
    pub fn connected(&self, from: &str, to: &str) -> bool {
        {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return false;
            }
        }
        !self.cut.read().contains(&(from.to_string(), to.to_string()))
    }

    /// Client side for `node_id`.
    pub fn transport(self: &Arc<Self>, node_id: impl Into<NodeId>) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            node_id: node_id.into(),
            term: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn deliver(&self, envelope: Envelope, to: &str) -> Result<Envelope> {
        let unreachable = || NetworkError::Unreachable(to.to_string());
        if !self.connected(&envelope.from, to) {
            return Err(unreachable().into());
        }
        let handler = self.handlers.read().get(to).cloned().ok_or_else(unreachable)?;

        let from = envelope.from.clone();
        let request = decode_envelope(&encode_envelope(&envelope)?)?;
        let reply = handler
            .handle(request)
            .await
            .ok_or(NetworkError::ConnectionClosed)?;

        // The reply travels the reverse link, which may have been cut meanwhile.
        if !self.connected(to, &from) {
            return Err(unreachable().into());
        }
        decode_envelope(&encode_envelope(&reply)?)
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    node_id: NodeId,
    term: Arc<AtomicU64>,
}

impl LocalTransport {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait::async_trait]
impl RpcClient for LocalTransport {
    async fn call(&self, target: &str, message: Message, term: Option<Term>) -> Result<Message> {
        let term = term.unwrap_or_else(|| self.term.load(Ordering::Relaxed));
        let kind = message.kind();
        let envelope = Envelope::new(self.node_id.clone(), term, message);
        let reply = match self.network.deliver(envelope, target).await {
            Ok(reply) => reply,
            Err(e) => {
                trace!(from = %self.node_id, peer = %target, kind, error = %e, "Local RPC failed");
                return Err(e);
            }
        };
        self.term.fetch_max(reply.term, Ordering::Relaxed);
        match reply.message {
            Message::Error(reason) => Err(NetworkError::Remote(reason).into()),
            message => Ok(message),
        }
    }
}

impl StoreResolver for LocalTransport {
    fn store(&self, node_id: &str) -> Option<Arc<dyn ShardDataStore>> {
        if !self.network.is_registered(node_id) {
            return None;
        }
        Some(Arc::new(RemoteShardStore::new(self.clone(), node_id)))
    }
}

impl ClusterTransport for LocalTransport {
    fn observe_local_term(&self, term: Term) {
        self.term.fetch_max(term, Ordering::Relaxed);
    }
}
