//! Serves inbound RPCs for a cluster node.

use crate::cluster::membership::NodeRegistry;
use crate::consensus::RaftNode;
use crate::error::Result;
use crate::migration::ShardDataStore;
use crate::network::{Envelope, Message, MessageHandler, PongResponse};
use crate::storage::StorageEngine;
use crate::types::NodeId;
use std::sync::Arc;
use tracing::{debug, warn};

/// Dispatches Raft RPCs to the consensus loop and data-plane RPCs to storage.
pub struct ClusterHandler {
    node_id: NodeId,
    raft: RaftNode,
    storage: Arc<StorageEngine>,
    registry: Arc<NodeRegistry>,
}

impl ClusterHandler {
    pub fn new(
        node_id: impl Into<NodeId>,
        raft: RaftNode,
        storage: Arc<StorageEngine>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            raft,
            storage,
            registry,
        }
    }

    async fn dispatch(&self, message: Message) -> Result<Message> {
        let store: &dyn ShardDataStore = self.storage.as_ref();
        let reply = match message {
            Message::AppendEntries(request) => {
                Message::AppendEntriesResponse(self.raft.handle_append_entries(request).await?)
            }
            Message::RequestVote(request) => {
                Message::VoteResponse(self.raft.handle_request_vote(request).await?)
            }
            Message::InstallSnapshot(request) => {
                Message::InstallSnapshotResponse(self.raft.handle_install_snapshot(request).await?)
            }
            Message::ShardStats { range } => Message::ShardStatsResponse(store.range_stats(range).await?),
            Message::Reserve { bytes } => {
                store.reserve(bytes).await?;
                Message::Ack
            }
            Message::Release { bytes } => {
                store.release(bytes).await?;
                Message::Ack
            }
            Message::ReadChunk {
                range,
                after,
                max_bytes,
            } => Message::Chunk(store.read_chunk(range, after, max_bytes).await?),
            Message::Ingest(entries) => Message::Ingested {
                bytes: store.ingest(entries).await?,
            },
            Message::Checksum { range } => Message::ChecksumResponse {
                checksum: store.checksum(range).await?,
            },
            Message::DeleteRange { range } => Message::Deleted {
                count: store.delete_range(range).await?,
            },
            Message::Persist => {
                store.persist().await?;
                Message::Ack
            }
            Message::Ping => Message::Pong(PongResponse {
                node_id: self.node_id.clone(),
                leader_id: self.raft.leader_id(),
            }),
            other => Message::Error(format!("{} is not a request", other.kind())),
        };
        Ok(reply)
    }
}

#[async_trait::async_trait]
impl MessageHandler for ClusterHandler {
    async fn handle(&self, envelope: Envelope) -> Option<Envelope> {
        self.registry.mark_seen(&envelope.from);
        self.raft.observe_term(envelope.term);

        let kind = envelope.message.kind();
        let reply = match self.dispatch(envelope.message).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(kind, "append_entries" | "request_vote" | "install_snapshot") {
                    debug!(node_id = %self.node_id, from = %envelope.from, kind, error = %e, "Raft RPC failed");
                } else {
                    warn!(node_id = %self.node_id, from = %envelope.from, kind, error = %e, "Request failed");
                }
                Message::Error(e.to_string())
            }
        };
        Some(Envelope::new(self.node_id.clone(), self.raft.term(), reply))
    }
}
