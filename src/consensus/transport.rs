//! Outbound RPC seam between the consensus loop and the network.

use crate::consensus::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::error::Result;
use async_trait::async_trait;

/// Sends Raft RPCs to peers.
///
/// Implementations should fail fast when a peer is unreachable; the caller
/// bounds every call with the configured RPC timeout and retries on the next
/// timer tick.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse>;

    async fn install_snapshot(
        &self,
        target: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
