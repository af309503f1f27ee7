//! Wire messages exchanged between nodes.
//!
//! Each frame is a 4-byte big-endian length followed by a bincode-encoded
//! [`Envelope`]. Every envelope carries the sender's term so any node can
//! notice it has fallen behind, whatever the message kind.

use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::error::{NetworkError, Result};
use crate::partitioning::HashRange;
use crate::storage::{RangeStats, StorageEntry};
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header size of a frame.
pub const FRAME_HEADER: usize = 4;

/// A message with its sender and the sender's current term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub term: Term,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: impl Into<NodeId>, term: Term, message: Message) -> Self {
        Self {
            from: from.into(),
            term,
            message,
        }
    }
}

/// Every request and response that crosses the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(VoteRequest),
    VoteResponse(VoteResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),

    /// Key count and size of a range.
    ShardStats { range: HashRange },
    ShardStatsResponse(RangeStats),

    /// Reserve room for incoming migration data.
    Reserve { bytes: u64 },
    /// Return a reservation.
    Release { bytes: u64 },

    /// Entries of a range after `after`, about `max_bytes` worth.
    ReadChunk {
        range: HashRange,
        after: Option<String>,
        max_bytes: u64,
    },
    Chunk(Vec<StorageEntry>),

    /// Store migrated entries.
    Ingest(Vec<StorageEntry>),
    Ingested { bytes: u64 },

    Checksum { range: HashRange },
    ChecksumResponse { checksum: u32 },

    DeleteRange { range: HashRange },
    Deleted { count: u64 },

    /// Snapshot storage so migrated data survives WAL truncation.
    Persist,

    /// Empty success reply.
    Ack,

    /// Liveness probe.
    Ping,
    Pong(PongResponse),

    /// The request failed on the remote side.
    Error(String),
}

impl Message {
    /// Variant name used in logs and unexpected-response errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResponse(_) => "append_entries_response",
            Message::RequestVote(_) => "request_vote",
            Message::VoteResponse(_) => "vote_response",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::InstallSnapshotResponse(_) => "install_snapshot_response",
            Message::ShardStats { .. } => "shard_stats",
            Message::ShardStatsResponse(_) => "shard_stats_response",
            Message::Reserve { .. } => "reserve",
            Message::Release { .. } => "release",
            Message::ReadChunk { .. } => "read_chunk",
            Message::Chunk(_) => "chunk",
            Message::Ingest(_) => "ingest",
            Message::Ingested { .. } => "ingested",
            Message::Checksum { .. } => "checksum",
            Message::ChecksumResponse { .. } => "checksum_response",
            Message::DeleteRange { .. } => "delete_range",
            Message::Deleted { .. } => "deleted",
            Message::Persist => "persist",
            Message::Ack => "ack",
            Message::Ping => "ping",
            Message::Pong(_) => "pong",
            Message::Error(_) => "error",
        }
    }
}

/// Reply to a ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongResponse {
    pub node_id: NodeId,
    pub leader_id: Option<NodeId>,
}

/// Encode an envelope to bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

/// Decode an envelope from bytes.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
    Ok(bincode::deserialize(data)?)
}

/// Encode an envelope with its length prefix, refusing frames above `max_frame_size`.
pub fn frame_envelope(envelope: &Envelope, max_frame_size: usize) -> Result<Vec<u8>> {
    let data = encode_envelope(envelope)?;
    if data.len() > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: data.len(),
            max: max_frame_size,
        }
        .into());
    }

    let mut framed = Vec::with_capacity(FRAME_HEADER + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

/// Read one frame. Returns `None` when the peer closed the connection cleanly.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; FRAME_HEADER];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        }
        .into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(NetworkError::Io)?;
    decode_envelope(&data).map(Some)
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_envelope(envelope, max_frame_size)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bytes::Bytes;

    fn append() -> Envelope {
        Envelope::new(
            "node-1",
            4,
            Message::AppendEntries(AppendEntriesRequest {
                term: 4,
                leader_id: "node-1".into(),
                prev_log_index: Some(9),
                prev_log_term: 3,
                entries: Vec::new(),
                leader_commit: Some(9),
            }),
        )
    }

    #[test]
    fn test_frame_layout() {
        let envelope = append();
        let framed = frame_envelope(&envelope, 1 << 20).unwrap();

        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - FRAME_HEADER);
        assert_eq!(decode_envelope(&framed[FRAME_HEADER..]).unwrap(), envelope);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let envelope = Envelope::new(
            "node-1",
            1,
            Message::Ingest(vec![StorageEntry {
                key: "k".into(),
                value: Bytes::from(vec![0u8; 4096]),
                timestamp: 0,
                ttl: None,
            }]),
        );
        let err = frame_envelope(&envelope, 1024).unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::FrameTooLarge { max: 1024, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_write_frames() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let ping = Envelope::new("node-2", 7, Message::Ping);

        write_frame(&mut client, &append(), 1 << 20).await.unwrap();
        write_frame(&mut client, &ping, 1 << 20).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 1 << 20).await.unwrap(), Some(append()));
        let second = read_frame(&mut server, 1 << 20).await.unwrap().unwrap();
        assert_eq!(second.term, 7);
        assert_eq!(second.message.kind(), "ping");
        assert_eq!(read_frame(&mut server, 1 << 20).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_rejects_announced_oversize() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &(1u32 << 30).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut server, 1 << 20).await.is_err());
    }
}
