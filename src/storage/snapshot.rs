//! Snapshot file format.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC_NUMBER: [u8; 4] = "SKVS"                  │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION: u32 = 1                                │
//! ├─────────────────────────────────────────────────┤
//! │ FLAGS: u32                                      │
//! │   bit 0: compressed (LZ4)                       │
//! │   bit 1: last applied index/term present        │
//! ├─────────────────────────────────────────────────┤
//! │ LAST_INDEX: u64                                 │
//! ├─────────────────────────────────────────────────┤
//! │ LAST_TERM: u64                                  │
//! ├─────────────────────────────────────────────────┤
//! │ TIMESTAMP: u64 (Unix millis)                    │
//! ├─────────────────────────────────────────────────┤
//! │ ENTRY_COUNT: u64                                │
//! ├─────────────────────────────────────────────────┤
//! │ DATA_SIZE: u64 (uncompressed body size)         │
//! ├─────────────────────────────────────────────────┤
//! │ RESERVED: [u8; 12]                              │
//! ├─────────────────────────────────────────────────┤
//! │ BODY: bincode { entries, aux }                  │
//! │ (possibly LZ4 compressed)                       │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32 over BODY as stored                  │
//! └─────────────────────────────────────────────────┘
//! ```

use crate::error::StorageError;
use crate::storage::StorageEntry;
use crate::types::{now_millis, LogIndex, Term};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Magic number for snapshot files.
pub const MAGIC: [u8; 4] = *b"SKVS";

/// Current format version
pub const VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Flag: body is LZ4 compressed
pub const FLAG_COMPRESSED: u32 = 1 << 0;

/// Flag: LAST_INDEX and LAST_TERM are meaningful
pub const FLAG_HAS_INDEX: u32 = 1 << 1;

/// CRC-32 calculator (iSCSI polynomial)
pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Snapshot file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    pub flags: u32,
    pub last_index: LogIndex,
    pub last_term: Term,
    pub timestamp: u64,
    pub entry_count: u64,
    pub data_size: u64,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl SnapshotHeader {
    fn new(applied: Option<(LogIndex, Term)>) -> Self {
        let (last_index, last_term) = applied.unwrap_or((0, 0));
        Self {
            version: VERSION,
            flags: if applied.is_some() { FLAG_HAS_INDEX } else { 0 },
            last_index,
            last_term,
            timestamp: now_millis(),
            entry_count: 0,
            data_size: 0,
        }
    }

    /// Check if the body is compressed
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Last applied (index, term) captured by the snapshot.
    pub fn applied(&self) -> Option<(LogIndex, Term)> {
        (self.flags & FLAG_HAS_INDEX != 0).then_some((self.last_index, self.last_term))
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.last_index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.last_term.to_le_bytes());
        buf[28..36].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[36..44].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[44..52].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::CorruptSnapshot("header too short".into()));
        }
        if buf[0..4] != MAGIC {
            return Err(StorageError::CorruptSnapshot("bad magic".into()));
        }
        let version = read_u32(buf, 4);
        if version > VERSION {
            return Err(StorageError::CorruptSnapshot(format!(
                "unsupported version {version}"
            )));
        }
        Ok(Self {
            version,
            flags: read_u32(buf, 8),
            last_index: read_u64(buf, 12),
            last_term: read_u64(buf, 20),
            timestamp: read_u64(buf, 28),
            entry_count: read_u64(buf, 36),
            data_size: read_u64(buf, 44),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    entries: Vec<StorageEntry>,
    aux: Bytes,
}

/// Decoded snapshot contents.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Last log entry reflected in the snapshot.
    pub applied: Option<(LogIndex, Term)>,

    /// Every live entry.
    pub entries: Vec<StorageEntry>,

    /// Opaque state stored alongside the data (the ring layout in a cluster).
    pub aux: Bytes,
}

/// Encode a snapshot into its file representation.
pub fn encode(snapshot: &Snapshot, compress: bool) -> Result<Vec<u8>, StorageError> {
    let body = bincode::serialize(&SnapshotBody {
        entries: snapshot.entries.clone(),
        aux: snapshot.aux.clone(),
    })
    .map_err(|e| StorageError::Serialization(e.to_string()))?;

    let mut header = SnapshotHeader::new(snapshot.applied);
    header.entry_count = snapshot.entries.len() as u64;
    header.data_size = body.len() as u64;

    let stored = if compress {
        header.flags |= FLAG_COMPRESSED;
        lz4_flex::compress_prepend_size(&body)
    } else {
        body
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + stored.len() + 4);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&stored);
    out.extend_from_slice(&CRC32.checksum(&stored).to_le_bytes());
    Ok(out)
}

/// Decode and validate a snapshot file.
pub fn decode(buf: &[u8]) -> Result<Snapshot, StorageError> {
    let header = SnapshotHeader::from_bytes(buf)?;
    if buf.len() < HEADER_SIZE + 4 {
        return Err(StorageError::CorruptSnapshot("missing checksum".into()));
    }
    let crc_at = buf.len() - 4;
    let stored = &buf[HEADER_SIZE..crc_at];
    let expected = read_u32(buf, crc_at);
    let actual = CRC32.checksum(stored);
    if expected != actual {
        return Err(StorageError::CorruptSnapshot(format!(
            "crc mismatch: stored {expected:#010x}, computed {actual:#010x}"
        )));
    }

    let body = if header.is_compressed() {
        lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| StorageError::CorruptSnapshot(e.to_string()))?
    } else {
        stored.to_vec()
    };
    if body.len() as u64 != header.data_size {
        return Err(StorageError::CorruptSnapshot(format!(
            "body is {} bytes, header says {}",
            body.len(),
            header.data_size
        )));
    }

    let decoded: SnapshotBody = bincode::deserialize(&body)
        .map_err(|e| StorageError::CorruptSnapshot(e.to_string()))?;
    if decoded.entries.len() as u64 != header.entry_count {
        return Err(StorageError::CorruptSnapshot("entry count mismatch".into()));
    }

    Ok(Snapshot {
        applied: header.applied(),
        entries: decoded.entries,
        aux: decoded.aux,
    })
}

/// Atomically replace `path` with `bytes` (write to a temp file, fsync, rename).
pub fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a snapshot file if it exists.
pub fn read_file(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
