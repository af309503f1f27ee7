//! Durable key/value storage.
//!
//! Every mutation is appended to a write-ahead log before the in-memory map
//! changes. On startup the last snapshot is loaded and the WAL is replayed
//! from the snapshot's index forward. Entries expire lazily on access.
//!
//! # Files
//!
//! ```text
//! <data_dir>/
//!   wal.log        newline-delimited JSON LogEntry records
//!   snapshot.bin   full state at some applied index (see `snapshot`)
//! ```

mod engine;
pub mod snapshot;
mod wal;

pub use engine::StorageEngine;
pub use snapshot::{Snapshot, SnapshotHeader};
pub use wal::Wal;

use crate::error::StorageError;
use crate::types::LogEntry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: Bytes,
    /// Milliseconds since the Unix epoch when the value was written.
    pub timestamp: u64,
    /// Lifetime in milliseconds, measured from `timestamp`.
    pub ttl: Option<u64>,
}

impl StorageEntry {
    /// Whether the entry is past its TTL at `now` (millis).
    pub fn is_expired(&self, now: u64) -> bool {
        match self.ttl {
            Some(ttl) => self.timestamp.saturating_add(ttl) < now,
            None => false,
        }
    }

    /// Bytes accounted for this entry: key plus value.
    pub fn size(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

/// Key count and byte size of a ring range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeStats {
    pub key_count: u64,
    pub size: u64,
}

/// Hooks invoked while storage recovers from disk.
pub trait ReplayObserver {
    /// Called with the auxiliary blob of the loaded snapshot.
    fn restore(&mut self, aux: &[u8]) -> Result<(), StorageError>;

    /// Called for each WAL record after the snapshot, in order. Returning false
    /// records the entry as applied without changing the key/value map.
    fn admit(&mut self, entry: &LogEntry) -> bool;
}

/// Observer that replays every record.
pub struct ReplayAll;

impl ReplayObserver for ReplayAll {
    fn restore(&mut self, _aux: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }

    fn admit(&mut self, _entry: &LogEntry) -> bool {
        true
    }
}
