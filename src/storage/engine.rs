//! WAL-backed key/value storage engine.

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::partitioning::HashRange;
use crate::storage::snapshot::{self, Snapshot, CRC32};
use crate::storage::wal::Wal;
use crate::storage::{RangeStats, ReplayAll, ReplayObserver, StorageEntry};
use crate::types::{now_millis, Command, LogEntry, LogIndex, Term};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const WAL_FILE: &str = "wal.log";
const SNAPSHOT_FILE: &str = "snapshot.bin";

#[derive(Default)]
struct StoreState {
    data: HashMap<String, StorageEntry>,
    last_applied: Option<(LogIndex, Term)>,
    snapshot_point: Option<(LogIndex, Term)>,
    since_snapshot: u64,
    reserved: u64,
}

impl StoreState {
    fn apply_to_map(&mut self, entry: &LogEntry) {
        match &entry.command {
            Command::Set { key, value, ttl } => {
                self.data.insert(
                    key.clone(),
                    StorageEntry {
                        key: key.clone(),
                        value: value.clone(),
                        timestamp: entry.timestamp,
                        ttl: *ttl,
                    },
                );
            }
            Command::Delete { key } => {
                self.data.remove(key);
            }
            Command::Clear => self.data.clear(),
            Command::MigrateShard { .. } | Command::UpdateMembership { .. } | Command::Heartbeat => {}
        }
    }

    fn used_bytes(&self) -> u64 {
        self.data.values().map(StorageEntry::size).sum()
    }

    fn live_in_range(&self, range: HashRange, now: u64) -> Vec<&StorageEntry> {
        let mut entries: Vec<&StorageEntry> = self
            .data
            .values()
            .filter(|e| !e.is_expired(now) && range.contains_key(&e.key))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

/// Durable key/value map.
///
/// Lock order is always WAL, then state.
pub struct StorageEngine {
    dir: PathBuf,
    config: StorageConfig,
    state: RwLock<StoreState>,
    wal: Mutex<Wal>,
    aux: Mutex<Bytes>,
}

impl StorageEngine {
    /// Open storage in `dir`, replaying every WAL record.
    pub fn open(dir: impl AsRef<Path>, config: StorageConfig) -> Result<Self, StorageError> {
        Self::open_with(dir, config, &mut ReplayAll)
    }

    /// Open storage in `dir`, letting `observer` filter replayed records.
    pub fn open_with(
        dir: impl AsRef<Path>,
        config: StorageConfig,
        observer: &mut dyn ReplayObserver,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut state = StoreState::default();
        let mut aux = Bytes::new();
        if let Some(bytes) = snapshot::read_file(&dir.join(SNAPSHOT_FILE))? {
            let snap = snapshot::decode(&bytes)?;
            if !snap.aux.is_empty() {
                observer.restore(&snap.aux)?;
            }
            info!(
                dir = %dir.display(),
                entries = snap.entries.len(),
                applied = ?snap.applied,
                "Loaded snapshot"
            );
            state.data = snap
                .entries
                .into_iter()
                .map(|e| (e.key.clone(), e))
                .collect();
            state.last_applied = snap.applied;
            state.snapshot_point = snap.applied;
            aux = snap.aux;
        }

        let (wal, records) = Wal::open(dir.join(WAL_FILE), config.sync_writes)?;
        let mut replayed = 0u64;
        for entry in records {
            if state.last_applied.is_some_and(|(index, _)| entry.index <= index) {
                continue;
            }
            if observer.admit(&entry) {
                state.apply_to_map(&entry);
            }
            state.last_applied = Some((entry.index, entry.term));
            replayed += 1;
        }
        state.since_snapshot = replayed;

        info!(
            dir = %dir.display(),
            keys = state.data.len(),
            replayed,
            last_applied = ?state.last_applied,
            "Storage recovered"
        );

        Ok(Self {
            dir,
            config,
            state: RwLock::new(state),
            wal: Mutex::new(wal),
            aux: Mutex::new(aux),
        })
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Apply a committed entry: WAL first, then the key/value map.
    pub fn apply(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut wal = self.wal.lock();
        self.write_locked(&mut wal, entry, true)
    }

    /// Record an entry as applied without touching the key/value map.
    pub fn record(&self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut wal = self.wal.lock();
        self.write_locked(&mut wal, entry, false)
    }

    fn write_locked(
        &self,
        wal: &mut Wal,
        entry: &LogEntry,
        materialize: bool,
    ) -> Result<(), StorageError> {
        wal.append(entry)?;
        let due = {
            let mut state = self.state.write();
            if materialize {
                state.apply_to_map(entry);
            }
            state.last_applied = Some((entry.index, entry.term));
            state.since_snapshot += 1;
            self.config.snapshot_threshold > 0
                && state.since_snapshot >= self.config.snapshot_threshold
        };
        trace!(index = entry.index, term = entry.term, command = entry.command.kind(), "Applied entry");

        if due {
            // The entry is already durable in the WAL; a failed snapshot only delays truncation.
            if let Err(e) = self.compact_locked(wal) {
                warn!(error = %e, "Automatic snapshot failed");
            }
        }
        Ok(())
    }

    /// Write a command outside of consensus, numbering it after the last applied entry.
    fn local_write(&self, command: Command) -> Result<LogEntry, StorageError> {
        let mut wal = self.wal.lock();
        let (index, term) = match self.state.read().last_applied {
            Some((index, term)) => (index + 1, term),
            None => (0, 0),
        };
        let entry = LogEntry::new(term, index, command);
        self.write_locked(&mut wal, &entry, true)?;
        Ok(entry)
    }

    /// Set a key directly.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<LogEntry, StorageError> {
        self.local_write(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: ttl.map(|d| d.as_millis() as u64),
        })
    }

    /// Delete a key directly. Returns whether a live value was removed.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let existed = self.has(key);
        self.local_write(Command::delete(key))?;
        Ok(existed)
    }

    /// Remove every key directly.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.local_write(Command::Clear).map(|_| ())
    }

    /// Get a live value.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entry(key).map(|e| e.value)
    }

    /// Get a live entry, evicting it if it has expired.
    pub fn entry(&self, key: &str) -> Option<StorageEntry> {
        let now = now_millis();
        {
            let state = self.state.read();
            match state.data.get(key) {
                None => return None,
                Some(e) if !e.is_expired(now) => return Some(e.clone()),
                Some(_) => {}
            }
        }
        let mut state = self.state.write();
        if state.data.get(key).is_some_and(|e| e.is_expired(now)) {
            state.data.remove(key);
            trace!(key, "Evicted expired entry");
        }
        None
    }

    /// Whether a live value exists.
    pub fn has(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.evict_expired();
        let mut keys: Vec<String> = self.state.read().data.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of live keys.
    pub fn size(&self) -> usize {
        self.evict_expired();
        self.state.read().data.len()
    }

    fn evict_expired(&self) -> usize {
        let now = now_millis();
        let mut state = self.state.write();
        let before = state.data.len();
        state.data.retain(|_, e| !e.is_expired(now));
        let evicted = before - state.data.len();
        if evicted > 0 {
            trace!(evicted, "Evicted expired entries");
        }
        evicted
    }

    /// Last entry applied, as (index, term).
    pub fn last_applied(&self) -> Option<(LogIndex, Term)> {
        self.state.read().last_applied
    }

    /// Entry covered by the current snapshot file.
    pub fn snapshot_point(&self) -> Option<(LogIndex, Term)> {
        self.state.read().snapshot_point
    }

    /// Number of records currently in the WAL.
    pub fn wal_len(&self) -> usize {
        self.wal.lock().len()
    }

    /// Set the auxiliary blob stored with future snapshots.
    pub fn set_snapshot_aux(&self, aux: Bytes) {
        *self.aux.lock() = aux;
    }

    /// Write a snapshot of the current state and drop the WAL records it covers.
    pub fn compact(&self) -> Result<Option<(LogIndex, Term)>, StorageError> {
        let mut wal = self.wal.lock();
        self.compact_locked(&mut wal)
    }

    fn compact_locked(&self, wal: &mut Wal) -> Result<Option<(LogIndex, Term)>, StorageError> {
        let now = now_millis();
        let snap = {
            let state = self.state.read();
            let mut entries: Vec<StorageEntry> = state
                .data
                .values()
                .filter(|e| !e.is_expired(now))
                .cloned()
                .collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            Snapshot {
                applied: state.last_applied,
                entries,
                aux: self.aux.lock().clone(),
            }
        };

        let bytes = snapshot::encode(&snap, self.config.compress_snapshots)?;
        snapshot::write_file(&self.dir.join(SNAPSHOT_FILE), &bytes)?;
        let removed = match snap.applied {
            Some((index, _)) => wal.truncate_before(index + 1)?,
            None => 0,
        };

        let mut state = self.state.write();
        state.snapshot_point = snap.applied;
        state.since_snapshot = 0;
        info!(
            dir = %self.dir.display(),
            applied = ?snap.applied,
            entries = snap.entries.len(),
            bytes = bytes.len(),
            wal_removed = removed,
            "Snapshot written"
        );
        Ok(snap.applied)
    }

    /// Remove WAL records below `index`.
    ///
    /// Only records covered by the snapshot and already applied may go; anything
    /// else is rejected.
    pub fn truncate_wal(&self, index: LogIndex) -> Result<usize, StorageError> {
        let mut wal = self.wal.lock();
        let limit = {
            let state = self.state.read();
            match (state.last_applied, state.snapshot_point) {
                (Some((applied, _)), Some((covered, _))) => Some(applied.min(covered + 1)),
                _ => None,
            }
        };
        if index > limit.unwrap_or(0) {
            return Err(StorageError::InvalidTruncation { index, limit });
        }
        wal.truncate_before(index)
    }

    /// Raw bytes of the current snapshot file with its (index, term).
    pub fn snapshot_bytes(&self) -> Result<Option<(LogIndex, Term, Bytes)>, StorageError> {
        let _wal = self.wal.lock();
        let bytes = match snapshot::read_file(&self.dir.join(SNAPSHOT_FILE))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let header = snapshot::SnapshotHeader::from_bytes(&bytes)?;
        Ok(header
            .applied()
            .map(|(index, term)| (index, term, Bytes::from(bytes))))
    }

    /// Replace all state with a snapshot received from a peer. Returns its aux blob.
    pub fn install_snapshot(
        &self,
        index: LogIndex,
        term: Term,
        data: &[u8],
    ) -> Result<Bytes, StorageError> {
        let snap = snapshot::decode(data)?;
        if snap.applied != Some((index, term)) {
            return Err(StorageError::CorruptSnapshot(format!(
                "snapshot covers {:?}, expected ({index}, {term})",
                snap.applied
            )));
        }

        let mut wal = self.wal.lock();
        snapshot::write_file(&self.dir.join(SNAPSHOT_FILE), data)?;
        wal.truncate_before(index + 1)?;

        let mut state = self.state.write();
        state.data = snap
            .entries
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        state.last_applied = Some((index, term));
        state.snapshot_point = Some((index, term));
        state.since_snapshot = 0;
        *self.aux.lock() = snap.aux.clone();
        info!(index, term, keys = state.data.len(), "Installed snapshot");
        Ok(snap.aux)
    }

    /// Key count and size of live entries in `range`.
    pub fn range_stats(&self, range: HashRange) -> RangeStats {
        let now = now_millis();
        let state = self.state.read();
        let entries = state.live_in_range(range, now);
        RangeStats {
            key_count: entries.len() as u64,
            size: entries.iter().map(|e| e.size()).sum(),
        }
    }

    /// Entries in `range` ordered by key, starting after `after`, up to
    /// `max_bytes` (always at least one entry if any remain).
    pub fn read_chunk(
        &self,
        range: HashRange,
        after: Option<&str>,
        max_bytes: u64,
    ) -> Vec<StorageEntry> {
        let now = now_millis();
        let state = self.state.read();
        let mut chunk = Vec::new();
        let mut bytes = 0u64;
        for entry in state.live_in_range(range, now) {
            if after.is_some_and(|a| entry.key.as_str() <= a) {
                continue;
            }
            if !chunk.is_empty() && bytes + entry.size() > max_bytes {
                break;
            }
            bytes += entry.size();
            chunk.push(entry.clone());
        }
        chunk
    }

    /// Insert migrated entries. Returns the bytes ingested.
    ///
    /// Not logged; callers make the result durable with [`compact`](Self::compact).
    pub fn ingest(&self, entries: Vec<StorageEntry>) -> u64 {
        let mut state = self.state.write();
        let mut bytes = 0;
        for entry in entries {
            bytes += entry.size();
            state.data.insert(entry.key.clone(), entry);
        }
        debug!(bytes, "Ingested migrated entries");
        bytes
    }

    /// CRC32 over the sorted live entries of `range`.
    pub fn checksum(&self, range: HashRange) -> u32 {
        let now = now_millis();
        let state = self.state.read();
        let mut digest = CRC32.digest();
        for entry in state.live_in_range(range, now) {
            digest.update(&(entry.key.len() as u32).to_le_bytes());
            digest.update(entry.key.as_bytes());
            digest.update(&(entry.value.len() as u64).to_le_bytes());
            digest.update(&entry.value);
            digest.update(&entry.timestamp.to_le_bytes());
            digest.update(&entry.ttl.unwrap_or(u64::MAX).to_le_bytes());
        }
        digest.finalize()
    }

    /// Remove every entry in `range`. Not logged, like [`ingest`](Self::ingest).
    pub fn delete_range(&self, range: HashRange) -> usize {
        let mut state = self.state.write();
        let before = state.data.len();
        state.data.retain(|key, _| !range.contains_key(key));
        before - state.data.len()
    }

    /// Bytes held by stored entries.
    pub fn used_bytes(&self) -> u64 {
        self.state.read().used_bytes()
    }

    /// Reserve room for incoming data against the configured capacity.
    pub fn reserve(&self, bytes: u64) -> Result<(), StorageError> {
        let mut state = self.state.write();
        if let Some(capacity) = self.config.capacity_bytes {
            let committed = state.used_bytes() + state.reserved;
            let available = capacity.saturating_sub(committed);
            if bytes > available {
                return Err(StorageError::CapacityExceeded {
                    requested: bytes,
                    available,
                });
            }
        }
        state.reserved += bytes;
        Ok(())
    }

    /// Return a reservation.
    pub fn release(&self, bytes: u64) {
        let mut state = self.state.write();
        state.reserved = state.reserved.saturating_sub(bytes);
    }
}
