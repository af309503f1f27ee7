//! Durable Raft state: the log file plus term and vote.
//!
//! The log is a newline-delimited JSON file of [`LogRecord`]s. An entry
//! record replaces anything at or after its index, so a follower that
//! truncates a conflicting suffix only has to write the replacement entries.
//! Compaction and snapshot installs rewrite the file behind a `Base` record.

use crate::consensus::hard_state::{HardState, HardStateStore};
use crate::consensus::log::RaftLog;
use crate::error::StorageError;
use crate::types::{LogEntry, LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HARD_STATE_FILE: &str = "raft_state.json";
const LOG_FILE: &str = "raft_log.jsonl";

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    /// Entries up to `index` live in a snapshot.
    Base { index: LogIndex, term: Term },
    Entry(LogEntry),
}

/// Rebuild a log from file contents. Stops at the first unreadable record.
fn replay(path: &Path, content: &str) -> RaftLog {
    let mut log = RaftLog::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(LogRecord::Base { index, term }) => {
                if log.base().is_none_or(|(base, _)| index > base) {
                    log.reset_to(index, term);
                }
            }
            Ok(LogRecord::Entry(entry)) => {
                if entry.index < log.first_index() {
                    continue;
                }
                log.truncate_from(entry.index);
                if entry.index != log.next_index() {
                    warn!(path = %path.display(), line = line_no + 1, index = entry.index, "Gap in raft log");
                    break;
                }
                log.append(entry);
            }
            Err(e) => {
                warn!(path = %path.display(), line = line_no + 1, error = %e, "Unreadable raft log record");
                break;
            }
        }
    }
    log
}

fn write_record(out: &mut impl Write, record: &LogRecord) -> Result<(), StorageError> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Append-only file holding the Raft log.
pub struct LogStore {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    sync: bool,
}

impl LogStore {
    /// Open (or create) the log file and return the log it holds.
    ///
    /// The file is rewritten on open, which drops a torn tail and every
    /// superseded record.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<(Self, RaftLog), StorageError> {
        let path = path.as_ref().to_path_buf();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let log = replay(&path, &content);
        let mut store = Self {
            path: Some(path),
            writer: None,
            sync,
        };
        store.rewrite(&log)?;
        debug!(
            entries = log.len(),
            base = ?log.base(),
            last_index = ?log.last_index(),
            "Opened raft log"
        );
        Ok((store, log))
    }

    /// A store that keeps nothing; for tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            writer: None,
            sync: false,
        }
    }

    /// Durably append `entries`, each replacing anything at or after its index.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for entry in entries {
            write_record(writer, &LogRecord::Entry(entry.clone()))?;
        }
        writer.flush()?;
        if self.sync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Replace the file with exactly the contents of `log`.
    pub fn rewrite(&mut self, log: &RaftLog) -> Result<(), StorageError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            if let Some((index, term)) = log.base() {
                write_record(&mut out, &LogRecord::Base { index, term })?;
            }
            for entry in log.iter() {
                write_record(&mut out, &LogRecord::Entry(entry.clone()))?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        self.writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(path)?,
        ));
        Ok(())
    }
}

/// Everything a Raft node recovers on restart.
pub struct RaftStorage {
    pub(crate) hard_state: HardStateStore,
    pub(crate) state: HardState,
    pub(crate) log_store: LogStore,
    pub(crate) log: RaftLog,
}

impl RaftStorage {
    /// Load term, vote and log from `dir`.
    pub fn open(dir: impl AsRef<Path>, sync: bool) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let (hard_state, state) = HardStateStore::open(dir.join(HARD_STATE_FILE))?;
        let (log_store, log) = LogStore::open(dir.join(LOG_FILE), sync)?;
        Ok(Self {
            hard_state,
            state,
            log_store,
            log,
        })
    }

    /// Fresh state that is never written anywhere.
    pub fn in_memory() -> Self {
        Self {
            hard_state: HardStateStore::in_memory(),
            state: HardState::default(),
            log_store: LogStore::in_memory(),
            log: RaftLog::new(),
        }
    }

    pub fn hard_state(&self) -> &HardState {
        &self.state
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }
}
