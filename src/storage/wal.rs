//! Append-only write-ahead log of newline-delimited JSON `LogEntry` records.

use crate::error::StorageError;
use crate::types::{LogEntry, LogIndex};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Write-ahead log file.
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    sync: bool,
    records: usize,
}

/// Parse WAL contents, skipping records that cannot be decoded.
fn parse_records(path: &Path, content: &str) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping unreadable WAL record"
            ),
        }
    }
    entries
}

fn open_append(path: &Path) -> Result<File, StorageError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

impl Wal {
    /// Open (or create) the WAL at `path` and return every readable record.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<(Self, Vec<LogEntry>), StorageError> {
        let path = path.as_ref().to_path_buf();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let entries = parse_records(&path, &content);

        let mut writer = BufWriter::new(open_append(&path)?);
        // A torn final record must not swallow the next append.
        if !content.is_empty() && !content.ends_with('\n') {
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        debug!(path = %path.display(), records = entries.len(), "Opened WAL");
        let records = entries.len();
        Ok((
            Self {
                path,
                writer,
                sync,
                records,
            },
            entries,
        ))
    }

    /// Durably append one record.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_data()?;
        }
        self.records += 1;
        Ok(())
    }

    /// Drop every record with an index below `index`. Returns the number removed.
    pub fn truncate_before(&mut self, index: LogIndex) -> Result<usize, StorageError> {
        self.writer.flush()?;
        let content = fs::read_to_string(&self.path)?;
        let entries = parse_records(&self.path, &content);
        let total = entries.len();

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for entry in entries.iter().filter(|e| e.index >= index) {
                serde_json::to_writer(&mut out, entry)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.writer = BufWriter::new(open_append(&self.path)?);

        self.records = entries.iter().filter(|e| e.index >= index).count();
        let removed = total - self.records;
        debug!(path = %self.path.display(), before = index, removed, "Truncated WAL");
        Ok(removed)
    }

    /// Number of records in the log.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
