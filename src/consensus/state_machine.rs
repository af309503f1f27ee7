//! The replicated state machine driven by committed log entries.

use crate::error::Result;
use crate::types::{LogEntry, LogIndex, Term};
use bytes::Bytes;

/// A snapshot that can be shipped to a lagging follower.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Bytes,
}

/// Receives committed entries in index order.
///
/// An error from `apply` is treated as a storage failure: the node stops
/// accepting writes and will not seek leadership.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed entry.
    fn apply(&self, entry: &LogEntry) -> Result<()>;

    /// Last entry applied, as recovered from durable state.
    fn last_applied(&self) -> Option<(LogIndex, Term)>;

    /// Last entry covered by a durable snapshot; the log may be compacted up to it.
    fn snapshot_point(&self) -> Option<(LogIndex, Term)>;

    /// Current snapshot, if one exists.
    fn snapshot(&self) -> Result<Option<SnapshotData>>;

    /// Replace state with a snapshot from the leader.
    fn restore(&self, snapshot: &SnapshotData) -> Result<()>;
}
