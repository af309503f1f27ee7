//! Replicated log with an optional compacted prefix. Durability is handled
//! by [`LogStore`](crate::consensus::LogStore).

use crate::types::{LogEntry, LogIndex, Term};

/// The replicated log.
///
/// Entries below `first_index()` have been folded into a snapshot whose last
/// entry is `base`.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    base: Option<(LogIndex, Term)>,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last entry covered by the snapshot.
    pub fn base(&self) -> Option<(LogIndex, Term)> {
        self.base
    }

    /// Index of the first entry held in memory.
    pub fn first_index(&self) -> LogIndex {
        self.base.map_or(0, |(index, _)| index + 1)
    }

    /// Index the next appended entry will get ("len(log)").
    pub fn next_index(&self) -> LogIndex {
        self.first_index() + self.entries.len() as LogIndex
    }

    pub fn last_index(&self) -> Option<LogIndex> {
        self.next_index().checked_sub(1)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .or(self.base.map(|(_, term)| term))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`, including the snapshot base.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if let Some((base_index, base_term)) = self.base {
            if index == base_index {
                return Some(base_term);
            }
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        let offset = index.checked_sub(self.first_index())?;
        self.entries.get(offset as usize)
    }

    /// Append a new entry at `next_index()`.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.next_index());
        self.entries.push(entry);
    }

    /// Whether the log contains an entry at `prev_index` with `prev_term`.
    ///
    /// Indexes inside the snapshot are committed and therefore match.
    pub fn matches(&self, prev_index: Option<LogIndex>, prev_term: Term) -> bool {
        let index = match prev_index {
            None => return true,
            Some(index) => index,
        };
        if self.base.is_some_and(|(base_index, _)| index < base_index) {
            return true;
        }
        self.term_at(index) == Some(prev_term)
    }

    /// Merge entries received after a matching `prev_index`.
    ///
    /// Conflicting suffixes are truncated. Returns the index of the last entry
    /// covered by the request and the first index removed, if any.
    pub fn append_entries(
        &mut self,
        prev_index: Option<LogIndex>,
        entries: Vec<LogEntry>,
    ) -> (Option<LogIndex>, Option<LogIndex>) {
        let last_new = entries.last().map(|e| e.index).or(prev_index);
        let mut truncated = None;
        for entry in entries {
            if entry.index < self.first_index() {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    truncated.get_or_insert(entry.index);
                    self.entries.push(entry);
                }
                None if entry.index == self.next_index() => self.entries.push(entry),
                None => break,
            }
        }
        (last_new, truncated)
    }

    /// Remove the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(self.first_index()) as usize;
        self.entries.truncate(keep);
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let offset = match start.checked_sub(self.first_index()) {
            Some(offset) => offset as usize,
            None => return Vec::new(),
        };
        if offset >= self.entries.len() {
            return Vec::new();
        }
        let end = (offset + max).min(self.entries.len());
        self.entries[offset..end].to_vec()
    }

    /// Whether a candidate with this last entry is at least as up to date as us.
    pub fn is_up_to_date(&self, last_index: Option<LogIndex>, last_term: Term) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// Drop entries up to and including `index`, which a snapshot now covers.
    pub fn compact_to(&mut self, index: LogIndex, term: Term) {
        if self.base.is_some_and(|(base_index, _)| index <= base_index) {
            return;
        }
        let drop = (index + 1).saturating_sub(self.first_index()) as usize;
        self.entries.drain(..drop.min(self.entries.len()));
        self.base = Some((index, term));
    }

    /// Reset to a snapshot received from the leader, keeping a matching suffix.
    pub fn reset_to(&mut self, index: LogIndex, term: Term) {
        if self.get(index).is_some_and(|e| e.term == term) {
            self.compact_to(index, term);
        } else {
            self.entries.clear();
            self.base = Some((index, term));
        }
    }

    /// Iterate over in-memory entries.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Command;

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        LogEntry::new(term, index, Command::set(format!("k{index}"), format!("t{term}")))
    }

    fn log_of(terms: &[Term]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(entry(*term, i as LogIndex));
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.next_index(), 0);
        assert_eq!(log.last_index(), None);
        assert_eq!(log.last_term(), 0);
        assert!(log.matches(None, 0));
        assert!(!log.matches(Some(0), 1));
    }

    #[test]
    fn test_append_and_lookup() {
        let log = log_of(&[1, 1, 2]);
        assert_eq!(log.last_index(), Some(2));
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.term_at(3), None);
        assert!(log.matches(Some(2), 2));
        assert!(!log.matches(Some(2), 1));
        assert_eq!(log.entries_from(1, 10).len(), 2);
        assert_eq!(log.entries_from(1, 1).len(), 1);
        assert!(log.entries_from(5, 1).is_empty());
    }

    #[test]
    fn test_conflicting_suffix_is_truncated() {
        let mut log = log_of(&[1, 1, 1, 1]);
        let (last_new, truncated) = log.append_entries(Some(1), vec![entry(2, 2)]);
        assert_eq!(last_new, Some(2));
        assert_eq!(truncated, Some(2));
        assert_eq!(log.last_index(), Some(2));
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn test_duplicate_append_is_idempotent() {
        let mut log = log_of(&[1, 1, 1]);
        let (last_new, truncated) = log.append_entries(Some(0), vec![entry(1, 1)]);
        assert_eq!(last_new, Some(1));
        assert_eq!(truncated, None);
        // Entries past the request are kept when they do not conflict.
        assert_eq!(log.last_index(), Some(2));
    }

    #[test]
    fn test_up_to_date_comparison() {
        let log = log_of(&[1, 2, 2]);
        assert!(log.is_up_to_date(Some(2), 2));
        assert!(log.is_up_to_date(Some(0), 3));
        assert!(!log.is_up_to_date(Some(5), 1));
        assert!(!log.is_up_to_date(Some(1), 2));
        assert!(RaftLog::new().is_up_to_date(None, 0));
    }

    #[test]
    fn test_compaction_keeps_indexes() {
        let mut log = log_of(&[1, 1, 2, 2, 3]);
        log.compact_to(2, 2);
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.next_index(), 5);
        assert_eq!(log.term_at(2), Some(2));
        assert!(log.get(2).is_none());
        assert_eq!(log.get(4).map(|e| e.term), Some(3));
        assert!(log.matches(Some(1), 99));
        assert!(log.entries_from(1, 10).is_empty());

        // Entries inside the snapshot are ignored on append.
        let (last_new, _) = log.append_entries(Some(1), vec![entry(2, 2), entry(2, 3)]);
        assert_eq!(last_new, Some(3));
        assert_eq!(log.last_index(), Some(4));
    }

    #[test]
    fn test_reset_to_snapshot() {
        let mut log = log_of(&[1, 1, 2]);
        log.reset_to(1, 1);
        assert_eq!(log.first_index(), 2);
        assert_eq!(log.last_index(), Some(2));

        let mut log = log_of(&[1, 1, 2]);
        log.reset_to(5, 3);
        assert_eq!(log.next_index(), 6);
        assert!(log.is_empty());
        assert_eq!(log.last_term(), 3);
    }
}
