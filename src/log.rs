//! The replicated log (spec §4.2, "Log contract").
//!
//! Dense from index 0, indexable by position, supports append,
//! tail-truncation and read-at-index. This is the in-memory record of
//! `(term, command)` pairs; durability of *applied* commands is the state
//! machine's job (`crate::state_machine`), not the log's.

use crate::command::LogEntry;

/// In-memory replicated log.
///
/// There is deliberately no trait here: the teacher crate's equivalent
/// (`distributed::replication::ReplicaSet`) keeps its log as a plain
/// `Vec<LogEntry>` behind a lock rather than behind an abstraction, and a
/// single concrete implementation is all this core needs (spec §4.2 names
/// a contract, not a pluggability requirement).
#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a new entry, returning its index.
    pub fn append(&mut self, entry: LogEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Read the entry at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    /// Term of the entry at `index`, or `0` if there is no such entry
    /// (used for `prev_log_term` lookups, spec §4.3).
    pub fn term_at(&self, index: usize) -> u64 {
        self.entries.get(index).map(|e| e.term).unwrap_or(0)
    }

    /// Index and term of the last entry, or `(None, 0)` for an empty log.
    pub fn last(&self) -> (Option<usize>, u64) {
        match self.entries.last() {
            Some(e) => (Some(self.entries.len() - 1), e.term),
            None => (None, 0),
        }
    }

    /// Drop every entry from `index` onward (inclusive). A no-op if
    /// `index >= len()`.
    pub fn truncate_from(&mut self, index: usize) {
        self.entries.truncate(index);
    }

    /// Full read-only view, e.g. for replicating a tail entry.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
