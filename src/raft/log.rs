use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub command: C,
    pub term: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("commit past appended watermark (committed {committed}, appended {appended})")]
    CommitOverrun { committed: u64, appended: u64 },

    #[error("refusing to truncate committed entry {index} (committed through {committed})")]
    TruncateCommitted { index: u64, committed: u64 },

    #[error("watermarks out of order: committed {committed}, appended {appended}, length {len}")]
    InvalidWatermarks { committed: u64, appended: u64, len: u64 },

    #[error("undecodable snapshot: {0}")]
    Corrupt(String),
}

/// Ordered sequence of `(command, term)` entries with appended and committed
/// watermarks.
///
/// Indexes are 1-based: entry `i` lives at `entries[i - 1]` and index 0 means
/// "nothing". The invariant `last_committed_index <= last_appended_index <= len`
/// holds after every public operation, and committed entries are never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedLog<C> {
    entries: Vec<LogEntry<C>>,
    last_appended_index: u64,
    last_committed_index: u64,
}

impl<C> Default for ReplicatedLog<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            last_appended_index: 0,
            last_committed_index: 0,
        }
    }
}

impl<C> ReplicatedLog<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from parts received over the wire or from disk.
    pub fn from_parts(
        entries: Vec<LogEntry<C>>,
        last_committed_index: u64,
        last_appended_index: u64,
    ) -> Result<Self, LogError> {
        let log = Self {
            entries,
            last_appended_index,
            last_committed_index,
        };
        log.validate()?;
        Ok(log)
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry<C>] {
        &self.entries
    }

    /// Entries up to and including the committed watermark.
    pub fn committed_entries(&self) -> &[LogEntry<C>] {
        &self.entries[..self.last_committed_index as usize]
    }

    pub fn last_appended_index(&self) -> u64 {
        self.last_appended_index
    }

    pub fn last_committed_index(&self) -> u64 {
        self.last_committed_index
    }

    /// The slot the next appended entry will occupy.
    pub fn next_index(&self) -> u64 {
        self.last_appended_index + 1
    }

    /// Index preceding the most recent append.
    pub fn prev_log_index(&self) -> u64 {
        self.last_appended_index.saturating_sub(1)
    }

    pub fn prev_log_term(&self) -> u64 {
        self.term_at(self.prev_log_index())
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry<C>> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, 0 when there is no such entry.
    pub fn term_at(&self, index: u64) -> u64 {
        self.entry(index).map(|e| e.term).unwrap_or(0)
    }

    pub fn last_committed_term(&self) -> u64 {
        self.term_at(self.last_committed_index)
    }

    /// Append an uncommitted entry and return its index.
    pub fn append_tentative(&mut self, command: C, term: u64) -> u64 {
        self.entries.push(LogEntry { command, term });
        self.last_appended_index = self.len();
        self.last_appended_index
    }

    /// Advance the committed watermark by one.
    pub fn commit(&mut self) -> Result<u64, LogError> {
        if self.last_committed_index >= self.last_appended_index {
            return Err(LogError::CommitOverrun {
                committed: self.last_committed_index,
                appended: self.last_appended_index,
            });
        }
        self.last_committed_index += 1;
        Ok(self.last_committed_index)
    }

    /// Commit every appended entry; returns how many were newly committed.
    pub fn commit_all(&mut self) -> u64 {
        let advanced = self.last_appended_index - self.last_committed_index;
        self.last_committed_index = self.last_appended_index;
        advanced
    }

    /// Drop every entry at or after `index`.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), LogError> {
        let index = index.max(1);
        if index <= self.last_committed_index {
            return Err(LogError::TruncateCommitted {
                index,
                committed: self.last_committed_index,
            });
        }
        if index > self.len() {
            return Ok(());
        }
        self.entries.truncate((index - 1) as usize);
        self.last_appended_index = self.last_appended_index.min(self.len());
        Ok(())
    }

    /// Replace this log with a copy pushed by the leader.
    ///
    /// The committed watermark never moves backwards: entries this node already
    /// committed stay committed as long as the incoming log still holds them.
    pub fn overwrite_with(&mut self, incoming: ReplicatedLog<C>) {
        let kept = self.last_committed_index.min(incoming.last_appended_index);
        self.last_committed_index = incoming.last_committed_index.max(kept);
        self.last_appended_index = incoming.last_appended_index;
        self.entries = incoming.entries;
    }

    /// Whether `incoming` holds every entry committed here, unchanged.
    pub fn keeps_committed_prefix(&self, incoming: &ReplicatedLog<C>) -> bool
    where
        C: PartialEq,
    {
        let committed = self.last_committed_index as usize;
        incoming.last_appended_index >= self.last_committed_index
            && incoming.entries.get(..committed) == self.entries.get(..committed)
    }

    pub fn validate(&self) -> Result<(), LogError> {
        if self.last_committed_index > self.last_appended_index
            || self.last_appended_index > self.len()
        {
            return Err(LogError::InvalidWatermarks {
                committed: self.last_committed_index,
                appended: self.last_appended_index,
                len: self.len(),
            });
        }
        Ok(())
    }
}

impl<C: Serialize> ReplicatedLog<C> {
    /// Serialize entries and both watermarks.
    pub fn snapshot(&self) -> Result<Vec<u8>, LogError> {
        serde_json::to_vec_pretty(self).map_err(|e| LogError::Corrupt(e.to_string()))
    }
}

impl<C: DeserializeOwned> ReplicatedLog<C> {
    /// Decode a snapshot produced by [`ReplicatedLog::snapshot`].
    pub fn restore(bytes: &[u8]) -> Result<Self, LogError> {
        let log: Self =
            serde_json::from_slice(bytes).map_err(|e| LogError::Corrupt(e.to_string()))?;
        log.validate()?;
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(terms: &[u64]) -> ReplicatedLog<String> {
        let mut log = ReplicatedLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append_tentative(format!("cmd-{}", i + 1), *term);
        }
        log
    }

    #[test]
    fn test_new_log_is_empty() {
        let log: ReplicatedLog<String> = ReplicatedLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_appended_index(), 0);
        assert_eq!(log.last_committed_index(), 0);
        assert_eq!(log.next_index(), 1);
        assert_eq!(log.term_at(0), 0);
        assert_eq!(log.prev_log_term(), 0);
    }

    #[test]
    fn test_append_tentative() {
        let mut log = ReplicatedLog::new();
        assert_eq!(log.append_tentative("a".to_string(), 1), 1);
        assert_eq!(log.append_tentative("b".to_string(), 2), 2);

        assert_eq!(log.last_appended_index(), 2);
        assert_eq!(log.last_committed_index(), 0);
        assert_eq!(log.next_index(), 3);
        assert_eq!(log.prev_log_index(), 1);
        assert_eq!(log.prev_log_term(), 1);
        assert_eq!(log.entry(2).unwrap().command, "b");
        assert!(log.entry(3).is_none());
    }

    #[test]
    fn test_commit_advances_by_one() {
        let mut log = log_with(&[1, 1]);
        assert_eq!(log.commit(), Ok(1));
        assert_eq!(log.commit(), Ok(2));
        assert_eq!(log.committed_entries().len(), 2);
    }

    #[test]
    fn test_commit_past_appended_is_reported() {
        let mut log = log_with(&[1]);
        log.commit().unwrap();
        assert_eq!(
            log.commit(),
            Err(LogError::CommitOverrun {
                committed: 1,
                appended: 1
            })
        );
        assert_eq!(log.last_committed_index(), 1);
    }

    #[test]
    fn test_commit_all() {
        let mut log = log_with(&[1, 1, 2]);
        log.commit().unwrap();
        assert_eq!(log.commit_all(), 2);
        assert_eq!(log.last_committed_index(), 3);
        assert_eq!(log.commit_all(), 0);
    }

    #[test]
    fn test_truncate_uncommitted_suffix() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.commit().unwrap();

        log.truncate_from(3).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_appended_index(), 2);
        assert_eq!(log.last_committed_index(), 1);

        // Past the end is a no-op
        log.truncate_from(10).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_truncate_never_cuts_committed() {
        let mut log = log_with(&[1, 1, 2]);
        log.commit().unwrap();
        log.commit().unwrap();

        let err = log.truncate_from(2).unwrap_err();
        assert_eq!(
            err,
            LogError::TruncateCommitted {
                index: 2,
                committed: 2
            }
        );
        assert_eq!(log.len(), 3);
        assert_eq!(log.term_at(2), 1);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut log = log_with(&[1, 2, 2]);
        log.commit().unwrap();

        let bytes = log.snapshot().unwrap();
        let restored: ReplicatedLog<String> = ReplicatedLog::restore(&bytes).unwrap();
        assert_eq!(restored, log);

        let empty: ReplicatedLog<String> = ReplicatedLog::new();
        let restored: ReplicatedLog<String> =
            ReplicatedLog::restore(&empty.snapshot().unwrap()).unwrap();
        assert_eq!(restored, empty);
    }

    #[test]
    fn test_restore_rejects_garbage_and_bad_watermarks() {
        assert!(matches!(
            ReplicatedLog::<String>::restore(b"{not json"),
            Err(LogError::Corrupt(_))
        ));

        let bad = br#"{"entries":[],"last_appended_index":2,"last_committed_index":0}"#;
        assert!(matches!(
            ReplicatedLog::<String>::restore(bad),
            Err(LogError::InvalidWatermarks { .. })
        ));
    }

    #[test]
    fn test_overwrite_keeps_commit_monotone() {
        let mut follower = log_with(&[1, 1]);
        follower.commit().unwrap();
        follower.commit().unwrap();

        let mut leader = log_with(&[1, 1, 3]);
        leader.commit().unwrap();

        follower.overwrite_with(leader.clone());
        assert_eq!(follower.entries(), leader.entries());
        assert_eq!(follower.last_appended_index(), 3);
        assert_eq!(follower.last_committed_index(), 2);
    }

    #[test]
    fn test_committed_prefix_check() {
        let mut local = log_with(&[1, 2]);
        local.commit().unwrap();

        assert!(local.keeps_committed_prefix(&log_with(&[1, 3, 3])));
        // Same index, different term
        assert!(!local.keeps_committed_prefix(&log_with(&[2])));
        assert!(!local.keeps_committed_prefix(&ReplicatedLog::new()));

        let empty: ReplicatedLog<String> = ReplicatedLog::new();
        assert!(empty.keeps_committed_prefix(&ReplicatedLog::new()));
    }

    #[test]
    fn test_from_parts_validates() {
        let entries = vec![LogEntry {
            command: "x".to_string(),
            term: 1,
        }];
        assert!(ReplicatedLog::from_parts(entries.clone(), 1, 1).is_ok());
        assert!(ReplicatedLog::from_parts(entries, 2, 1).is_err());
    }
}
