use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RaftError, Result};
use crate::raft::log::ReplicatedLog;

/// File-backed home of a node's log.
///
/// Writes go to a sibling temporary file which is synced and then renamed over
/// the target, so a crash mid-write never leaves a half-written log behind.
#[derive(Debug, Clone)]
pub struct LogStore {
    path: PathBuf,
}

impl LogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save<C: Serialize>(&self, log: &ReplicatedLog<C>) -> Result<()> {
        let bytes = log.snapshot()?;
        let tmp = self.path.with_extension("tmp");

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };

        write().map_err(|source| RaftError::Persistence {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(
            path = %self.path.display(),
            committed = log.last_committed_index(),
            appended = log.last_appended_index(),
            "Persisted log"
        );
        Ok(())
    }

    pub fn load<C: DeserializeOwned>(&self) -> Result<ReplicatedLog<C>> {
        let bytes = fs::read(&self.path).map_err(|source| RaftError::Persistence {
            path: self.path.clone(),
            source,
        })?;
        ReplicatedLog::restore(&bytes).map_err(|e| {
            RaftError::CorruptSnapshot(format!("{}: {}", self.path.display(), e))
        })
    }
}
