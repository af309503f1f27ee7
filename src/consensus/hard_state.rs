//! Persistent Raft state: current term and vote.

use crate::error::StorageError;
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// State that must survive restarts before a vote is granted or a term adopted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// File-backed (or in-memory) hard state.
#[derive(Debug, Clone)]
pub struct HardStateStore {
    path: Option<PathBuf>,
}

impl HardStateStore {
    /// Load hard state from `path`, defaulting to term 0 with no vote.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, HardState), StorageError> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok((Self { path: Some(path) }, state))
    }

    /// A store that keeps nothing; for tests.
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    /// Persist `state` with write-then-rename.
    pub fn save(&self, state: &HardState) -> Result<(), StorageError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(state)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
