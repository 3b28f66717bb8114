//! Durable Raft state
//!
//! The whole state (term, vote, log tail, commit index, snapshot, voters)
//! lives in one bincode file, `<data>/raft_state.bin`. Saves write a
//! temporary file and rename it over the previous one, so a crash leaves
//! either the old or the new state.

use crate::common::raft::{LogEntry, Snapshot};
use crate::common::{PeerId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "raft_state.bin";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub peer_id: PeerId,
    pub term: u64,
    pub voted_for: Option<PeerId>,
    pub log: Vec<LogEntry>,
    pub commit_index: u64,
    pub snapshot: Option<Snapshot>,
    pub voters: BTreeMap<PeerId, String>,
}

pub struct RaftStorage {
    path: PathBuf,
}

impl RaftStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            path: dir.as_ref().join(STATE_FILE),
        })
    }

    pub fn load(&self) -> Result<Option<PersistentState>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = bincode::deserialize(&bytes)
            .map_err(|e| crate::Error::Corrupted(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &PersistentState) -> Result<()> {
        let bytes = bincode::serialize(state)?;
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();
        assert!(storage.load().unwrap().is_none());

        let state = PersistentState {
            peer_id: 7,
            term: 3,
            voted_for: Some(7),
            log: vec![LogEntry {
                term: 3,
                index: 1,
                data: vec![],
            }],
            commit_index: 1,
            snapshot: None,
            voters: BTreeMap::from([(7, "http://127.0.0.1:6333".to_string())]),
        };
        storage.save(&state).unwrap();

        let reopened = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(state));
    }

    #[test]
    fn test_corrupted_state_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), b"\xff\xff").unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();
        assert!(matches!(storage.load(), Err(crate::Error::Corrupted(_))));
    }
}
