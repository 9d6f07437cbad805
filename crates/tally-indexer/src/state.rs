//! Persisted sync state.
//!
//! Records which `chain:network` pairs have finished their initial sync. The
//! file is JSON, written to a temporary sibling and renamed into place.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tally_core::records::ChainNetwork;

use crate::error::IndexerError;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// `chain:network` keys whose initial sync has completed.
    pub initial_sync_complete: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn is_complete(&self, chain: &ChainNetwork) -> bool {
        self.initial_sync_complete.contains(&chain.to_string())
    }
}

/// File-backed [`SyncState`].
pub struct SyncStateStore {
    path: PathBuf,
    state: Mutex<SyncState>,
}

impl SyncStateStore {
    /// Load the state at `path`. A missing file yields the empty state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IndexerError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                IndexerError::State(format!("invalid sync state '{}': {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SyncState::default(),
            Err(e) => {
                return Err(IndexerError::State(format!(
                    "failed to read '{}': {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SyncState {
        self.state.lock().clone()
    }

    pub fn is_complete(&self, chain: &ChainNetwork) -> bool {
        self.state.lock().is_complete(chain)
    }

    /// Record `chain` as synced and persist. Returns `false` if it already was.
    pub fn mark_complete(&self, chain: &ChainNetwork) -> Result<bool, IndexerError> {
        let mut state = self.state.lock();
        if !state.initial_sync_complete.insert(chain.to_string()) {
            return Ok(false);
        }
        state.updated_at = Some(Utc::now());
        write_atomic(&self.path, &state)?;
        debug!(%chain, path = %self.path.display(), "saved sync state");
        Ok(true)
    }
}

fn write_atomic(path: &Path, state: &SyncState) -> Result<(), IndexerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            IndexerError::State(format!("failed to create '{}': {e}", parent.display()))
        })?;
    }
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|e| IndexerError::State(format!("failed to encode sync state: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)
        .map_err(|e| IndexerError::State(format!("failed to write '{}': {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| IndexerError::State(format!("failed to rename '{}': {e}", tmp.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::load(dir.path().join("sync-state.json")).unwrap();
        assert!(store.state().initial_sync_complete.is_empty());
        assert!(!store.is_complete(&ChainNetwork::new("TALLY", "mainnet")));
    }

    #[test]
    fn mark_complete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync-state.json");
        let chain = ChainNetwork::new("TALLY", "testnet");

        let store = SyncStateStore::load(&path).unwrap();
        assert!(store.mark_complete(&chain).unwrap());
        assert!(!store.mark_complete(&chain).unwrap());

        let reloaded = SyncStateStore::load(&path).unwrap();
        assert!(reloaded.is_complete(&chain));
        assert!(reloaded.state().updated_at.is_some());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn json_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-state.json");
        std::fs::write(&path, r#"{"initialSyncComplete":["BTC:mainnet"]}"#).unwrap();
        let store = SyncStateStore::load(&path).unwrap();
        assert!(store.is_complete(&ChainNetwork::new("BTC", "mainnet")));
        assert!(store.state().updated_at.is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync-state.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            SyncStateStore::load(&path),
            Err(IndexerError::State(_))
        ));
    }
}
