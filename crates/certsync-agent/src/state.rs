//! Locally deployed fingerprints
//!
//! Persisted with the same write-then-rename and `.backup` discipline as the
//! server's file store.

use certsync_core::{Error, Result};
use certsync_core::state::JsonSnapshotFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Certificate ID → fingerprint of the bundle currently on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    fingerprints: BTreeMap<String, String>,
}

impl LocalState {
    /// Fingerprint deployed for `cert_id`
    pub fn fingerprint(&self, cert_id: &str) -> Option<&str> {
        self.fingerprints.get(cert_id).map(String::as_str)
    }

    /// Record a successful deployment
    pub fn set_fingerprint(&mut self, cert_id: impl Into<String>, fingerprint: impl Into<String>) {
        self.fingerprints.insert(cert_id.into(), fingerprint.into());
    }

    /// Whether a server fingerprint calls for a download
    ///
    /// A certificate without material (empty fingerprint) never does.
    pub fn needs_update(&self, cert_id: &str, server_fingerprint: &str) -> bool {
        !server_fingerprint.is_empty() && self.fingerprint(cert_id) != Some(server_fingerprint)
    }

    /// Number of tracked certificates
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// On-disk home of [`LocalState`]
#[derive(Debug, Clone)]
pub struct LocalStateFile {
    file: JsonSnapshotFile,
}

impl LocalStateFile {
    /// Open (but do not read) the state file at `path`
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: JsonSnapshotFile::open(path).await?,
        })
    }

    /// Read the state
    ///
    /// A missing file, or a corrupt one without a usable backup, yields an
    /// empty state: the only cost is downloading every certificate again.
    pub async fn load(&self) -> Result<LocalState> {
        match self.file.load_with_recovery().await {
            Err(Error::Json(e)) => {
                warn!(
                    path = %self.file.path().display(),
                    error = %e,
                    "Local state unreadable, starting empty"
                );
                Ok(LocalState::default())
            }
            other => other,
        }
    }

    /// Persist the state
    pub async fn save(&self, state: &LocalState) -> Result<()> {
        self.file.write(state).await
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_needs_update() {
        let mut state = LocalState::default();
        assert!(state.needs_update("c1", "aa"));
        assert!(!state.needs_update("c1", ""));

        state.set_fingerprint("c1", "aa");
        assert!(!state.needs_update("c1", "aa"));
        assert!(state.needs_update("c1", "bb"));
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let file = LocalStateFile::open(dir.path().join("agent/state.json"))
            .await
            .unwrap();
        assert!(file.load().await.unwrap().is_empty());

        let mut state = LocalState::default();
        state.set_fingerprint("c1", "aa");
        file.save(&state).await.unwrap();

        let reopened = LocalStateFile::open(file.path()).await.unwrap();
        assert_eq!(reopened.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_corrupt_file_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let file = LocalStateFile::open(dir.path().join("state.json")).await.unwrap();

        let mut state = LocalState::default();
        state.set_fingerprint("c1", "aa");
        file.save(&state).await.unwrap();
        file.save(&state).await.unwrap();
        tokio::fs::write(file.path(), "{ not json").await.unwrap();

        assert_eq!(file.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_unrecoverable_file_starts_empty() {
        let dir = tempdir().unwrap();
        let file = LocalStateFile::open(dir.path().join("state.json")).await.unwrap();

        let mut state = LocalState::default();
        state.set_fingerprint("c1", "aa");
        file.save(&state).await.unwrap();
        tokio::fs::write(file.path(), "{ not json").await.unwrap();

        assert!(file.load().await.unwrap().is_empty());
    }
}
