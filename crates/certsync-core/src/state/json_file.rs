// # JSON Snapshot File
//
// Whole-document JSON persistence with crash recovery, shared by the
// server-side `FileLifecycleStore` and the agent's local fingerprint state.
//
// ## Crash Recovery
//
// - Atomic writes: write `<path>.tmp`, then rename over `<path>`
// - Automatic backup: the previous file is copied to `<path>.backup` first
// - Corruption detection: a JSON parse failure on load
// - Recovery: falls back to the backup and restores it over the main file
// - A corrupt file without a usable backup is an error; it is never
//   replaced by an empty document
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   ...document fields...
// }
// ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Error;

/// Snapshot format version
const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Serialize)]
struct SnapshotRef<'a, T> {
    version: &'a str,
    #[serde(flatten)]
    data: &'a T,
}

#[derive(Deserialize)]
struct SnapshotOwned<T> {
    version: String,
    #[serde(flatten)]
    data: T,
}

/// A JSON document on disk with write-then-rename and a `.backup` copy
#[derive(Debug, Clone)]
pub struct JsonSnapshotFile {
    path: PathBuf,
}

impl JsonSnapshotFile {
    /// Point at `path`, creating parent directories if needed
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::config(format!(
                        "Failed to create state directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        Ok(Self { path })
    }

    /// Path of the main file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, recovering from the backup if the main file is corrupt
    ///
    /// A missing file yields `T::default()`. A corrupt file with no usable
    /// backup is returned as the original `Error::Json` and left untouched.
    pub async fn load_with_recovery<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned + Default,
    {
        match Self::load(&self.path).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => {
                tracing::debug!("State file does not exist: {}", self.path.display());
                Ok(T::default())
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "State file {} appears corrupted: {}. Attempting recovery from backup.",
                    self.path.display(),
                    e
                );

                let backup_path = self.backup_path();
                match Self::load(&backup_path).await {
                    Ok(Some(data)) => {
                        tracing::info!("Recovered state from backup {}", backup_path.display());
                        if let Err(restore_err) = fs::copy(&backup_path, &self.path).await {
                            tracing::error!(
                                "Failed to restore state file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(data)
                    }
                    Ok(None) => {
                        tracing::error!(
                            "No backup of {} found; refusing to continue with empty state",
                            self.path.display()
                        );
                        Err(Error::Json(e))
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup {} also unusable: {}; refusing to continue with empty state",
                            backup_path.display(),
                            backup_err
                        );
                        Err(Error::Json(e))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write the document atomically, keeping the previous version as backup
    pub async fn write<T: Serialize>(&self, data: &T) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(&SnapshotRef {
            version: SNAPSHOT_VERSION,
            data,
        })
        .map_err(|e| Error::state_store(format!("Failed to serialize state: {}", e)))?;

        let temp_path = self.temp_path();
        {
            let mut file = Self::create_private(&temp_path).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.flush().await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to flush temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.sync_all().await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, self.backup_path()).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("State written to file: {}", self.path.display());
        Ok(())
    }

    /// Path of the backup copy
    pub fn backup_path(&self) -> PathBuf {
        let mut backup = self.path.clone();
        backup.set_extension("backup");
        backup
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    async fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::state_store(format!("Failed to read state file {}: {}", path.display(), e))
        })?;

        let snapshot: SnapshotOwned<T> = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. Attempting to load anyway.",
                SNAPSHOT_VERSION,
                snapshot.version
            );
        }

        Ok(Some(snapshot.data))
    }

    // The snapshot can hold private keys and provider credentials.
    #[cfg(unix)]
    async fn create_private(path: &Path) -> std::io::Result<fs::File> {
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .await
    }

    #[cfg(not(unix))]
    async fn create_private(path: &Path) -> std::io::Result<fs::File> {
        fs::File::create(path).await
    }
}
