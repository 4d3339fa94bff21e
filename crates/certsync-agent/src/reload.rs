//! Post-deployment reload commands

use async_trait::async_trait;
use certsync_core::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default bound on one reload command
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a reload command after certificates were deployed
#[async_trait]
pub trait Reloader: Send + Sync {
    /// Run `command`; non-zero exit or a timeout is an error
    async fn reload(&self, command: &str) -> Result<()>;
}

/// Runs commands through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellReloader {
    timeout: Duration,
}

impl ShellReloader {
    /// Reloader with a per-command timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellReloader {
    fn default() -> Self {
        Self::new(DEFAULT_RELOAD_TIMEOUT)
    }
}

#[async_trait]
impl Reloader for ShellReloader {
    async fn reload(&self, command: &str) -> Result<()> {
        debug!(command = %command, "Running reload command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to spawn '{}': {}", command, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::Other(format!(
                    "Reload command '{}' timed out after {:?}",
                    command, self.timeout
                ))
            })??;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Other(format!(
            "Reload command '{}' exited with {}: {}",
            command,
            output.status,
            stderr.trim()
        )))
    }
}
