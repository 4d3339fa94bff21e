//! The agent poll loop

use certsync_core::Result;
use certsync_core::agent::{AgentCertConfig, HeartbeatRequest, StatusReport};
use certsync_core::model::SyncStatus;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client::ServerApi;
use crate::deploy::deploy_bundle;
use crate::reload::Reloader;
use crate::state::{LocalState, LocalStateFile};

/// Poll interval used until the server says otherwise
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Certificates downloaded and written
    pub updated: usize,
    /// Certificates already at the server's fingerprint
    pub unchanged: usize,
    /// Certificates whose download or write failed
    pub failed: usize,
    /// Certificates without material yet
    pub skipped: usize,
    /// Distinct reload commands executed
    pub reloads: usize,
}

/// Drives poll cycles against one server
pub struct AgentRunner {
    api: Arc<dyn ServerApi>,
    reloader: Arc<dyn Reloader>,
    state_file: LocalStateFile,
    state: LocalState,
    /// In-memory state not yet on disk
    unsaved: bool,
    poll_interval: Duration,
    version: String,
}

impl AgentRunner {
    /// Create a runner, loading previously deployed fingerprints
    pub async fn new(
        api: Arc<dyn ServerApi>,
        reloader: Arc<dyn Reloader>,
        state_file: LocalStateFile,
    ) -> Result<Self> {
        let state = state_file.load().await?;
        debug!(
            tracked = state.len(),
            path = %state_file.path().display(),
            "Local state loaded"
        );
        Ok(Self {
            api,
            reloader,
            state_file,
            state,
            unsaved: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Current poll interval
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Deployed fingerprints
    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Run one poll cycle
    ///
    /// Fails only when the config cannot be fetched; per-certificate, state
    /// file, reload, report and heartbeat failures are logged and reflected
    /// in the returned [`CycleReport`]. Files already deployed are always
    /// followed by their reloads, and a state file that could not be written
    /// is retried on the next cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let config = self.api.config().await?;

        let interval = Duration::from_secs(config.poll_interval);
        if config.poll_interval > 0 && interval != self.poll_interval {
            info!(
                from = self.poll_interval.as_secs(),
                to = config.poll_interval,
                "Adopting poll interval from server"
            );
            self.poll_interval = interval;
        }

        let mut report = CycleReport::default();
        let mut statuses = Vec::with_capacity(config.certs.len());
        let mut reload_commands: Vec<String> = Vec::new();
        let mut state_changed = false;

        for cert in &config.certs {
            if cert.fingerprint.is_empty() {
                debug!(cert_id = %cert.id, domain = %cert.domain, "No material yet, skipping");
                report.skipped += 1;
                continue;
            }

            if !self.state.needs_update(&cert.id, &cert.fingerprint) {
                report.unchanged += 1;
                statuses.push(StatusReport {
                    cert_id: cert.id.clone(),
                    fingerprint: cert.fingerprint.clone(),
                    status: SyncStatus::Synced,
                });
                continue;
            }

            match self.update(cert).await {
                Ok(fingerprint) => {
                    info!(cert_id = %cert.id, domain = %cert.domain, "Certificate deployed");
                    self.state.set_fingerprint(&cert.id, &fingerprint);
                    state_changed = true;
                    report.updated += 1;
                    statuses.push(StatusReport {
                        cert_id: cert.id.clone(),
                        fingerprint,
                        status: SyncStatus::Synced,
                    });
                    if let Some(cmd) = cert.reload_cmd.as_deref().map(str::trim)
                        && !cmd.is_empty()
                        && !reload_commands.iter().any(|c| c == cmd)
                    {
                        reload_commands.push(cmd.to_string());
                    }
                }
                Err(e) => {
                    error!(cert_id = %cert.id, domain = %cert.domain, "Deployment failed: {}", e);
                    report.failed += 1;
                    statuses.push(StatusReport {
                        cert_id: cert.id.clone(),
                        fingerprint: self.state.fingerprint(&cert.id).unwrap_or_default().to_string(),
                        status: SyncStatus::Failed,
                    });
                }
            }
        }

        if state_changed || self.unsaved {
            match self.state_file.save(&self.state).await {
                Ok(()) => self.unsaved = false,
                Err(e) => {
                    error!(
                        path = %self.state_file.path().display(),
                        "Failed to save local state: {}", e
                    );
                    self.unsaved = true;
                }
            }
        }

        for cmd in &reload_commands {
            match self.reloader.reload(cmd).await {
                Ok(()) => info!(command = %cmd, "Reload command succeeded"),
                Err(e) => warn!(command = %cmd, "Reload command failed: {}", e),
            }
            report.reloads += 1;
        }

        if !statuses.is_empty()
            && let Err(e) = self.api.report_status(&statuses).await
        {
            warn!("Status report failed: {}", e);
        }

        let heartbeat = HeartbeatRequest {
            ip: self.api.local_ip().await,
            version: Some(self.version.clone()),
        };
        if let Err(e) = self.api.heartbeat(&heartbeat).await {
            warn!("Heartbeat failed: {}", e);
        }

        info!(
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            skipped = report.skipped,
            reloads = report.reloads,
            "Poll cycle complete"
        );
        Ok(report)
    }

    /// Download and write one certificate, returning the deployed fingerprint
    async fn update(&self, cert: &AgentCertConfig) -> Result<String> {
        let bundle = self.api.cert_bundle(&cert.id).await?;
        if bundle.fingerprint != cert.fingerprint {
            debug!(
                cert_id = %cert.id,
                "Certificate changed between config and download; deploying the newer bundle"
            );
        }
        deploy_bundle(Path::new(&cert.deploy_path), &cert.file_mapping, &bundle).await?;
        Ok(bundle.fingerprint)
    }

    /// Poll until `shutdown_rx` fires
    ///
    /// A cycle in progress always finishes; the signal is only observed
    /// between cycles.
    pub async fn run_with_shutdown(
        &mut self,
        mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Agent started");
        loop {
            if let Err(e) = self.run_cycle().await {
                error!("Poll cycle failed: {}", e);
            }

            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("Agent stopped");
        Ok(())
    }
}
