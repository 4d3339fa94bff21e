//! Renewal scheduler
//!
//! The RenewalScheduler is responsible for:
//! - Selecting certificates that need issuance or renewal
//! - Running each attempt through the [`ChallengeCoordinator`]
//! - Persisting success/failure bookkeeping and exponential backoff
//! - Writing one task log and sending one notification per attempt
//!
//! ## Triggers
//!
//! ```text
//!  daily tick ──► daily_sweep ──┐
//!                               ├──► attempt(cert) ──► ChallengeCoordinator
//!  retry tick ──► retry_sweep ──┤
//!                               │
//!  operator ────► issue ────────┘
//! ```
//!
//! Sweeps walk their certificates one at a time. A failure is recorded on
//! the certificate and the sweep moves on.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::challenge::ChallengeCoordinator;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::material::IssuedCertificate;
use crate::model::{Certificate, CertificateStatus, TaskKind, TaskLogStatus, TaskStatus};
use crate::traits::{LifecycleStore, Notifier};

/// Retry delay indexed by consecutive-failure count (1-based, capped at the last entry)
pub const BACKOFF_SCHEDULE: [Duration; 7] = [
    Duration::from_secs(10 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
    Duration::from_secs(4 * 60 * 60),
    Duration::from_secs(8 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

/// Retry delay after `fail_count` consecutive failures
///
/// `backoff(0)` and `backoff(1)` are both the first entry; every count past
/// the end of the table gets the last one.
pub fn backoff(fail_count: u32) -> Duration {
    let index = fail_count.clamp(1, BACKOFF_SCHEDULE.len() as u32) as usize - 1;
    BACKOFF_SCHEDULE[index]
}

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// What started an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Operator request
    Manual,
    /// Daily expiry sweep
    DailySweep,
    /// Retry sweep
    RetrySweep,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::DailySweep => "daily sweep",
            Self::RetrySweep => "retry sweep",
        })
    }
}

/// Result of one attempt, after bookkeeping was persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// New material applied
    Issued {
        /// Fingerprint of the new bundle
        fingerprint: String,
        /// Expiry of the new leaf
        expires_at: DateTime<Utc>,
    },
    /// Attempt failed; retry scheduled
    Failed {
        /// Consecutive failures including this one
        fail_count: u32,
        /// When the retry sweep picks the certificate up again
        next_retry_at: DateTime<Utc>,
        /// Failure message
        error: String,
    },
}

/// Counters of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Certificates flipped from active to expired
    pub expired_marked: usize,
    /// Attempts started
    pub attempted: usize,
    /// Attempts that issued a certificate
    pub succeeded: usize,
    /// Attempts that failed
    pub failed: usize,
    /// Certificates skipped because an attempt was already running
    pub skipped: usize,
}

/// Events emitted by the RenewalScheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Scheduler loop started
    Started,
    /// A sweep finished
    SweepCompleted {
        /// Which sweep
        trigger: Trigger,
        /// Counters
        report: SweepReport,
    },
    /// A certificate was issued or renewed
    Issued {
        /// Certificate ID
        cert_id: String,
        /// Primary domain
        domain: String,
    },
    /// An attempt failed
    Failed {
        /// Certificate ID
        cert_id: String,
        /// Primary domain
        domain: String,
        /// Consecutive failures
        fail_count: u32,
    },
    /// Scheduler loop stopped
    Stopped {
        /// Why
        reason: String,
    },
}

/// Time-driven renewal orchestrator
pub struct RenewalScheduler {
    store: Arc<dyn LifecycleStore>,
    coordinator: Arc<ChallengeCoordinator>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl RenewalScheduler {
    /// Create a new scheduler
    ///
    /// # Returns
    ///
    /// A tuple of (scheduler, event_receiver) where event_receiver yields scheduler events
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        coordinator: Arc<ChallengeCoordinator>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Result<(Self, mpsc::Receiver<SchedulerEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let scheduler = Self {
            store,
            coordinator,
            notifier,
            clock,
            config,
            event_tx: tx,
        };

        Ok((scheduler, rx))
    }

    /// Run both sweeps on their intervals until SIGINT
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run both sweeps on their intervals until `shutdown_rx` fires
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        self.run_internal(Some(shutdown_rx)).await
    }

    async fn run_internal(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.emit_event(SchedulerEvent::Started);
        info!(
            renew_before_days = self.config.renew_before_days,
            "Renewal scheduler started"
        );

        // Both intervals fire immediately, so startup runs one of each sweep
        let mut daily = tokio::time::interval(self.config.daily_sweep_interval());
        let mut retry = tokio::time::interval(self.config.retry_sweep_interval());
        daily.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    self.emit_event(SchedulerEvent::Stopped {
                        reason: "Shutdown signal".to_string(),
                    });
                    break;
                }

                _ = daily.tick() => {
                    if let Err(e) = self.daily_sweep().await {
                        error!("Daily sweep failed: {}", e);
                    }
                }

                _ = retry.tick() => {
                    if let Err(e) = self.retry_sweep().await {
                        error!("Retry sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Renewal scheduler stopped");
        Ok(())
    }

    /// Operator-requested issuance (or renewal) of one certificate
    pub async fn issue(&self, cert_id: &str) -> Result<AttemptOutcome> {
        self.attempt(cert_id, Trigger::Manual).await
    }

    /// Mark lapsed certificates expired, then renew everything within the window
    pub async fn daily_sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired_marked = self.mark_expired(now).await?;

        let due = self
            .store
            .certs_expiring_within(self.config.renew_before_days, now)
            .await?;
        debug!(count = due.len(), "Daily sweep selected certificates");

        let mut report = self.sweep(due, Trigger::DailySweep).await;
        report.expired_marked = expired_marked;
        self.emit_event(SchedulerEvent::SweepCompleted {
            trigger: Trigger::DailySweep,
            report: report.clone(),
        });
        Ok(report)
    }

    /// Retry every certificate whose backoff has elapsed
    pub async fn retry_sweep(&self) -> Result<SweepReport> {
        let due = self.store.certs_due_for_retry(self.clock.now()).await?;
        debug!(count = due.len(), "Retry sweep selected certificates");

        let report = self.sweep(due, Trigger::RetrySweep).await;
        self.emit_event(SchedulerEvent::SweepCompleted {
            trigger: Trigger::RetrySweep,
            report: report.clone(),
        });
        Ok(report)
    }

    async fn sweep(&self, certs: Vec<Certificate>, trigger: Trigger) -> SweepReport {
        let mut report = SweepReport::default();

        for cert in certs {
            match self.attempt(&cert.id, trigger).await {
                Ok(AttemptOutcome::Issued { .. }) => {
                    report.attempted += 1;
                    report.succeeded += 1;
                }
                Ok(AttemptOutcome::Failed { .. }) => {
                    report.attempted += 1;
                    report.failed += 1;
                }
                Err(Error::IssuanceInProgress(_)) => {
                    debug!(cert_id = %cert.id, "Attempt already running, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(cert_id = %cert.id, error = %e, "Attempt bookkeeping failed");
                    report.attempted += 1;
                    report.failed += 1;
                }
            }
        }

        info!(
            trigger = %trigger,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Sweep completed"
        );
        report
    }

    /// The single per-certificate routine behind every trigger
    ///
    /// Issuance failures are recorded and returned as
    /// [`AttemptOutcome::Failed`]; `Err` means the attempt could not run or
    /// its bookkeeping could not be stored.
    pub async fn attempt(&self, cert_id: &str, trigger: Trigger) -> Result<AttemptOutcome> {
        self.store.try_begin_issuance(cert_id).await?;
        let result = self.attempt_locked(cert_id, trigger).await;
        if let Err(e) = self.store.end_issuance(cert_id).await {
            warn!(cert_id, error = %e, "Failed to release issuance slot");
        }
        result
    }

    async fn attempt_locked(&self, cert_id: &str, trigger: Trigger) -> Result<AttemptOutcome> {
        let mut cert = self.load(cert_id).await?;

        let attempt_at = self.clock.now();
        cert.last_renew_attempt = Some(attempt_at);
        cert.updated_at = attempt_at;
        self.store.update_certificate(&cert).await?;

        let kind = if cert.has_material() {
            TaskKind::Renew
        } else {
            TaskKind::Issue
        };
        let task = TaskLogStatus::start(&cert.id, kind, attempt_at);
        self.store.begin_task(&task).await?;
        self.log_task(&task.task_id, &format!("Attempt triggered by {}", trigger))
            .await;

        info!(cert_id = %cert.id, domain = %cert.domain, trigger = %trigger, "Starting attempt");

        // From here on every error ends as a failed attempt
        let result = match self.coordinator.obtain(&cert, Some(&task.task_id)).await {
            Ok(issued) => self.store_issued(cert_id, &issued).await.map(|()| issued),
            Err(e) => Err(e),
        };

        match result {
            Ok(issued) => {
                self.finish_task(&task.task_id, TaskStatus::Completed, None)
                    .await;

                self.notify(
                    &format!("Certificate renewed: {}", cert.domain),
                    &format!(
                        "Certificate for {} was issued. Expires at {}. Fingerprint {}.",
                        cert.domain, issued.expires_at, issued.fingerprint
                    ),
                )
                .await;
                self.emit_event(SchedulerEvent::Issued {
                    cert_id: cert.id.clone(),
                    domain: cert.domain.clone(),
                });

                Ok(AttemptOutcome::Issued {
                    fingerprint: issued.fingerprint,
                    expires_at: issued.expires_at,
                })
            }
            Err(e) => {
                self.record_attempt_failure(&cert, attempt_at, &task.task_id, e)
                    .await
            }
        }
    }

    /// Apply new material to the current record in one update
    async fn store_issued(&self, cert_id: &str, issued: &IssuedCertificate) -> Result<()> {
        let mut current = self.load(cert_id).await?;
        current.apply_issued(issued, self.clock.now());
        self.store.update_certificate(&current).await.map_err(|e| {
            Error::state_store(format!("Failed to store issued certificate: {}", e))
        })
    }

    /// Failure bookkeeping, task status and notification for a failed attempt
    ///
    /// The task is finished and the notification sent even when the
    /// bookkeeping itself cannot be stored; that store error is returned
    /// afterwards.
    async fn record_attempt_failure(
        &self,
        cert: &Certificate,
        attempt_at: DateTime<Utc>,
        task_id: &str,
        error: Error,
    ) -> Result<AttemptOutcome> {
        let message = error.to_string();
        let mut current = match self.load(&cert.id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(cert_id = %cert.id, error = %e, "Reload before failure bookkeeping failed");
                cert.clone()
            }
        };
        let fail_count = current.fail_count.saturating_add(1);
        let next_retry_at = attempt_at + chrono_duration(backoff(fail_count));
        current.record_failure(attempt_at, &message, next_retry_at);

        let stored = self.store.update_certificate(&current).await;
        if let Err(e) = &stored {
            error!(cert_id = %current.id, error = %e, "Failed to store failure bookkeeping");
        }
        self.finish_task(task_id, TaskStatus::Failed, Some(message.clone()))
            .await;

        warn!(
            cert_id = %current.id,
            domain = %current.domain,
            fail_count,
            retryable = error.is_retryable(),
            next_retry_at = %next_retry_at,
            "Attempt failed: {}",
            message
        );
        self.notify(
            &format!("Certificate renewal failed: {}", current.domain),
            &format!(
                "Renewal of {} failed ({} consecutive failure(s)): {}. Next retry at {}.",
                current.domain, fail_count, message, next_retry_at
            ),
        )
        .await;
        self.emit_event(SchedulerEvent::Failed {
            cert_id: current.id.clone(),
            domain: current.domain.clone(),
            fail_count,
        });

        stored?;
        Ok(AttemptOutcome::Failed {
            fail_count,
            next_retry_at,
            error: message,
        })
    }

    async fn mark_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut marked = 0;
        for mut cert in self.store.list_certificates().await? {
            let lapsed = cert.expires_at.is_some_and(|at| at <= now);
            if cert.status == CertificateStatus::Active && cert.has_material() && lapsed {
                cert.status = CertificateStatus::Expired;
                cert.updated_at = now;
                self.store.update_certificate(&cert).await?;
                warn!(cert_id = %cert.id, domain = %cert.domain, "Certificate expired");
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn load(&self, cert_id: &str) -> Result<Certificate> {
        self.store
            .get_certificate(cert_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("certificate {}", cert_id)))
    }

    async fn log_task(&self, task_id: &str, message: &str) {
        if let Err(e) = self
            .store
            .append_task_log(task_id, message, self.clock.now())
            .await
        {
            warn!(task_id, error = %e, "Failed to append task log");
        }
    }

    async fn finish_task(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        if let Err(e) = self
            .store
            .finish_task(task_id, status, error, self.clock.now())
            .await
        {
            error!(task_id, error = %e, "Failed to finish task");
        }
    }

    async fn notify(&self, title: &str, body: &str) {
        if let Err(e) = self.notifier.send(title, body).await {
            warn!(error = %e, "Notification failed");
        }
    }

    fn emit_event(&self, event: SchedulerEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("Event channel full, dropping scheduler event");
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs() as i64)
}
