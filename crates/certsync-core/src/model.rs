//! Lifecycle data model
//!
//! These are the records the [`LifecycleStore`](crate::traits::LifecycleStore)
//! persists and the scheduler, coordinator and agent protocol mutate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::material::IssuedCertificate;

/// Challenge type used to prove domain control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChallengeType {
    /// TXT record under `_acme-challenge.<domain>`
    #[default]
    #[serde(rename = "dns-01")]
    Dns01,
    /// Placeholder only; issuance refuses it
    #[serde(rename = "http-01")]
    Http01,
}

/// Certificate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    /// Requested but never issued
    Pending,
    /// Material present and not expired
    Active,
    /// Material present but past its `expires_at`
    Expired,
    /// No usable material and the last attempt failed
    Error,
}

/// Where a certificate sits in the renewal state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// Nothing to do
    Current,
    /// Within the renewal window (or never issued)
    Due,
    /// Failed before; deferred until `next_retry_at`
    Retrying,
}

/// A managed certificate and its renewal bookkeeping
#[derive(Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// Certificate ID
    pub id: String,
    /// Primary domain (also the DNS zone challenges are written to)
    pub domain: String,
    /// Subject alternative names, in request order
    #[serde(default)]
    pub san: Vec<String>,
    /// Private key PEM
    #[serde(default)]
    pub key_pem: String,
    /// Leaf certificate PEM
    #[serde(default)]
    pub cert_pem: String,
    /// Issuer chain PEM (everything after the leaf)
    #[serde(default)]
    pub ca_pem: String,
    /// Leaf followed by the issuer chain
    #[serde(default)]
    pub fullchain_pem: String,
    /// SHA-256 hex of `fullchain_pem`; empty until first issuance
    #[serde(default)]
    pub fingerprint: String,
    /// Parsed from the issued leaf
    pub issued_at: Option<DateTime<Utc>>,
    /// Parsed from the issued leaf
    pub expires_at: Option<DateTime<Utc>>,
    /// Challenge type
    #[serde(default)]
    pub challenge_type: ChallengeType,
    /// Weak reference to a [`DnsProviderRecord`]
    pub dns_provider_id: String,
    /// Current status
    pub status: CertificateStatus,
    /// Consecutive failed attempts
    #[serde(default)]
    pub fail_count: u32,
    /// Earliest time the retry sweep picks this certificate up again
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Start time of the most recent attempt
    pub last_renew_attempt: Option<DateTime<Utc>>,
    /// Message of the most recent failure
    pub last_error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Certificate {
    /// Create a new, never-issued certificate record
    pub fn new(
        domain: impl Into<String>,
        san: Vec<String>,
        dns_provider_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            domain: domain.into(),
            san,
            key_pem: String::new(),
            cert_pem: String::new(),
            ca_pem: String::new(),
            fullchain_pem: String::new(),
            fingerprint: String::new(),
            issued_at: None,
            expires_at: None,
            challenge_type: ChallengeType::Dns01,
            dns_provider_id: dns_provider_id.into(),
            status: CertificateStatus::Pending,
            fail_count: 0,
            next_retry_at: None,
            last_renew_attempt: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Domain followed by SANs, duplicates removed, request order kept
    pub fn identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.san.len() + 1);
        for name in std::iter::once(&self.domain).chain(self.san.iter()) {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Whether certificate material has ever been issued
    pub fn has_material(&self) -> bool {
        !self.fingerprint.is_empty()
    }

    /// Whether the certificate should be renewed by the daily sweep
    pub fn is_due(&self, now: DateTime<Utc>, renew_before_days: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now <= Duration::days(renew_before_days),
            None => true,
        }
    }

    /// Whether the retry sweep should pick this certificate up
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.fail_count > 0 && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Classify the certificate for the scheduler
    pub fn renewal_state(&self, now: DateTime<Utc>, renew_before_days: i64) -> RenewalState {
        if self.fail_count > 0 && self.next_retry_at.is_some_and(|at| at > now) {
            RenewalState::Retrying
        } else if self.is_due(now, renew_before_days) || self.is_retry_due(now) {
            RenewalState::Due
        } else {
            RenewalState::Current
        }
    }

    /// Replace the material with a freshly issued bundle and reset retry state
    pub fn apply_issued(&mut self, issued: &IssuedCertificate, now: DateTime<Utc>) {
        self.key_pem = issued.key_pem.clone();
        self.cert_pem = issued.cert_pem.clone();
        self.ca_pem = issued.ca_pem.clone();
        self.fullchain_pem = issued.fullchain_pem.clone();
        self.fingerprint = issued.fingerprint.clone();
        self.issued_at = Some(issued.issued_at);
        self.expires_at = Some(issued.expires_at);
        self.status = CertificateStatus::Active;
        self.fail_count = 0;
        self.next_retry_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Record a failed attempt that started at `attempt_at`
    ///
    /// A certificate whose current material is still valid keeps serving as
    /// `active`; otherwise it drops to `expired` or `error`.
    pub fn record_failure(
        &mut self,
        attempt_at: DateTime<Utc>,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.next_retry_at = Some(next_retry_at);
        self.last_error = Some(error.to_string());
        self.status = match (self.has_material(), self.expires_at) {
            (true, Some(expires_at)) if expires_at > attempt_at => CertificateStatus::Active,
            (true, _) => CertificateStatus::Expired,
            (false, _) => CertificateStatus::Error,
        };
        self.updated_at = attempt_at;
    }
}

// Private key material never goes to logs
impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("san", &self.san)
            .field("key_pem", &"<REDACTED>")
            .field("fingerprint", &self.fingerprint)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("dns_provider_id", &self.dns_provider_id)
            .field("status", &self.status)
            .field("fail_count", &self.fail_count)
            .field("next_retry_at", &self.next_retry_at)
            .finish()
    }
}

/// Supported DNS provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderType {
    /// Cloudflare API v4
    Cloudflare,
    /// Alibaba Cloud DNS
    Aliyun,
    /// DNSPod
    Dnspod,
    /// AWS Route 53
    Route53,
    /// GoDaddy
    Godaddy,
}

impl DnsProviderType {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloudflare => "cloudflare",
            Self::Aliyun => "aliyun",
            Self::Dnspod => "dnspod",
            Self::Route53 => "route53",
            Self::Godaddy => "godaddy",
        }
    }
}

impl fmt::Display for DnsProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured DNS provider account
///
/// `credentials` is handed over decrypted by the store; the at-rest blob is
/// the store's business.
#[derive(Clone, Serialize, Deserialize)]
pub struct DnsProviderRecord {
    /// Provider ID (referenced by [`Certificate::dns_provider_id`])
    pub id: String,
    /// Unique display name
    pub name: String,
    /// Type discriminator used to pick a factory
    pub provider_type: DnsProviderType,
    /// Provider-specific credentials
    pub credentials: serde_json::Value,
}

impl DnsProviderRecord {
    /// Create a provider record
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider_type: DnsProviderType,
        credentials: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider_type,
            credentials,
        }
    }
}

impl fmt::Debug for DnsProviderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsProviderRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("credentials", &"<REDACTED>")
            .finish()
    }
}

/// Agent liveness, derived from `last_seen`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Never sent a heartbeat
    Pending,
    /// Heartbeat seen recently
    Online,
    /// Heartbeat overdue
    Offline,
}

/// A remote host pulling certificates
#[derive(Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Agent identity
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Hex HMAC-SHA256 of `id`, part of the agent's connection path
    pub signature: String,
    /// Recommended seconds between poll cycles
    pub poll_interval_secs: u64,
    /// Time of the last heartbeat
    pub last_seen: Option<DateTime<Utc>>,
    /// Address reported by the last heartbeat
    pub ip: Option<String>,
    /// Agent version reported by the last heartbeat
    pub version: Option<String>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Derive liveness from `last_seen`
    ///
    /// An agent is online while its last heartbeat is younger than
    /// `offline_after_multiplier` poll intervals.
    pub fn status(&self, now: DateTime<Utc>, offline_after_multiplier: u32) -> AgentStatus {
        let Some(last_seen) = self.last_seen else {
            return AgentStatus::Pending;
        };
        let grace = Duration::seconds(
            (self.poll_interval_secs.max(1) as i64).saturating_mul(offline_after_multiplier as i64),
        );
        if now - last_seen <= grace {
            AgentStatus::Online
        } else {
            AgentStatus::Offline
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("signature", &"<REDACTED>")
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("last_seen", &self.last_seen)
            .field("ip", &self.ip)
            .field("version", &self.version)
            .finish()
    }
}

/// Target filenames for the deployed bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping {
    /// Leaf certificate file
    #[serde(default = "default_cert_file")]
    pub cert: String,
    /// Private key file
    #[serde(default = "default_key_file")]
    pub key: String,
    /// Full chain file
    #[serde(default = "default_fullchain_file")]
    pub fullchain: String,
}

impl Default for FileMapping {
    fn default() -> Self {
        Self {
            cert: default_cert_file(),
            key: default_key_file(),
            fullchain: default_fullchain_file(),
        }
    }
}

fn default_cert_file() -> String {
    "cert.pem".to_string()
}

fn default_key_file() -> String {
    "key.pem".to_string()
}

fn default_fullchain_file() -> String {
    "fullchain.pem".to_string()
}

/// Per-binding deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not reported yet
    Pending,
    /// Agent deployed the current fingerprint
    Synced,
    /// Last deployment attempt failed
    Failed,
}

/// Binding of one agent to one certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCert {
    /// Bound agent
    pub agent_id: Uuid,
    /// Bound certificate
    pub cert_id: String,
    /// Directory the agent writes into
    pub deploy_path: String,
    /// Filenames inside `deploy_path`
    #[serde(default)]
    pub file_mapping: FileMapping,
    /// Command run after deployment
    pub reload_cmd: Option<String>,
    /// Time of the last status report
    pub last_sync: Option<DateTime<Utc>>,
    /// Fingerprint the agent last reported
    pub last_fingerprint: Option<String>,
    /// Status the agent last reported
    pub sync_status: SyncStatus,
}

impl AgentCert {
    /// Create a new binding
    pub fn new(agent_id: Uuid, cert_id: impl Into<String>, deploy_path: impl Into<String>) -> Self {
        Self {
            agent_id,
            cert_id: cert_id.into(),
            deploy_path: deploy_path.into(),
            file_mapping: FileMapping::default(),
            reload_cmd: None,
            last_sync: None,
            last_fingerprint: None,
            sync_status: SyncStatus::Pending,
        }
    }

    /// Set the file mapping
    pub fn with_file_mapping(mut self, file_mapping: FileMapping) -> Self {
        self.file_mapping = file_mapping;
        self
    }

    /// Set the reload command
    pub fn with_reload_cmd(mut self, reload_cmd: impl Into<String>) -> Self {
        self.reload_cmd = Some(reload_cmd.into());
        self
    }

    /// The agent needs to redeploy iff its last fingerprint differs
    pub fn is_stale(&self, current_fingerprint: &str) -> bool {
        self.last_fingerprint.as_deref() != Some(current_fingerprint)
    }
}

/// Terminal (or running) status of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Attempt in flight
    Running,
    /// Attempt succeeded
    Completed,
    /// Attempt failed
    Failed,
}

impl TaskStatus {
    /// Whether the status can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// What kind of attempt a task records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// First issuance
    Issue,
    /// Renewal of existing material
    Renew,
}

/// Status row of one issuance/renewal attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogStatus {
    /// Generated task ID
    pub task_id: String,
    /// Certificate the attempt was for
    pub cert_id: String,
    /// Issue or renew
    pub kind: TaskKind,
    /// Current status
    pub status: TaskStatus,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Set together with a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message, if failed
    pub error: Option<String>,
}

impl TaskLogStatus {
    /// Start a new running task
    pub fn start(cert_id: impl Into<String>, kind: TaskKind, now: DateTime<Utc>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            cert_id: cert_id.into(),
            kind,
            status: TaskStatus::Running,
            started_at: now,
            finished_at: None,
            error: None,
        }
    }
}

/// One free-text progress line of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    /// Owning task
    pub task_id: String,
    /// Time the line was appended
    pub at: DateTime<Utc>,
    /// Progress message
    pub message: String,
}
