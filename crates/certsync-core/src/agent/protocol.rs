//! Agent protocol wire types
//!
//! Shared by the server router and the agent client so both ends agree on
//! the JSON shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{CertificateStatus, FileMapping, SyncStatus};

/// `GET /agent/{uuid}/{signature}/config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigResponse {
    /// Agent display name
    pub name: String,
    /// Seconds between poll cycles; the agent adopts changes
    pub poll_interval: u64,
    /// Desired state of every bound certificate
    pub certs: Vec<AgentCertConfig>,
}

/// Desired state of one bound certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCertConfig {
    /// Certificate ID
    pub id: String,
    /// Primary domain
    pub domain: String,
    /// Current fingerprint (empty until first issuance)
    pub fingerprint: String,
    /// Directory to deploy into
    pub deploy_path: String,
    /// Target filenames
    #[serde(default)]
    pub file_mapping: FileMapping,
    /// Command to run after deployment
    #[serde(default)]
    pub reload_cmd: Option<String>,
}

/// `GET /agent/{uuid}/{signature}/certs` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertMetadata {
    /// Certificate ID
    pub id: String,
    /// Primary domain
    pub domain: String,
    /// Subject alternative names
    pub san: Vec<String>,
    /// Current fingerprint
    pub fingerprint: String,
    /// Certificate status
    pub status: CertificateStatus,
    /// Leaf expiry
    pub expires_at: Option<DateTime<Utc>>,
}

/// `GET /agent/{uuid}/{signature}/cert/{cert_id}`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertBundle {
    /// Certificate ID
    pub id: String,
    /// Primary domain
    pub domain: String,
    /// SHA-256 hex of `fullchain`
    pub fingerprint: String,
    /// Leaf certificate PEM
    pub cert: String,
    /// Private key PEM
    pub key: String,
    /// Issuer chain PEM
    pub ca: String,
    /// Full chain PEM
    pub fullchain: String,
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("fingerprint", &self.fingerprint)
            .field("key", &"<REDACTED>")
            .finish()
    }
}

/// `POST /agent/{uuid}/{signature}/heartbeat` body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Address the agent reports for itself
    #[serde(default)]
    pub ip: Option<String>,
    /// Agent version
    #[serde(default)]
    pub version: Option<String>,
}

/// One entry of the `POST /agent/{uuid}/{signature}/status` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Certificate ID
    pub cert_id: String,
    /// Fingerprint now deployed on the host
    pub fingerprint: String,
    /// Deployment outcome
    pub status: SyncStatus,
}
