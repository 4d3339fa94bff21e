//! Server side of the pull-based sync protocol
//!
//! Every method takes an already-authenticated [`Agent`]; see
//! [`AgentRegistry::authenticate`](super::AgentRegistry::authenticate).

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::protocol::{AgentCertConfig, AgentConfigResponse, CertBundle, CertMetadata, StatusReport};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{Agent, Certificate};
use crate::traits::LifecycleStore;

/// Answers agent config/cert/status requests
pub struct SyncService {
    store: Arc<dyn LifecycleStore>,
    clock: Arc<dyn Clock>,
}

impl SyncService {
    /// Create a sync service
    pub fn new(store: Arc<dyn LifecycleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Desired state for the agent
    pub async fn config(&self, agent: &Agent) -> Result<AgentConfigResponse> {
        let mut certs = Vec::new();
        for binding in self.store.bindings_for_agent(agent.id).await? {
            let Some(cert) = self.store.get_certificate(&binding.cert_id).await? else {
                warn!(agent_id = %agent.id, cert_id = %binding.cert_id, "Binding points at a missing certificate");
                continue;
            };
            certs.push(AgentCertConfig {
                id: cert.id,
                domain: cert.domain,
                fingerprint: cert.fingerprint,
                deploy_path: binding.deploy_path,
                file_mapping: binding.file_mapping,
                reload_cmd: binding.reload_cmd,
            });
        }

        Ok(AgentConfigResponse {
            name: agent.name.clone(),
            poll_interval: agent.poll_interval_secs,
            certs,
        })
    }

    /// Metadata of every certificate bound to the agent
    pub async fn certs(&self, agent: &Agent) -> Result<Vec<CertMetadata>> {
        let mut out = Vec::new();
        for binding in self.store.bindings_for_agent(agent.id).await? {
            if let Some(cert) = self.store.get_certificate(&binding.cert_id).await? {
                out.push(CertMetadata {
                    id: cert.id,
                    domain: cert.domain,
                    san: cert.san,
                    fingerprint: cert.fingerprint,
                    status: cert.status,
                    expires_at: cert.expires_at,
                });
            }
        }
        Ok(out)
    }

    /// Certificate bytes, only for certificates bound to the agent
    pub async fn cert_bundle(&self, agent: &Agent, cert_id: &str) -> Result<CertBundle> {
        if self.store.get_binding(agent.id, cert_id).await?.is_none() {
            return Err(Error::not_found(format!("certificate {}", cert_id)));
        }
        let cert = self
            .store
            .get_certificate(cert_id)
            .await?
            .filter(Certificate::has_material)
            .ok_or_else(|| Error::not_found(format!("certificate {}", cert_id)))?;

        debug!(agent_id = %agent.id, cert_id, "Serving certificate bundle");
        Ok(CertBundle {
            id: cert.id,
            domain: cert.domain,
            fingerprint: cert.fingerprint,
            cert: cert.cert_pem,
            key: cert.key_pem,
            ca: cert.ca_pem,
            fullchain: cert.fullchain_pem,
        })
    }

    /// Apply the agent's per-certificate outcomes to its bindings
    ///
    /// Returns the number of bindings updated; reports for unbound
    /// certificates are ignored.
    pub async fn report_status(&self, agent: &Agent, reports: &[StatusReport]) -> Result<usize> {
        let now = self.clock.now();
        let mut updated = 0;

        for report in reports {
            let recorded = self
                .store
                .record_sync(agent.id, &report.cert_id, &report.fingerprint, report.status, now)
                .await?;
            if !recorded {
                warn!(agent_id = %agent.id, cert_id = %report.cert_id, "Status report for unbound certificate");
                continue;
            }
            updated += 1;
        }

        info!(agent_id = %agent.id, updated, "Agent status reported");
        Ok(updated)
    }
}
