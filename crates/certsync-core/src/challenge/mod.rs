//! DNS-01 challenge coordinator
//!
//! Drives one ACME order from placement to certificate download:
//!
//! 1. order `[domain] ++ san` (deduplicated, order kept)
//! 2. publish `_acme-challenge.<name>` TXT records through the DNS provider
//! 3. wait for the records to become visible
//! 4. mark the challenges ready and poll the order until it is ready
//! 5. generate a fresh key + CSR, finalize, download the chain
//! 6. remove the TXT records (best-effort, always attempted)
//!
//! The coordinator never writes certificate material to the store; the
//! caller applies the returned [`IssuedCertificate`] in one update.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ChallengeConfig;
use crate::error::{Error, Result};
use crate::material::{self, IssuedCertificate};
use crate::model::{Certificate, ChallengeType};
use crate::registry::ProviderRegistry;
use crate::traits::{
    AcmeClient, AcmeOrder, AcmeOrderStatus, DnsChallengeProvider, LifecycleStore,
    PendingAuthorization, PropagationChecker,
};

/// Label prepended to every DNS-01 record name
pub const CHALLENGE_LABEL: &str = "_acme-challenge";

/// DNS-01 TXT value: `base64url_nopad(sha256(key_authorization))`
pub fn dns01_digest(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Record name for an identifier (`*.` stripped)
pub fn challenge_record_name(identifier: &str) -> String {
    format!("{}.{}", CHALLENGE_LABEL, strip_wildcard(identifier))
}

/// Zone challenges for `domain` are written to (`*.` stripped)
pub fn challenge_zone(domain: &str) -> &str {
    strip_wildcard(domain)
}

fn strip_wildcard(name: &str) -> &str {
    name.strip_prefix("*.").unwrap_or(name)
}

/// One TXT record published for the current attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    /// Zone
    pub zone: String,
    /// Fully qualified record name
    pub name: String,
    /// TXT value
    pub value: String,
}

/// Orchestrates ACME orders with DNS-01 validation
pub struct ChallengeCoordinator {
    store: Arc<dyn LifecycleStore>,
    registry: Arc<ProviderRegistry>,
    acme: Arc<dyn AcmeClient>,
    propagation: Arc<dyn PropagationChecker>,
    config: ChallengeConfig,
}

impl ChallengeCoordinator {
    /// Create a new coordinator
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        registry: Arc<ProviderRegistry>,
        acme: Arc<dyn AcmeClient>,
        propagation: Arc<dyn PropagationChecker>,
        config: ChallengeConfig,
    ) -> Self {
        Self {
            store,
            registry,
            acme,
            propagation,
            config,
        }
    }

    /// Issue a certificate for a stored certificate record
    pub async fn issue(&self, cert_id: &str) -> Result<IssuedCertificate> {
        let cert = self.load(cert_id).await?;
        self.obtain(&cert, None).await
    }

    /// Renew a stored certificate
    ///
    /// Renewal always uses a fresh order and a fresh key.
    pub async fn renew(&self, cert_id: &str) -> Result<IssuedCertificate> {
        let cert = self.load(cert_id).await?;
        self.obtain(&cert, None).await
    }

    /// Run the full protocol for `cert`, appending progress to `task_id`
    pub async fn obtain(
        &self,
        cert: &Certificate,
        task_id: Option<&str>,
    ) -> Result<IssuedCertificate> {
        if cert.challenge_type != ChallengeType::Dns01 {
            return Err(Error::invalid_input(format!(
                "Challenge type {:?} is not supported",
                cert.challenge_type
            )));
        }

        let provider_record = self
            .store
            .get_dns_provider(&cert.dns_provider_id)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!("DNS provider {}", cert.dns_provider_id))
            })?;
        let provider = self.registry.create_provider(&provider_record)?;

        let identifiers = cert.identifiers();
        let zone = challenge_zone(&cert.domain).to_string();

        self.progress(task_id, &format!("Placing order for {}", identifiers.join(", ")))
            .await;
        let mut order = self
            .bounded("Placing the order", self.acme.new_order(&identifiers))
            .await?;
        let authorizations = self
            .bounded("Fetching authorizations", order.authorizations())
            .await?;

        let mut published = Vec::with_capacity(authorizations.len());
        let result = self
            .complete(
                &mut *order,
                provider.as_ref(),
                &zone,
                &authorizations,
                &identifiers,
                &mut published,
                task_id,
            )
            .await;

        self.cleanup(provider.as_ref(), &published).await;

        match &result {
            Ok(issued) => {
                info!(
                    cert_id = %cert.id,
                    domain = %cert.domain,
                    expires_at = %issued.expires_at,
                    "Certificate issued"
                );
                self.progress(task_id, "Certificate downloaded").await;
            }
            Err(e) => {
                warn!(cert_id = %cert.id, domain = %cert.domain, error = %e, "Issuance failed");
                self.progress(task_id, &format!("Issuance failed: {}", e)).await;
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        order: &mut dyn AcmeOrder,
        provider: &dyn DnsChallengeProvider,
        zone: &str,
        authorizations: &[PendingAuthorization],
        identifiers: &[String],
        published: &mut Vec<ChallengeRecord>,
        task_id: Option<&str>,
    ) -> Result<IssuedCertificate> {
        for authz in authorizations {
            let record = ChallengeRecord {
                zone: zone.to_string(),
                name: challenge_record_name(&authz.identifier),
                value: dns01_digest(&authz.key_authorization),
            };
            debug!(
                provider = provider.provider_name(),
                record = %record.name,
                "Publishing challenge record"
            );
            provider
                .create_record(&record.zone, &record.name, &record.value)
                .await?;
            self.progress(task_id, &format!("Published TXT {}", record.name))
                .await;
            published.push(record);
        }

        self.wait_for_propagation(published).await?;
        self.progress(task_id, "Challenge records visible").await;

        for authz in authorizations {
            self.bounded(
                "Marking the challenge ready",
                order.set_challenge_ready(&authz.challenge_url),
            )
            .await?;
        }

        let deadline = self.config.challenge_timeout();
        let status = tokio::time::timeout(deadline, self.poll_until_ready(order, identifiers))
            .await
            .map_err(|_| {
                Error::acme(format!("Order not ready after {:?}", deadline))
            })??;
        if status != AcmeOrderStatus::Ready {
            return Err(Error::acme(format!(
                "Unexpected order status before finalize: {:?}",
                status
            )));
        }
        self.progress(task_id, "Validation succeeded").await;

        let key_and_csr = material::generate_key_and_csr(identifiers)?;
        self.bounded("Finalizing the order", order.finalize(&key_and_csr.csr_der))
            .await?;

        let chain = tokio::time::timeout(deadline, self.poll_certificate(order, identifiers))
            .await
            .map_err(|_| {
                Error::acme(format!("Certificate not available after {:?}", deadline))
            })??;

        IssuedCertificate::from_chain(chain, key_and_csr.key_pem)
    }

    /// Run one CA request under `challenge_timeout`
    async fn bounded<T>(&self, what: &str, request: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.challenge_timeout();
        tokio::time::timeout(limit, request)
            .await
            .map_err(|_| Error::acme(format!("{} timed out after {:?}", what, limit)))?
    }

    async fn wait_for_propagation(&self, records: &[ChallengeRecord]) -> Result<()> {
        let started = Instant::now();
        let timeout = self.config.propagation_timeout();
        let poll = self.config.propagation_poll_interval();

        for record in records {
            loop {
                match self.propagation.is_visible(&record.name, &record.value).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => debug!(record = %record.name, error = %e, "Propagation check failed"),
                }

                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(Error::PropagationTimeout {
                        record: record.name.clone(),
                        elapsed,
                    });
                }
                tokio::time::sleep(poll.min(timeout - elapsed)).await;
            }
        }

        Ok(())
    }

    async fn poll_until_ready(
        &self,
        order: &mut dyn AcmeOrder,
        identifiers: &[String],
    ) -> Result<AcmeOrderStatus> {
        loop {
            match order.refresh().await? {
                AcmeOrderStatus::Invalid(reason) => {
                    return Err(Error::rejected(identifiers.join(","), reason));
                }
                AcmeOrderStatus::Pending | AcmeOrderStatus::Processing => {
                    tokio::time::sleep(self.config.order_poll_interval()).await;
                }
                status => return Ok(status),
            }
        }
    }

    async fn poll_certificate(
        &self,
        order: &mut dyn AcmeOrder,
        identifiers: &[String],
    ) -> Result<String> {
        loop {
            if let Some(chain) = order.certificate().await? {
                return Ok(chain);
            }
            if let AcmeOrderStatus::Invalid(reason) = order.refresh().await? {
                return Err(Error::rejected(identifiers.join(","), reason));
            }
            tokio::time::sleep(self.config.order_poll_interval()).await;
        }
    }

    async fn cleanup(&self, provider: &dyn DnsChallengeProvider, records: &[ChallengeRecord]) {
        for record in records {
            if let Err(e) = provider
                .remove_record(&record.zone, &record.name, &record.value)
                .await
            {
                warn!(
                    provider = provider.provider_name(),
                    record = %record.name,
                    error = %e,
                    "Failed to remove challenge record"
                );
            }
        }
    }

    async fn load(&self, cert_id: &str) -> Result<Certificate> {
        self.store
            .get_certificate(cert_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("certificate {}", cert_id)))
    }

    async fn progress(&self, task_id: Option<&str>, message: &str) {
        debug!(task_id = task_id.unwrap_or("-"), "{}", message);
        if let Some(task_id) = task_id {
            if let Err(e) = self
                .store
                .append_task_log(task_id, message, chrono::Utc::now())
                .await
            {
                warn!(task_id, error = %e, "Failed to append task log");
            }
        }
    }
}
