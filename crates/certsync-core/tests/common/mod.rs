//! Test doubles and common utilities for contract tests
//!
//! The doubles count every call so tests can assert on what the lifecycle
//! engine did, not just on what it returned.

#![allow(dead_code)]

use async_trait::async_trait;
use certsync_core::clock::ManualClock;
use certsync_core::config::{ChallengeConfig, SchedulerConfig};
use certsync_core::error::{Error, Result};
use certsync_core::model::{Certificate, DnsProviderRecord, DnsProviderType};
use certsync_core::traits::{
    AcmeClient, AcmeOrder, AcmeOrderStatus, DnsChallengeProvider, DnsProviderFactory,
    LifecycleStore, Notifier, PendingAuthorization, PropagationChecker,
};
use certsync_core::{
    ChallengeCoordinator, MemoryLifecycleStore, ProviderRegistry, RenewalScheduler,
};
use chrono::Utc;
use rcgen::{CertificateParams, KeyPair};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const PROVIDER_ID: &str = "cloudflare-1";

/// Mint a self-signed PEM certificate valid for `days`
pub fn self_signed_pem(names: &[String], days: i64) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(names.to_vec()).unwrap();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(days);
    params.self_signed(&key).unwrap().pem()
}

/// How the mock CA should behave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaBehavior {
    /// Validate and issue a 90-day certificate
    Issue,
    /// Reject the order after challenges are marked ready
    Reject(String),
    /// Refuse to create orders (`rateLimited` problem)
    RateLimit,
    /// Never answer a new-order request
    StallOrders,
    /// Accept the order, then never answer the challenge-ready request
    StallChallenges,
}

/// ACME client double
pub struct MockAcmeClient {
    behavior: Mutex<CaBehavior>,
    new_order_calls: Arc<AtomicUsize>,
    ready_calls: Arc<AtomicUsize>,
    finalize_calls: Arc<AtomicUsize>,
    ordered: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockAcmeClient {
    pub fn new(behavior: CaBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            new_order_calls: Arc::default(),
            ready_calls: Arc::default(),
            finalize_calls: Arc::default(),
            ordered: Arc::default(),
        }
    }

    pub fn set_behavior(&self, behavior: CaBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn new_order_calls(&self) -> usize {
        self.new_order_calls.load(Ordering::SeqCst)
    }

    pub fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn ordered_identifiers(&self) -> Vec<Vec<String>> {
        self.ordered.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcmeClient for MockAcmeClient {
    async fn new_order(&self, identifiers: &[String]) -> Result<Box<dyn AcmeOrder>> {
        self.new_order_calls.fetch_add(1, Ordering::SeqCst);
        self.ordered.lock().unwrap().push(identifiers.to_vec());

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            CaBehavior::RateLimit => {
                return Err(Error::rate_limited("too many new orders recently"));
            }
            CaBehavior::StallOrders => std::future::pending::<()>().await,
            _ => {}
        }

        Ok(Box::new(MockOrder {
            identifiers: identifiers.to_vec(),
            behavior,
            ready: Vec::new(),
            finalized: false,
            ready_calls: self.ready_calls.clone(),
            finalize_calls: self.finalize_calls.clone(),
        }))
    }
}

struct MockOrder {
    identifiers: Vec<String>,
    behavior: CaBehavior,
    ready: Vec<String>,
    finalized: bool,
    ready_calls: Arc<AtomicUsize>,
    finalize_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AcmeOrder for MockOrder {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>> {
        Ok(self
            .identifiers
            .iter()
            .enumerate()
            .map(|(i, identifier)| PendingAuthorization {
                identifier: identifier.clone(),
                challenge_url: format!("https://ca.test/chall/{}", i),
                key_authorization: format!("token-{}.thumbprint", i),
            })
            .collect())
    }

    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<()> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior == CaBehavior::StallChallenges {
            std::future::pending::<()>().await;
        }
        self.ready.push(challenge_url.to_string());
        Ok(())
    }

    async fn refresh(&mut self) -> Result<AcmeOrderStatus> {
        if let CaBehavior::Reject(reason) = &self.behavior {
            return Ok(AcmeOrderStatus::Invalid(reason.clone()));
        }
        if self.finalized {
            Ok(AcmeOrderStatus::Valid)
        } else if self.ready.len() == self.identifiers.len() {
            Ok(AcmeOrderStatus::Ready)
        } else {
            Ok(AcmeOrderStatus::Pending)
        }
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
        assert!(!csr_der.is_empty());
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        self.finalized = true;
        Ok(())
    }

    async fn certificate(&mut self) -> Result<Option<String>> {
        if !self.finalized {
            return Ok(None);
        }
        let leaf = self_signed_pem(&self.identifiers, 90);
        let issuer = self_signed_pem(&["intermediate.mock.test".to_string()], 365);
        Ok(Some(format!("{}{}", leaf, issuer)))
    }
}

/// A published or removed TXT record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecord {
    pub zone: String,
    pub name: String,
    pub value: String,
}

/// DNS provider double sharing its call log with the factory
#[derive(Clone, Default)]
pub struct CountingDnsProvider {
    created: Arc<Mutex<Vec<TxtRecord>>>,
    removed: Arc<Mutex<Vec<TxtRecord>>>,
    fail_create: Arc<AtomicBool>,
    fail_remove: Arc<AtomicBool>,
}

impl CountingDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<TxtRecord> {
        self.created.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<TxtRecord> {
        self.removed.lock().unwrap().clone()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DnsChallengeProvider for CountingDnsProvider {
    async fn create_record(&self, zone: &str, name: &str, value: &str) -> Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::provider("counting", "API unavailable"));
        }
        self.created.lock().unwrap().push(TxtRecord {
            zone: zone.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn remove_record(&self, zone: &str, name: &str, value: &str) -> Result<()> {
        self.removed.lock().unwrap().push(TxtRecord {
            zone: zone.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Error::provider("counting", "delete failed"));
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "counting"
    }
}

impl DnsProviderFactory for CountingDnsProvider {
    fn create(&self, _record: &DnsProviderRecord) -> Result<Box<dyn DnsChallengeProvider>> {
        Ok(Box::new(self.clone()))
    }
}

/// Propagation checker that is always (or never) satisfied
pub struct FixedPropagation {
    visible: bool,
    checks: Arc<AtomicUsize>,
}

impl FixedPropagation {
    pub fn visible() -> Self {
        Self {
            visible: true,
            checks: Arc::default(),
        }
    }

    pub fn never() -> Self {
        Self {
            visible: false,
            checks: Arc::default(),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PropagationChecker for FixedPropagation {
    async fn is_visible(&self, _fqdn: &str, _expected: &str) -> Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.visible)
    }
}

/// Notifier double recording every message
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, title: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}

/// Challenge timings small enough for tests
pub fn fast_challenge_config() -> ChallengeConfig {
    ChallengeConfig {
        propagation_timeout_secs: 1,
        propagation_poll_interval_secs: 1,
        challenge_timeout_secs: 5,
        order_poll_interval_ms: 1,
    }
}

/// Everything a lifecycle test needs, wired together
pub struct Harness {
    pub store: Arc<InstrumentedStore>,
    pub acme: Arc<MockAcmeClient>,
    pub dns: CountingDnsProvider,
    pub propagation: Arc<FixedPropagation>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub coordinator: Arc<ChallengeCoordinator>,
    pub scheduler: RenewalScheduler,
}

impl Harness {
    pub async fn new(behavior: CaBehavior) -> Self {
        Self::with_propagation(behavior, FixedPropagation::visible()).await
    }

    pub async fn with_propagation(behavior: CaBehavior, propagation: FixedPropagation) -> Self {
        Self::build(behavior, propagation, fast_challenge_config()).await
    }

    pub async fn with_challenge_config(behavior: CaBehavior, config: ChallengeConfig) -> Self {
        Self::build(behavior, FixedPropagation::visible(), config).await
    }

    async fn build(
        behavior: CaBehavior,
        propagation: FixedPropagation,
        challenge: ChallengeConfig,
    ) -> Self {
        let store = Arc::new(InstrumentedStore::new(MemoryLifecycleStore::new()));
        store
            .put_dns_provider(&DnsProviderRecord::new(
                PROVIDER_ID,
                "primary",
                DnsProviderType::Cloudflare,
                serde_json::json!({ "api_token": "test-token" }),
            ))
            .await
            .unwrap();

        let dns = CountingDnsProvider::new();
        let registry = Arc::new(ProviderRegistry::new());
        registry.register_provider(DnsProviderType::Cloudflare, Box::new(dns.clone()));

        let acme = Arc::new(MockAcmeClient::new(behavior));
        let propagation = Arc::new(propagation);
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let coordinator = Arc::new(ChallengeCoordinator::new(
            store.clone(),
            registry,
            acme.clone(),
            propagation.clone(),
            challenge,
        ));
        let (scheduler, _events) = RenewalScheduler::new(
            store.clone(),
            coordinator.clone(),
            notifier.clone(),
            clock.clone(),
            SchedulerConfig::default(),
        )
        .unwrap();

        Self {
            store,
            acme,
            dns,
            propagation,
            notifier,
            clock,
            coordinator,
            scheduler,
        }
    }

    /// Store a never-issued certificate
    pub async fn add_certificate(&self, domain: &str, san: &[&str]) -> Certificate {
        let cert = Certificate::new(
            domain,
            san.iter().map(|s| s.to_string()).collect(),
            PROVIDER_ID,
        );
        self.store.create_certificate(&cert).await.unwrap();
        cert
    }

    pub async fn reload(&self, cert_id: &str) -> Certificate {
        self.store.get_certificate(cert_id).await.unwrap().unwrap()
    }
}

/// Store wrapper counting every read of agent or certificate data
///
/// It can also be told to reject certificate updates, as a full disk would.
pub struct InstrumentedStore {
    inner: MemoryLifecycleStore,
    reads: AtomicUsize,
    /// (updates still let through, updates to reject after those)
    failing_updates: Mutex<(usize, usize)>,
}

impl InstrumentedStore {
    pub fn new(inner: MemoryLifecycleStore) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            failing_updates: Mutex::new((0, 0)),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Let the next `skip` certificate updates through, then reject `count`
    pub fn fail_certificate_updates(&self, skip: usize, count: usize) {
        *self.failing_updates.lock().unwrap() = (skip, count);
    }

    fn reject_update(&self) -> bool {
        let mut failing = self.failing_updates.lock().unwrap();
        match *failing {
            (0, 0) => false,
            (0, count) => {
                failing.1 = count - 1;
                true
            }
            (skip, _) => {
                failing.0 = skip - 1;
                false
            }
        }
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LifecycleStore for InstrumentedStore {
    async fn create_certificate(&self, cert: &Certificate) -> Result<()> {
        self.inner.create_certificate(cert).await
    }

    async fn get_certificate(&self, id: &str) -> Result<Option<Certificate>> {
        self.read();
        self.inner.get_certificate(id).await
    }

    async fn update_certificate(&self, cert: &Certificate) -> Result<()> {
        if self.reject_update() {
            return Err(Error::state_store("No space left on device"));
        }
        self.inner.update_certificate(cert).await
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        self.read();
        self.inner.list_certificates().await
    }

    async fn certs_expiring_within(
        &self,
        days: i64,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<Certificate>> {
        self.read();
        self.inner.certs_expiring_within(days, now).await
    }

    async fn certs_due_for_retry(&self, now: chrono::DateTime<Utc>) -> Result<Vec<Certificate>> {
        self.read();
        self.inner.certs_due_for_retry(now).await
    }

    async fn try_begin_issuance(&self, cert_id: &str) -> Result<()> {
        self.inner.try_begin_issuance(cert_id).await
    }

    async fn end_issuance(&self, cert_id: &str) -> Result<()> {
        self.inner.end_issuance(cert_id).await
    }

    async fn put_dns_provider(&self, provider: &DnsProviderRecord) -> Result<()> {
        self.inner.put_dns_provider(provider).await
    }

    async fn get_dns_provider(&self, id: &str) -> Result<Option<DnsProviderRecord>> {
        self.read();
        self.inner.get_dns_provider(id).await
    }

    async fn list_dns_providers(&self) -> Result<Vec<DnsProviderRecord>> {
        self.read();
        self.inner.list_dns_providers().await
    }

    async fn delete_dns_provider(&self, id: &str) -> Result<()> {
        self.inner.delete_dns_provider(id).await
    }

    async fn put_agent(&self, agent: &certsync_core::model::Agent) -> Result<()> {
        self.inner.put_agent(agent).await
    }

    async fn get_agent(&self, id: uuid::Uuid) -> Result<Option<certsync_core::model::Agent>> {
        self.read();
        self.inner.get_agent(id).await
    }

    async fn list_agents(&self) -> Result<Vec<certsync_core::model::Agent>> {
        self.read();
        self.inner.list_agents().await
    }

    async fn delete_agent(&self, id: uuid::Uuid) -> Result<()> {
        self.inner.delete_agent(id).await
    }

    async fn record_heartbeat(
        &self,
        id: uuid::Uuid,
        ip: Option<String>,
        version: Option<String>,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.inner.record_heartbeat(id, ip, version, at).await
    }

    async fn put_binding(&self, binding: &certsync_core::model::AgentCert) -> Result<()> {
        self.inner.put_binding(binding).await
    }

    async fn get_binding(
        &self,
        agent_id: uuid::Uuid,
        cert_id: &str,
    ) -> Result<Option<certsync_core::model::AgentCert>> {
        self.read();
        self.inner.get_binding(agent_id, cert_id).await
    }

    async fn bindings_for_agent(
        &self,
        agent_id: uuid::Uuid,
    ) -> Result<Vec<certsync_core::model::AgentCert>> {
        self.read();
        self.inner.bindings_for_agent(agent_id).await
    }

    async fn delete_binding(&self, agent_id: uuid::Uuid, cert_id: &str) -> Result<()> {
        self.inner.delete_binding(agent_id, cert_id).await
    }

    async fn record_sync(
        &self,
        agent_id: uuid::Uuid,
        cert_id: &str,
        fingerprint: &str,
        status: certsync_core::model::SyncStatus,
        at: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .record_sync(agent_id, cert_id, fingerprint, status, at)
            .await
    }

    async fn begin_task(&self, task: &certsync_core::model::TaskLogStatus) -> Result<()> {
        self.inner.begin_task(task).await
    }

    async fn append_task_log(
        &self,
        task_id: &str,
        message: &str,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.inner.append_task_log(task_id, message, at).await
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: certsync_core::model::TaskStatus,
        error: Option<String>,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.inner.finish_task(task_id, status, error, at).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<certsync_core::model::TaskLogStatus>> {
        self.inner.get_task(task_id).await
    }

    async fn task_logs(&self, task_id: &str) -> Result<Vec<certsync_core::model::TaskLog>> {
        self.inner.task_logs(task_id).await
    }

    async fn tasks_for_certificate(
        &self,
        cert_id: &str,
    ) -> Result<Vec<certsync_core::model::TaskLogStatus>> {
        self.inner.tasks_for_certificate(cert_id).await
    }
}
