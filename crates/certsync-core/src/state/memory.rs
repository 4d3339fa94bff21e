// # Memory Lifecycle Store
//
// In-memory implementation of LifecycleStore.
//
// ## Task Retention
//
// - At most `DEFAULT_TASK_RETENTION` tasks are kept per certificate
// - Starting a task drops the oldest finished ones beyond that, with their logs
//
// ## Crash Behavior
//
// - All state is lost on restart
// - Every certificate looks "never issued" again after a restart
//
// ## When to Use
//
// - Tests
// - Throwaway deployments fronting a short-lived CA (staging)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::Error;
use crate::model::{
    Agent, AgentCert, Certificate, DnsProviderRecord, SyncStatus, TaskLog, TaskLogStatus,
    TaskStatus,
};
use crate::traits::LifecycleStore;

/// Tasks kept per certificate
pub const DEFAULT_TASK_RETENTION: usize = 50;

/// Everything a lifecycle store persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LifecycleState {
    #[serde(default)]
    pub(crate) certificates: BTreeMap<String, Certificate>,
    #[serde(default)]
    pub(crate) dns_providers: BTreeMap<String, DnsProviderRecord>,
    #[serde(default)]
    pub(crate) agents: BTreeMap<Uuid, Agent>,
    #[serde(default)]
    pub(crate) bindings: Vec<AgentCert>,
    #[serde(default)]
    pub(crate) tasks: Vec<TaskLogStatus>,
    #[serde(default)]
    pub(crate) task_logs: Vec<TaskLog>,
}

/// In-memory lifecycle store
///
/// # Example
///
/// ```rust,no_run
/// use certsync_core::model::Certificate;
/// use certsync_core::state::MemoryLifecycleStore;
/// use certsync_core::traits::LifecycleStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryLifecycleStore::new();
///     let cert = Certificate::new("example.com", vec![], "cloudflare-1");
///     store.create_certificate(&cert).await?;
///     assert!(store.get_certificate(&cert.id).await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryLifecycleStore {
    inner: Arc<RwLock<LifecycleState>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    task_retention: usize,
}

impl Default for MemoryLifecycleStore {
    fn default() -> Self {
        Self::from_state(LifecycleState::default())
    }
}

impl MemoryLifecycleStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `tasks` tasks per certificate (at least one)
    pub fn with_task_retention(mut self, tasks: usize) -> Self {
        self.task_retention = tasks.max(1);
        self
    }

    pub(crate) fn from_state(state: LifecycleState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
            in_flight: Arc::default(),
            task_retention: DEFAULT_TASK_RETENTION,
        }
    }

    pub(crate) async fn snapshot(&self) -> LifecycleState {
        self.inner.read().await.clone()
    }

    pub(crate) async fn restore(&self, state: LifecycleState) {
        *self.inner.write().await = state;
    }
}

/// Drop the oldest finished tasks of `cert_id` beyond `keep`, with their logs
fn prune_tasks(state: &mut LifecycleState, cert_id: &str, keep: usize) {
    let count = state.tasks.iter().filter(|t| t.cert_id == cert_id).count();
    let mut excess = count.saturating_sub(keep);
    if excess == 0 {
        return;
    }

    let mut dropped = HashSet::new();
    state.tasks.retain(|t| {
        if excess > 0 && t.cert_id == cert_id && t.status.is_terminal() {
            excess -= 1;
            dropped.insert(t.task_id.clone());
            return false;
        }
        true
    });
    state.task_logs.retain(|l| !dropped.contains(&l.task_id));
}

#[async_trait]
impl LifecycleStore for MemoryLifecycleStore {
    async fn create_certificate(&self, cert: &Certificate) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        if state.certificates.contains_key(&cert.id) {
            return Err(Error::invalid_input(format!(
                "Certificate {} already exists",
                cert.id
            )));
        }
        state.certificates.insert(cert.id.clone(), cert.clone());
        Ok(())
    }

    async fn get_certificate(&self, id: &str) -> Result<Option<Certificate>, Error> {
        Ok(self.inner.read().await.certificates.get(id).cloned())
    }

    async fn update_certificate(&self, cert: &Certificate) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        match state.certificates.get_mut(&cert.id) {
            Some(existing) => {
                *existing = cert.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!("certificate {}", cert.id))),
        }
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, Error> {
        Ok(self.inner.read().await.certificates.values().cloned().collect())
    }

    async fn certs_expiring_within(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Certificate>, Error> {
        let state = self.inner.read().await;
        Ok(state
            .certificates
            .values()
            .filter(|cert| cert.is_due(now, days))
            .cloned()
            .collect())
    }

    async fn certs_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Certificate>, Error> {
        let state = self.inner.read().await;
        Ok(state
            .certificates
            .values()
            .filter(|cert| cert.is_retry_due(now))
            .cloned()
            .collect())
    }

    async fn try_begin_issuance(&self, cert_id: &str) -> Result<(), Error> {
        if self.in_flight.lock().await.insert(cert_id.to_string()) {
            Ok(())
        } else {
            Err(Error::IssuanceInProgress(cert_id.to_string()))
        }
    }

    async fn end_issuance(&self, cert_id: &str) -> Result<(), Error> {
        self.in_flight.lock().await.remove(cert_id);
        Ok(())
    }

    async fn put_dns_provider(&self, provider: &DnsProviderRecord) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        let name_taken = state
            .dns_providers
            .values()
            .any(|p| p.name == provider.name && p.id != provider.id);
        if name_taken {
            return Err(Error::invalid_input(format!(
                "DNS provider name '{}' already in use",
                provider.name
            )));
        }
        state
            .dns_providers
            .insert(provider.id.clone(), provider.clone());
        Ok(())
    }

    async fn get_dns_provider(&self, id: &str) -> Result<Option<DnsProviderRecord>, Error> {
        Ok(self.inner.read().await.dns_providers.get(id).cloned())
    }

    async fn list_dns_providers(&self) -> Result<Vec<DnsProviderRecord>, Error> {
        Ok(self.inner.read().await.dns_providers.values().cloned().collect())
    }

    async fn delete_dns_provider(&self, id: &str) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        let Some(provider) = state.dns_providers.get(id) else {
            return Err(Error::not_found(format!("DNS provider {}", id)));
        };
        let certificates = state
            .certificates
            .values()
            .filter(|cert| cert.dns_provider_id == id)
            .count();
        if certificates > 0 {
            return Err(Error::ProviderInUse {
                provider: provider.name.clone(),
                certificates,
            });
        }
        state.dns_providers.remove(id);
        Ok(())
    }

    async fn put_agent(&self, agent: &Agent) -> Result<(), Error> {
        self.inner.write().await.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, Error> {
        Ok(self.inner.read().await.agents.get(&id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, Error> {
        Ok(self.inner.read().await.agents.values().cloned().collect())
    }

    async fn delete_agent(&self, id: Uuid) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        if state.agents.remove(&id).is_none() {
            return Err(Error::not_found(format!("agent {}", id)));
        }
        state.bindings.retain(|b| b.agent_id != id);
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        ip: Option<String>,
        version: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("agent {}", id)))?;
        agent.last_seen = Some(at);
        agent.ip = ip;
        agent.version = version;
        Ok(())
    }

    async fn put_binding(&self, binding: &AgentCert) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        match state
            .bindings
            .iter_mut()
            .find(|b| b.agent_id == binding.agent_id && b.cert_id == binding.cert_id)
        {
            Some(existing) => *existing = binding.clone(),
            None => state.bindings.push(binding.clone()),
        }
        Ok(())
    }

    async fn get_binding(
        &self,
        agent_id: Uuid,
        cert_id: &str,
    ) -> Result<Option<AgentCert>, Error> {
        let state = self.inner.read().await;
        Ok(state
            .bindings
            .iter()
            .find(|b| b.agent_id == agent_id && b.cert_id == cert_id)
            .cloned())
    }

    async fn bindings_for_agent(&self, agent_id: Uuid) -> Result<Vec<AgentCert>, Error> {
        let state = self.inner.read().await;
        Ok(state
            .bindings
            .iter()
            .filter(|b| b.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn delete_binding(&self, agent_id: Uuid, cert_id: &str) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        let before = state.bindings.len();
        state
            .bindings
            .retain(|b| !(b.agent_id == agent_id && b.cert_id == cert_id));
        if state.bindings.len() == before {
            return Err(Error::not_found(format!(
                "binding of agent {} to certificate {}",
                agent_id, cert_id
            )));
        }
        Ok(())
    }

    async fn record_sync(
        &self,
        agent_id: Uuid,
        cert_id: &str,
        fingerprint: &str,
        status: SyncStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let mut state = self.inner.write().await;
        let Some(binding) = state
            .bindings
            .iter_mut()
            .find(|b| b.agent_id == agent_id && b.cert_id == cert_id)
        else {
            return Ok(false);
        };
        binding.last_sync = Some(at);
        binding.last_fingerprint = Some(fingerprint.to_string());
        binding.sync_status = status;
        Ok(true)
    }

    async fn begin_task(&self, task: &TaskLogStatus) -> Result<(), Error> {
        let mut state = self.inner.write().await;
        if state.tasks.iter().any(|t| t.task_id == task.task_id) {
            return Err(Error::invalid_input(format!(
                "Task {} already exists",
                task.task_id
            )));
        }
        state.tasks.push(task.clone());
        prune_tasks(&mut state, &task.cert_id, self.task_retention);
        Ok(())
    }

    async fn append_task_log(
        &self,
        task_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.inner.write().await.task_logs.push(TaskLog {
            task_id: task_id.to_string(),
            at,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        if !status.is_terminal() {
            return Err(Error::invalid_input("finish_task needs a terminal status"));
        }

        let mut state = self.inner.write().await;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.task_id == task_id)
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))?;
        if task.status.is_terminal() {
            return Err(Error::TaskFinished(task_id.to_string()));
        }
        task.status = status;
        task.error = error;
        task.finished_at = Some(at);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskLogStatus>, Error> {
        let state = self.inner.read().await;
        Ok(state.tasks.iter().find(|t| t.task_id == task_id).cloned())
    }

    async fn task_logs(&self, task_id: &str) -> Result<Vec<TaskLog>, Error> {
        let state = self.inner.read().await;
        Ok(state
            .task_logs
            .iter()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn tasks_for_certificate(&self, cert_id: &str) -> Result<Vec<TaskLogStatus>, Error> {
        let state = self.inner.read().await;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.cert_id == cert_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnsProviderType, TaskKind};
    use chrono::Duration;

    fn cert_expiring_in(days: i64, now: DateTime<Utc>) -> Certificate {
        let mut cert = Certificate::new(format!("d{}.example.com", days), vec![], "p1");
        cert.fingerprint = "f".to_string();
        cert.expires_at = Some(now + Duration::days(days));
        cert
    }

    #[tokio::test]
    async fn test_certs_expiring_within() {
        let store = MemoryLifecycleStore::new();
        let now = Utc::now();

        let soon = cert_expiring_in(5, now);
        let later = cert_expiring_in(60, now);
        let never = Certificate::new("new.example.com", vec![], "p1");
        for cert in [&soon, &later, &never] {
            store.create_certificate(cert).await.unwrap();
        }

        let mut due: Vec<String> = store
            .certs_expiring_within(30, now)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        due.sort();
        let mut expected = vec![soon.id.clone(), never.id.clone()];
        expected.sort();
        assert_eq!(due, expected);
    }

    #[tokio::test]
    async fn test_certs_due_for_retry() {
        let store = MemoryLifecycleStore::new();
        let now = Utc::now();

        let mut due = cert_expiring_in(60, now);
        due.fail_count = 1;
        due.next_retry_at = Some(now - Duration::minutes(1));
        let mut deferred = cert_expiring_in(60, now);
        deferred.fail_count = 1;
        deferred.next_retry_at = Some(now + Duration::minutes(9));
        store.create_certificate(&due).await.unwrap();
        store.create_certificate(&deferred).await.unwrap();

        let picked = store.certs_due_for_retry(now).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, due.id);
    }

    #[tokio::test]
    async fn test_issuance_guard() {
        let store = MemoryLifecycleStore::new();
        store.try_begin_issuance("c1").await.unwrap();
        assert!(matches!(
            store.try_begin_issuance("c1").await,
            Err(Error::IssuanceInProgress(_))
        ));
        store.try_begin_issuance("c2").await.unwrap();
        store.end_issuance("c1").await.unwrap();
        store.try_begin_issuance("c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_provider_in_use_refuses_delete() {
        let store = MemoryLifecycleStore::new();
        let provider = DnsProviderRecord::new(
            "p1",
            "main",
            DnsProviderType::Cloudflare,
            serde_json::json!({}),
        );
        store.put_dns_provider(&provider).await.unwrap();
        let cert = Certificate::new("example.com", vec![], "p1");
        store.create_certificate(&cert).await.unwrap();

        let err = store.delete_dns_provider("p1").await.err().unwrap();
        assert!(matches!(err, Error::ProviderInUse { certificates: 1, .. }));
        assert!(store.get_dns_provider("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_provider_names_unique() {
        let store = MemoryLifecycleStore::new();
        let a = DnsProviderRecord::new("a", "main", DnsProviderType::Cloudflare, serde_json::json!({}));
        let b = DnsProviderRecord::new("b", "main", DnsProviderType::Dnspod, serde_json::json!({}));
        store.put_dns_provider(&a).await.unwrap();
        assert!(matches!(
            store.put_dns_provider(&b).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_task_status_is_terminal_once_set() {
        let store = MemoryLifecycleStore::new();
        let now = Utc::now();
        let task = TaskLogStatus::start("c1", TaskKind::Issue, now);
        store.begin_task(&task).await.unwrap();
        store
            .append_task_log(&task.task_id, "ordering", now)
            .await
            .unwrap();

        store
            .finish_task(&task.task_id, TaskStatus::Completed, None, now)
            .await
            .unwrap();
        let second = store
            .finish_task(&task.task_id, TaskStatus::Failed, Some("x".to_string()), now)
            .await;
        assert!(matches!(second, Err(Error::TaskFinished(_))));

        let stored = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(store.task_logs(&task.task_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_old_finished_tasks_are_pruned() {
        let store = MemoryLifecycleStore::new().with_task_retention(3);
        let now = Utc::now();

        let running = TaskLogStatus::start("c1", TaskKind::Issue, now);
        store.begin_task(&running).await.unwrap();
        let mut finished = Vec::new();
        for i in 0..4 {
            let task = TaskLogStatus::start("c1", TaskKind::Renew, now + Duration::minutes(i));
            store.begin_task(&task).await.unwrap();
            store.append_task_log(&task.task_id, "ordering", now).await.unwrap();
            store
                .finish_task(&task.task_id, TaskStatus::Failed, Some("x".to_string()), now)
                .await
                .unwrap();
            finished.push(task);
        }
        let other = TaskLogStatus::start("c2", TaskKind::Issue, now);
        store.begin_task(&other).await.unwrap();

        let kept = store.tasks_for_certificate("c1").await.unwrap();
        let kept_ids: Vec<_> = kept.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(
            kept_ids,
            vec![
                running.task_id.as_str(),
                finished[2].task_id.as_str(),
                finished[3].task_id.as_str(),
            ]
        );
        assert!(store.get_task(&finished[0].task_id).await.unwrap().is_none());
        assert!(store.task_logs(&finished[1].task_id).await.unwrap().is_empty());
        assert_eq!(store.task_logs(&finished[3].task_id).await.unwrap().len(), 1);
        assert_eq!(store.tasks_for_certificate("c2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_sync_ignores_missing_binding() {
        let store = MemoryLifecycleStore::new();
        let agent_id = Uuid::new_v4();
        let now = Utc::now();

        let recorded = store
            .record_sync(agent_id, "c1", "f1", SyncStatus::Synced, now)
            .await
            .unwrap();
        assert!(!recorded);
        assert!(store.get_binding(agent_id, "c1").await.unwrap().is_none());

        let mut binding = AgentCert::new(agent_id, "c1", "/srv/ssl");
        binding.reload_cmd = Some("nginx -s reload".to_string());
        store.put_binding(&binding).await.unwrap();
        assert!(store
            .record_sync(agent_id, "c1", "f1", SyncStatus::Synced, now)
            .await
            .unwrap());

        let stored = store.get_binding(agent_id, "c1").await.unwrap().unwrap();
        assert_eq!(stored.last_fingerprint.as_deref(), Some("f1"));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.reload_cmd.as_deref(), Some("nginx -s reload"));
        assert_eq!(stored.deploy_path, "/srv/ssl");
    }
}
