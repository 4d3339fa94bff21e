// # File Lifecycle Store
//
// File-backed LifecycleStore: the whole state lives in memory and every
// mutation is followed by an atomic snapshot write (see `JsonSnapshotFile`).
// A mutation whose snapshot cannot be written is rolled back, so memory never
// runs ahead of disk. The in-flight issuance guard is never persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::json_file::JsonSnapshotFile;
use super::memory::{LifecycleState, MemoryLifecycleStore};
use crate::Error;
use crate::model::{
    Agent, AgentCert, Certificate, DnsProviderRecord, SyncStatus, TaskLog, TaskLogStatus,
    TaskStatus,
};
use crate::traits::LifecycleStore;

/// File-based lifecycle store with crash recovery
///
/// # Example
///
/// ```rust,no_run
/// use certsync_core::state::FileLifecycleStore;
/// use certsync_core::traits::LifecycleStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileLifecycleStore::new("/var/lib/certsync/state.json").await?;
///     let certs = store.list_certificates().await?;
///     println!("{} certificates", certs.len());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileLifecycleStore {
    memory: MemoryLifecycleStore,
    file: JsonSnapshotFile,
    write_lock: Mutex<()>,
}

impl FileLifecycleStore {
    /// Create or load a file lifecycle store
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = JsonSnapshotFile::open(path).await?;
        let state: LifecycleState = file.load_with_recovery().await?;
        tracing::debug!(
            certificates = state.certificates.len(),
            agents = state.agents.len(),
            "Loaded lifecycle state from {}",
            file.path().display()
        );

        Ok(Self {
            memory: MemoryLifecycleStore::from_state(state),
            file,
            write_lock: Mutex::new(()),
        })
    }

    /// Force immediate write to disk
    pub async fn sync(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        self.file.write(&self.memory.snapshot().await).await
    }

    /// Serialize writers and remember the state to roll back to
    async fn begin_write(&self) -> PendingWrite<'_> {
        let guard = self.write_lock.lock().await;
        PendingWrite {
            _guard: guard,
            previous: self.memory.snapshot().await,
        }
    }

    /// Write the mutated state, restoring the previous one on failure
    async fn commit(&self, pending: PendingWrite<'_>) -> Result<(), Error> {
        let snapshot = self.memory.snapshot().await;
        if let Err(e) = self.file.write(&snapshot).await {
            tracing::error!(error = %e, "State write failed, rolling back");
            self.memory.restore(pending.previous).await;
            return Err(e);
        }
        Ok(())
    }
}

struct PendingWrite<'a> {
    _guard: MutexGuard<'a, ()>,
    previous: LifecycleState,
}

#[async_trait]
impl LifecycleStore for FileLifecycleStore {
    async fn create_certificate(&self, cert: &Certificate) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.create_certificate(cert).await?;
        self.commit(pending).await
    }

    async fn get_certificate(&self, id: &str) -> Result<Option<Certificate>, Error> {
        self.memory.get_certificate(id).await
    }

    async fn update_certificate(&self, cert: &Certificate) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.update_certificate(cert).await?;
        self.commit(pending).await
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, Error> {
        self.memory.list_certificates().await
    }

    async fn certs_expiring_within(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Certificate>, Error> {
        self.memory.certs_expiring_within(days, now).await
    }

    async fn certs_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Certificate>, Error> {
        self.memory.certs_due_for_retry(now).await
    }

    async fn try_begin_issuance(&self, cert_id: &str) -> Result<(), Error> {
        self.memory.try_begin_issuance(cert_id).await
    }

    async fn end_issuance(&self, cert_id: &str) -> Result<(), Error> {
        self.memory.end_issuance(cert_id).await
    }

    async fn put_dns_provider(&self, provider: &DnsProviderRecord) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.put_dns_provider(provider).await?;
        self.commit(pending).await
    }

    async fn get_dns_provider(&self, id: &str) -> Result<Option<DnsProviderRecord>, Error> {
        self.memory.get_dns_provider(id).await
    }

    async fn list_dns_providers(&self) -> Result<Vec<DnsProviderRecord>, Error> {
        self.memory.list_dns_providers().await
    }

    async fn delete_dns_provider(&self, id: &str) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.delete_dns_provider(id).await?;
        self.commit(pending).await
    }

    async fn put_agent(&self, agent: &Agent) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.put_agent(agent).await?;
        self.commit(pending).await
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, Error> {
        self.memory.get_agent(id).await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, Error> {
        self.memory.list_agents().await
    }

    async fn delete_agent(&self, id: Uuid) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.delete_agent(id).await?;
        self.commit(pending).await
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        ip: Option<String>,
        version: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.record_heartbeat(id, ip, version, at).await?;
        self.commit(pending).await
    }

    async fn put_binding(&self, binding: &AgentCert) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.put_binding(binding).await?;
        self.commit(pending).await
    }

    async fn get_binding(
        &self,
        agent_id: Uuid,
        cert_id: &str,
    ) -> Result<Option<AgentCert>, Error> {
        self.memory.get_binding(agent_id, cert_id).await
    }

    async fn bindings_for_agent(&self, agent_id: Uuid) -> Result<Vec<AgentCert>, Error> {
        self.memory.bindings_for_agent(agent_id).await
    }

    async fn delete_binding(&self, agent_id: Uuid, cert_id: &str) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.delete_binding(agent_id, cert_id).await?;
        self.commit(pending).await
    }

    async fn record_sync(
        &self,
        agent_id: Uuid,
        cert_id: &str,
        fingerprint: &str,
        status: SyncStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let pending = self.begin_write().await;
        if !self
            .memory
            .record_sync(agent_id, cert_id, fingerprint, status, at)
            .await?
        {
            return Ok(false);
        }
        self.commit(pending).await?;
        Ok(true)
    }

    async fn begin_task(&self, task: &TaskLogStatus) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.begin_task(task).await?;
        self.commit(pending).await
    }

    async fn append_task_log(
        &self,
        task_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.append_task_log(task_id, message, at).await?;
        self.commit(pending).await
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pending = self.begin_write().await;
        self.memory.finish_task(task_id, status, error, at).await?;
        self.commit(pending).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskLogStatus>, Error> {
        self.memory.get_task(task_id).await
    }

    async fn task_logs(&self, task_id: &str) -> Result<Vec<TaskLog>, Error> {
        self.memory.task_logs(task_id).await
    }

    async fn tasks_for_certificate(&self, cert_id: &str) -> Result<Vec<TaskLogStatus>, Error> {
        self.memory.tasks_for_certificate(cert_id).await
    }
}
