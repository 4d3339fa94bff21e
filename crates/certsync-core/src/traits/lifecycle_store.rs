// # Lifecycle Store Trait
//
// Defines the persistence contract for everything the lifecycle engine and
// the agent protocol read and write.
//
// ## Purpose
//
// The store owns:
// - Certificates and their retry bookkeeping
// - DNS provider accounts (credentials handed out decrypted)
// - Agents and agent/certificate bindings
// - Task logs for every issuance/renewal attempt
// - The at-most-one in-flight issuance guard per certificate
//
// ## Implementations
//
// - `MemoryLifecycleStore`: tests and throwaway deployments
// - `FileLifecycleStore`: JSON snapshot with crash recovery

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    Agent, AgentCert, Certificate, DnsProviderRecord, SyncStatus, TaskLog, TaskLogStatus,
    TaskStatus,
};

/// Trait for lifecycle store implementations
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Insert a new certificate
    ///
    /// Fails with `InvalidInput` if the ID is taken.
    async fn create_certificate(&self, cert: &Certificate) -> Result<(), crate::Error>;

    /// Get a certificate by ID
    async fn get_certificate(&self, id: &str) -> Result<Option<Certificate>, crate::Error>;

    /// Replace a certificate
    ///
    /// Fails with `NotFound` if it does not exist.
    async fn update_certificate(&self, cert: &Certificate) -> Result<(), crate::Error>;

    /// List all certificates
    async fn list_certificates(&self) -> Result<Vec<Certificate>, crate::Error>;

    /// Certificates never issued or expiring within `days` of `now`
    async fn certs_expiring_within(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Certificate>, crate::Error>;

    /// Certificates with `fail_count > 0` and `next_retry_at <= now`
    async fn certs_due_for_retry(&self, now: DateTime<Utc>)
    -> Result<Vec<Certificate>, crate::Error>;

    /// Claim the issuance slot for a certificate
    ///
    /// Fails with `IssuanceInProgress` while another attempt holds it.
    async fn try_begin_issuance(&self, cert_id: &str) -> Result<(), crate::Error>;

    /// Release the issuance slot
    async fn end_issuance(&self, cert_id: &str) -> Result<(), crate::Error>;

    /// Insert or replace a DNS provider
    ///
    /// Fails with `InvalidInput` if another provider already uses the name.
    async fn put_dns_provider(&self, provider: &DnsProviderRecord) -> Result<(), crate::Error>;

    /// Get a DNS provider by ID
    async fn get_dns_provider(&self, id: &str)
    -> Result<Option<DnsProviderRecord>, crate::Error>;

    /// List all DNS providers
    async fn list_dns_providers(&self) -> Result<Vec<DnsProviderRecord>, crate::Error>;

    /// Delete a DNS provider
    ///
    /// Fails with `ProviderInUse` while certificates reference it.
    async fn delete_dns_provider(&self, id: &str) -> Result<(), crate::Error>;

    /// Insert or replace an agent
    async fn put_agent(&self, agent: &Agent) -> Result<(), crate::Error>;

    /// Get an agent by ID
    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, crate::Error>;

    /// List all agents
    async fn list_agents(&self) -> Result<Vec<Agent>, crate::Error>;

    /// Delete an agent and all of its bindings
    async fn delete_agent(&self, id: Uuid) -> Result<(), crate::Error>;

    /// Update `last_seen`, `ip` and `version` of an agent
    async fn record_heartbeat(
        &self,
        id: Uuid,
        ip: Option<String>,
        version: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), crate::Error>;

    /// Insert or replace a binding
    async fn put_binding(&self, binding: &AgentCert) -> Result<(), crate::Error>;

    /// Get the binding of `agent_id` to `cert_id`
    async fn get_binding(
        &self,
        agent_id: Uuid,
        cert_id: &str,
    ) -> Result<Option<AgentCert>, crate::Error>;

    /// All bindings of an agent
    async fn bindings_for_agent(&self, agent_id: Uuid) -> Result<Vec<AgentCert>, crate::Error>;

    /// Delete a binding
    async fn delete_binding(&self, agent_id: Uuid, cert_id: &str) -> Result<(), crate::Error>;

    /// Store an agent's sync report on an existing binding
    ///
    /// Only `last_sync`, `last_fingerprint` and `sync_status` change. Returns
    /// `false`, writing nothing, when the binding does not exist.
    async fn record_sync(
        &self,
        agent_id: Uuid,
        cert_id: &str,
        fingerprint: &str,
        status: SyncStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, crate::Error>;

    /// Record the start of a task
    ///
    /// Stores may drop the oldest finished tasks of the same certificate.
    async fn begin_task(&self, task: &TaskLogStatus) -> Result<(), crate::Error>;

    /// Append a progress line to a task
    async fn append_task_log(
        &self,
        task_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), crate::Error>;

    /// Set the terminal status of a task
    ///
    /// Fails with `TaskFinished` if the task already has one.
    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), crate::Error>;

    /// Get a task status row
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskLogStatus>, crate::Error>;

    /// Progress lines of a task, oldest first
    async fn task_logs(&self, task_id: &str) -> Result<Vec<TaskLog>, crate::Error>;

    /// All tasks of a certificate, oldest first
    async fn tasks_for_certificate(
        &self,
        cert_id: &str,
    ) -> Result<Vec<TaskLogStatus>, crate::Error>;
}
