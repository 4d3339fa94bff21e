//! Agent registration, authentication and bindings

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::identity::AgentSigner;
use super::protocol::HeartbeatRequest;
use crate::clock::Clock;
use crate::config::AgentProtocolConfig;
use crate::error::{Error, Result};
use crate::model::{Agent, AgentCert, AgentStatus};
use crate::traits::LifecycleStore;

/// Owns agent identities and their certificate bindings
pub struct AgentRegistry {
    store: Arc<dyn LifecycleStore>,
    signer: AgentSigner,
    clock: Arc<dyn Clock>,
    config: AgentProtocolConfig,
}

impl AgentRegistry {
    /// Create a registry
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        signer: AgentSigner,
        clock: Arc<dyn Clock>,
        config: AgentProtocolConfig,
    ) -> Self {
        Self {
            store,
            signer,
            clock,
            config,
        }
    }

    /// Register a new agent with the default poll interval
    pub async fn register(&self, name: impl Into<String>) -> Result<Agent> {
        let id = Uuid::new_v4();
        let agent = Agent {
            id,
            name: name.into(),
            signature: self.signer.sign(&id),
            poll_interval_secs: self.config.default_poll_interval_secs,
            last_seen: None,
            ip: None,
            version: None,
            created_at: self.clock.now(),
        };
        self.store.put_agent(&agent).await?;
        info!(agent_id = %agent.id, name = %agent.name, "Agent registered");
        Ok(agent)
    }

    /// Change an agent's poll interval
    pub async fn set_poll_interval(&self, agent_id: Uuid, poll_interval_secs: u64) -> Result<()> {
        if poll_interval_secs == 0 {
            return Err(Error::invalid_input("poll_interval must be > 0"));
        }
        let mut agent = self.get(agent_id).await?;
        agent.poll_interval_secs = poll_interval_secs;
        self.store.put_agent(&agent).await
    }

    /// Remove an agent and its bindings
    pub async fn remove(&self, agent_id: Uuid) -> Result<()> {
        self.store.delete_agent(agent_id).await?;
        info!(agent_id = %agent_id, "Agent removed");
        Ok(())
    }

    /// Resolve the identity embedded in a request path
    ///
    /// Every failure is [`Error::SignatureMismatch`]. The signature is
    /// checked before the store is consulted, so a bare UUID never reaches
    /// agent or certificate data.
    pub async fn authenticate(&self, agent_id: &str, signature: &str) -> Result<Agent> {
        let Ok(id) = Uuid::parse_str(agent_id) else {
            return Err(Error::SignatureMismatch);
        };
        if !self.signer.verify(&id, signature) {
            debug!(agent_id = %id, "Agent signature rejected");
            return Err(Error::SignatureMismatch);
        }
        self.store
            .get_agent(id)
            .await?
            .ok_or(Error::SignatureMismatch)
    }

    /// Derived liveness of an agent
    pub fn status(&self, agent: &Agent) -> AgentStatus {
        agent.status(self.clock.now(), self.config.offline_after_multiplier)
    }

    /// Record a heartbeat
    pub async fn heartbeat(&self, agent: &Agent, heartbeat: HeartbeatRequest) -> Result<()> {
        self.store
            .record_heartbeat(agent.id, heartbeat.ip, heartbeat.version, self.clock.now())
            .await
    }

    /// Bind a certificate to an agent
    pub async fn bind(&self, binding: AgentCert) -> Result<()> {
        self.get(binding.agent_id).await?;
        if self.store.get_certificate(&binding.cert_id).await?.is_none() {
            return Err(Error::not_found(format!("certificate {}", binding.cert_id)));
        }
        if binding.deploy_path.trim().is_empty() {
            return Err(Error::invalid_input("deploy_path cannot be empty"));
        }
        self.store.put_binding(&binding).await?;
        info!(
            agent_id = %binding.agent_id,
            cert_id = %binding.cert_id,
            deploy_path = %binding.deploy_path,
            "Certificate bound to agent"
        );
        Ok(())
    }

    /// Remove a binding
    pub async fn unbind(&self, agent_id: Uuid, cert_id: &str) -> Result<()> {
        self.store.delete_binding(agent_id, cert_id).await
    }

    /// Path prefix the agent is configured with
    pub fn connection_path(&self, agent: &Agent) -> String {
        format!("/agent/{}/{}", agent.id, agent.signature)
    }

    async fn get(&self, agent_id: Uuid) -> Result<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("agent {}", agent_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Certificate;
    use crate::state::MemoryLifecycleStore;
    use chrono::{Duration, Utc};

    fn registry() -> (AgentRegistry, Arc<MemoryLifecycleStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryLifecycleStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = AgentRegistry::new(
            store.clone(),
            AgentSigner::new("secret").unwrap(),
            clock.clone(),
            AgentProtocolConfig::default(),
        );
        (registry, store, clock)
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let (registry, _, _) = registry();
        let agent = registry.register("web-1").await.unwrap();

        let authed = registry
            .authenticate(&agent.id.to_string(), &agent.signature)
            .await
            .unwrap();
        assert_eq!(authed.id, agent.id);
        assert_eq!(
            registry.connection_path(&agent),
            format!("/agent/{}/{}", agent.id, agent.signature)
        );
    }

    #[tokio::test]
    async fn test_authentication_failures_are_undifferentiated() {
        let (registry, _, _) = registry();
        let agent = registry.register("web-1").await.unwrap();
        let other = registry.register("web-2").await.unwrap();

        for (id, sig) in [
            (agent.id.to_string(), other.signature.clone()),
            ("not-a-uuid".to_string(), agent.signature.clone()),
            (agent.id.to_string(), "deadbeef".to_string()),
        ] {
            let err = registry.authenticate(&id, &sig).await.err().unwrap();
            assert!(matches!(err, Error::SignatureMismatch));
        }
    }

    #[tokio::test]
    async fn test_removed_agent_cannot_authenticate() {
        let (registry, _, _) = registry();
        let agent = registry.register("web-1").await.unwrap();
        registry.remove(agent.id).await.unwrap();

        let err = registry
            .authenticate(&agent.id.to_string(), &agent.signature)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SignatureMismatch));
    }

    #[tokio::test]
    async fn test_heartbeat_drives_status() {
        let (registry, store, clock) = registry();
        let agent = registry.register("web-1").await.unwrap();
        assert_eq!(registry.status(&agent), AgentStatus::Pending);

        registry
            .heartbeat(
                &agent,
                HeartbeatRequest {
                    ip: Some("10.0.0.5".to_string()),
                    version: Some("0.1.0".to_string()),
                },
            )
            .await
            .unwrap();
        let agent = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(registry.status(&agent), AgentStatus::Online);

        clock.advance(Duration::seconds(3 * 300 + 1));
        assert_eq!(registry.status(&agent), AgentStatus::Offline);
    }

    #[tokio::test]
    async fn test_bind_requires_existing_certificate() {
        let (registry, store, _) = registry();
        let agent = registry.register("web-1").await.unwrap();

        let missing = registry
            .bind(AgentCert::new(agent.id, "nope", "/etc/ssl/site"))
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let cert = Certificate::new("example.com", vec![], "p1");
        store.create_certificate(&cert).await.unwrap();
        registry
            .bind(AgentCert::new(agent.id, cert.id.clone(), "/etc/ssl/site"))
            .await
            .unwrap();
        assert_eq!(store.bindings_for_agent(agent.id).await.unwrap().len(), 1);

        registry.unbind(agent.id, &cert.id).await.unwrap();
        assert!(store.bindings_for_agent(agent.id).await.unwrap().is_empty());
    }
}
