//! Agent identity and the server side of the sync protocol
//!
//! - [`AgentSigner`]: HMAC path signatures
//! - [`AgentRegistry`]: registration, authentication, bindings, heartbeats
//! - [`SyncService`]: config, certificate bytes, status reports
//! - [`protocol`]: JSON wire types shared with the agent

pub mod identity;
pub mod protocol;
pub mod registry;
pub mod sync;

pub use identity::AgentSigner;
pub use protocol::{
    AgentCertConfig, AgentConfigResponse, CertBundle, CertMetadata, HeartbeatRequest,
    StatusReport,
};
pub use registry::AgentRegistry;
pub use sync::SyncService;
