// # certsync-core
//
// Core library for the certificate lifecycle and distribution system.
//
// ## Architecture Overview
//
// - **ChallengeCoordinator**: ACME order → DNS-01 records → propagation wait
//   → validation → finalize → download
// - **RenewalScheduler**: daily and retry sweeps, backoff, notifications,
//   task logs
// - **AgentRegistry / SyncService**: signed agent identity and the
//   pull-based config/certificate protocol
// - **DownloadRateLimiter**: per-IP limit on certificate downloads
// - **ProviderRegistry**: plugin registry of DNS provider factories
// - **LifecycleStore**: persistence contract, with memory and file backends
//
// ## Design Principles
//
// 1. **Capabilities behind traits**: DNS providers, the CA, DNS lookups,
//    persistence and notifications are all trait objects
// 2. **All-or-nothing issuance**: material reaches the store in one update
// 3. **Plugin-based**: providers are registered by type, no hard-coded
//    if-else
// 4. **Library-first**: the daemon and the agent are thin shells

pub mod agent;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod error;
pub mod material;
pub mod model;
pub mod ratelimit;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use agent::{AgentRegistry, AgentSigner, SyncService};
pub use challenge::ChallengeCoordinator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AgentProtocolConfig, CertsyncConfig, ChallengeConfig, RateLimitConfig, SchedulerConfig,
};
pub use error::{Error, Result};
pub use material::IssuedCertificate;
pub use ratelimit::DownloadRateLimiter;
pub use registry::ProviderRegistry;
pub use scheduler::{AttemptOutcome, RenewalScheduler, SchedulerEvent, Trigger};
pub use state::{FileLifecycleStore, MemoryLifecycleStore};
pub use traits::{
    AcmeClient, DnsChallengeProvider, LifecycleStore, Notifier, PropagationChecker,
};
