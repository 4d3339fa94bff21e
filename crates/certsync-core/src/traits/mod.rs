//! Core traits for the certsync system
//!
//! The lifecycle engine only talks to the outside world through these seams:
//!
//! - [`DnsChallengeProvider`]: publish/withdraw DNS-01 TXT records
//! - [`AcmeClient`] / [`AcmeOrder`]: the certificate authority
//! - [`PropagationChecker`]: is a TXT value visible yet
//! - [`LifecycleStore`]: persisted certificates, providers, agents, tasks
//! - [`Notifier`]: fire-and-forget renewal alerts

pub mod acme;
pub mod dns_provider;
pub mod lifecycle_store;
pub mod notifier;
pub mod propagation;

pub use acme::{AcmeClient, AcmeOrder, AcmeOrderStatus, PendingAuthorization};
pub use dns_provider::{DnsChallengeProvider, DnsProviderFactory};
pub use lifecycle_store::LifecycleStore;
pub use notifier::{LogNotifier, Notifier};
pub use propagation::PropagationChecker;
