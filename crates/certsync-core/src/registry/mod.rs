//! Plugin-based DNS provider registry
//!
//! Each provider crate registers one factory per [`DnsProviderType`]; the
//! challenge coordinator turns a stored [`DnsProviderRecord`] into a live
//! provider without any hardcoded match on provider names.
//!
//! ## Registration
//!
//! ```rust,ignore
//! // In certsync-provider-cloudflare
//! pub fn register(registry: &ProviderRegistry) {
//!     registry.register_provider(DnsProviderType::Cloudflare, Box::new(CloudflareFactory));
//! }
//! ```

use crate::error::{Error, Result};
use crate::model::{DnsProviderRecord, DnsProviderType};
use crate::traits::{DnsChallengeProvider, DnsProviderFactory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Provider registry for plugin-based DNS provider creation
///
/// Interior mutability lets providers register through a shared reference
/// after the registry has been wrapped in an `Arc`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<DnsProviderType, Box<dyn DnsProviderFactory>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a DNS provider factory, replacing any previous one for the type
    pub fn register_provider(
        &self,
        provider_type: DnsProviderType,
        factory: Box<dyn DnsProviderFactory>,
    ) {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        providers.insert(provider_type, factory);
    }

    /// Create a DNS provider from a stored provider record
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn DnsChallengeProvider>)`: Created provider instance
    /// - `Err(Error)`: If the type is not registered or creation fails
    pub fn create_provider(
        &self,
        record: &DnsProviderRecord,
    ) -> Result<Box<dyn DnsChallengeProvider>> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);

        let factory = providers.get(&record.provider_type).ok_or_else(|| {
            Error::config(format!(
                "Unknown provider type: {} (provider '{}')",
                record.provider_type, record.name
            ))
        })?;

        factory.create(record)
    }

    /// List all registered provider types
    pub fn list_providers(&self) -> Vec<DnsProviderType> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers.keys().copied().collect()
    }

    /// Check if a provider type is registered
    pub fn has_provider(&self, provider_type: DnsProviderType) -> bool {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers.contains_key(&provider_type)
    }
}
