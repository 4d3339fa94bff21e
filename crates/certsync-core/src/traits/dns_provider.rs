// # DNS Challenge Provider Trait
//
// Defines the interface for publishing DNS-01 challenge records via
// provider APIs.
//
// ## Implementations
//
// - Cloudflare: `certsync-provider-cloudflare` crate
// - Aliyun, DNSPod, Route53, GoDaddy: type discriminators only
//
// ## Usage
//
// ```rust,ignore
// use certsync_core::DnsChallengeProvider;
//
// provider
//     .create_record("example.com", "_acme-challenge.www.example.com", "digest")
//     .await?;
// ```

use async_trait::async_trait;

use crate::model::DnsProviderRecord;

/// Trait for DNS provider implementations
///
/// A provider only writes and deletes TXT records. It never retries, never
/// waits for propagation and never touches the store; the
/// [`ChallengeCoordinator`](crate::challenge::ChallengeCoordinator) owns all
/// of that.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait DnsChallengeProvider: Send + Sync {
    /// Create a TXT record
    ///
    /// # Parameters
    ///
    /// - `zone`: Zone the record lives in (e.g., "example.com")
    /// - `name`: Fully qualified record name (e.g., "_acme-challenge.example.com")
    /// - `value`: TXT content
    async fn create_record(&self, zone: &str, name: &str, value: &str)
    -> Result<(), crate::Error>;

    /// Remove a TXT record previously created with the same arguments
    ///
    /// Removing a record that does not exist is not an error.
    async fn remove_record(&self, zone: &str, name: &str, value: &str)
    -> Result<(), crate::Error>;

    /// Get the provider name (for logging/debugging)
    fn provider_name(&self) -> &'static str;
}

/// Helper trait for constructing DNS providers from stored provider records
pub trait DnsProviderFactory: Send + Sync {
    /// Create a provider instance from a provider record
    ///
    /// The record's credentials are already decrypted.
    fn create(
        &self,
        record: &DnsProviderRecord,
    ) -> Result<Box<dyn DnsChallengeProvider>, crate::Error>;
}
