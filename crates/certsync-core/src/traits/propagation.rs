use async_trait::async_trait;

/// Checks whether a challenge TXT value is publicly visible
#[async_trait]
pub trait PropagationChecker: Send + Sync {
    /// Whether `fqdn` currently resolves to a TXT set containing `expected`
    ///
    /// Lookup failures that may clear up on their own (NXDOMAIN, SERVFAIL)
    /// should be reported as `Ok(false)`.
    async fn is_visible(&self, fqdn: &str, expected: &str) -> Result<bool, crate::Error>;
}
