//! Error types for the certsync system
//!
//! This module defines all error types used throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for certsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the certsync system
#[derive(Error, Debug)]
pub enum Error {
    /// DNS provider API failure (record create/remove)
    #[error("DNS provider error ({provider}): {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// The challenge TXT record never became visible
    #[error("DNS propagation timeout for record '{record}' after {elapsed:?}")]
    PropagationTimeout {
        /// Fully qualified record name
        record: String,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// The certificate authority refused the authorization or order
    #[error("Validation rejected for '{identifier}': {message}")]
    ValidationRejected {
        /// Identifier (domain) that failed validation
        identifier: String,
        /// Reason reported by the CA
        message: String,
    },

    /// The certificate authority is throttling us
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Any other ACME protocol failure
    #[error("ACME error: {0}")]
    Acme(String),

    /// Issued certificate could not be parsed
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    /// Agent path signature did not verify (or the agent is unknown)
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// Agent <-> server transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// State store-related errors
    #[error("State store error: {0}")]
    StateStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// DNS provider still referenced by certificates
    #[error("DNS provider '{provider}' is referenced by {certificates} certificate(s)")]
    ProviderInUse {
        /// Provider name
        provider: String,
        /// Number of referencing certificates
        certificates: usize,
    },

    /// Another issuance for the same certificate is running
    #[error("Issuance already in progress for certificate {0}")]
    IssuanceInProgress(String),

    /// Task log already carries a terminal status
    #[error("Task {0} already finished")]
    TaskFinished(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a DNS provider error
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a validation rejection
    pub fn rejected(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationRejected {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    /// Create a rate limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create an ACME protocol error
    pub fn acme(msg: impl Into<String>) -> Self {
        Self::Acme(msg.into())
    }

    /// Create a certificate parse error
    pub fn certificate_parse(msg: impl Into<String>) -> Self {
        Self::CertificateParse(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a state store error
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the scheduler will pick this failure up again on its own.
    ///
    /// Every issuance failure goes back through the backoff table; only
    /// caller mistakes and auth rejections are not worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::SignatureMismatch
                | Self::Config(_)
                | Self::InvalidInput(_)
                | Self::NotFound(_)
                | Self::ProviderInUse { .. }
                | Self::TaskFinished(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuance_failures_are_retryable() {
        assert!(Error::provider("cloudflare", "boom").is_retryable());
        assert!(Error::rate_limited("too many orders").is_retryable());
        assert!(Error::rejected("example.com", "bad TXT").is_retryable());
        assert!(
            Error::PropagationTimeout {
                record: "_acme-challenge.example.com".to_string(),
                elapsed: Duration::from_secs(300),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_signature_mismatch_does_not_leak_detail() {
        assert_eq!(Error::SignatureMismatch.to_string(), "Signature mismatch");
        assert!(!Error::SignatureMismatch.is_retryable());
    }
}
