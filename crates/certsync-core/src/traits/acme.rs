// # ACME Client Trait
//
// The narrow slice of RFC 8555 the challenge coordinator needs: place an
// order, read its DNS-01 challenges, signal readiness, poll, finalize and
// download. Account management stays in the implementation.
//
// ## Implementations
//
// - `instant-acme`: `certsync-acme` crate

use async_trait::async_trait;

/// One pending DNS-01 authorization of an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    /// Identifier being validated (may start with `*.`)
    pub identifier: String,
    /// URL of the DNS-01 challenge, handed back to `set_challenge_ready`
    pub challenge_url: String,
    /// Key authorization (`token.thumbprint`) for the challenge
    pub key_authorization: String,
}

/// Order status as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcmeOrderStatus {
    /// Authorizations still pending
    Pending,
    /// All authorizations valid; ready to finalize
    Ready,
    /// CA is issuing
    Processing,
    /// Certificate available
    Valid,
    /// Order failed; carries the CA's reason
    Invalid(String),
}

/// Factory for ACME orders on an already-registered account
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Place a new order for `identifiers`
    async fn new_order(&self, identifiers: &[String]) -> Result<Box<dyn AcmeOrder>, crate::Error>;
}

/// An in-flight ACME order
#[async_trait]
pub trait AcmeOrder: Send {
    /// DNS-01 challenges of every authorization that is still pending
    ///
    /// Already-valid authorizations are omitted.
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, crate::Error>;

    /// Tell the CA the challenge at `challenge_url` can be validated
    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<(), crate::Error>;

    /// Re-fetch the order and return its status
    async fn refresh(&mut self) -> Result<AcmeOrderStatus, crate::Error>;

    /// Submit the DER-encoded CSR
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), crate::Error>;

    /// PEM chain once the order is valid, `None` while still processing
    async fn certificate(&mut self) -> Result<Option<String>, crate::Error>;
}
