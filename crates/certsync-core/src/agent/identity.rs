//! Signed agent identity
//!
//! An agent's credential is `hex(HMAC-SHA256(server_secret, uuid))`. It is
//! embedded in every request path and recomputed on the server, so nothing
//! secret has to be stored per agent.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Computes and verifies agent path signatures
#[derive(Clone)]
pub struct AgentSigner {
    mac: HmacSha256,
}

impl AgentSigner {
    /// Create a signer keyed by the server secret
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::config("Agent signing secret cannot be empty"));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::config(format!("Invalid agent signing secret: {}", e)))?;
        Ok(Self { mac })
    }

    /// Signature for `agent_id`, lowercase hex
    pub fn sign(&self, agent_id: &Uuid) -> String {
        let mut mac = self.mac.clone();
        mac.update(agent_id.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a presented signature
    pub fn verify(&self, agent_id: &Uuid, signature: &str) -> bool {
        let Ok(presented) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(agent_id.to_string().as_bytes());
        mac.verify_slice(&presented).is_ok()
    }
}

impl fmt::Debug for AgentSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSigner")
            .field("secret", &"<REDACTED>")
            .finish()
    }
}
