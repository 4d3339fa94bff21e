//! Certificate material helpers
//!
//! Key/CSR generation, chain splitting, leaf validity parsing and the
//! content fingerprint agents use for change detection.

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, KeyPair};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const PEM_CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_CERT_END: &str = "-----END CERTIFICATE-----";

/// SHA-256 hex digest of `data`
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A freshly generated private key and the matching CSR
pub struct KeyAndCsr {
    /// PKCS#8 PEM private key
    pub key_pem: String,
    /// DER-encoded certificate signing request
    pub csr_der: Vec<u8>,
}

/// Generate a new key pair and a CSR covering `identifiers`
pub fn generate_key_and_csr(identifiers: &[String]) -> Result<KeyAndCsr> {
    let key = KeyPair::generate()
        .map_err(|e| Error::acme(format!("Failed to generate key pair: {}", e)))?;
    let params = CertificateParams::new(identifiers.to_vec())
        .map_err(|e| Error::invalid_input(format!("Invalid certificate names: {}", e)))?;
    let csr = params
        .serialize_request(&key)
        .map_err(|e| Error::acme(format!("Failed to build CSR: {}", e)))?;

    Ok(KeyAndCsr {
        key_pem: key.serialize_pem(),
        csr_der: csr.der().to_vec(),
    })
}

/// Split a PEM chain into its certificate blocks, in order
pub fn split_pem_chain(chain: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = chain;
    while let Some(start) = rest.find(PEM_CERT_BEGIN) {
        let Some(end) = rest[start..].find(PEM_CERT_END) else {
            break;
        };
        let end = start + end + PEM_CERT_END.len();
        blocks.push(format!("{}\n", &rest[start..end]));
        rest = &rest[end..];
    }
    blocks
}

/// Validity window of a PEM certificate
pub fn parse_validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::certificate_parse(format!("Invalid PEM: {}", e)))?;
    let x509 = pem
        .parse_x509()
        .map_err(|e| Error::certificate_parse(format!("Invalid X.509: {}", e)))?;

    let validity = x509.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| Error::certificate_parse("notBefore out of range"))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| Error::certificate_parse("notAfter out of range"))?;

    Ok((not_before, not_after))
}

/// Certificate material produced by one successful issuance
#[derive(Clone)]
pub struct IssuedCertificate {
    /// Leaf followed by the issuer chain, as downloaded
    pub fullchain_pem: String,
    /// Leaf certificate
    pub cert_pem: String,
    /// Issuer chain (may be empty)
    pub ca_pem: String,
    /// Private key
    pub key_pem: String,
    /// Leaf notBefore
    pub issued_at: DateTime<Utc>,
    /// Leaf notAfter
    pub expires_at: DateTime<Utc>,
    /// SHA-256 hex of `fullchain_pem`
    pub fingerprint: String,
}

impl IssuedCertificate {
    /// Build the bundle from a downloaded chain and the key used for the CSR
    pub fn from_chain(fullchain_pem: String, key_pem: String) -> Result<Self> {
        let blocks = split_pem_chain(&fullchain_pem);
        let Some((leaf, issuers)) = blocks.split_first() else {
            return Err(Error::certificate_parse("No certificate in downloaded chain"));
        };

        let (issued_at, expires_at) = parse_validity(leaf)?;

        Ok(Self {
            fingerprint: fingerprint(fullchain_pem.as_bytes()),
            cert_pem: leaf.clone(),
            ca_pem: issuers.concat(),
            fullchain_pem,
            key_pem,
            issued_at,
            expires_at,
        })
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("fingerprint", &self.fingerprint)
            .field("key_pem", &"<REDACTED>")
            .finish()
    }
}
