//! [`AcmeClient`] on top of `instant-acme`
//!
//! Owns the ACME account. Account credentials are loaded from a JSON file
//! when present, otherwise a new account is registered and its credentials
//! written there with owner-only permissions. The file records the directory
//! the account belongs to; credentials for another directory are replaced by
//! a fresh registration.

use async_trait::async_trait;
use certsync_core::error::{Error, Result};
use certsync_core::traits::{AcmeClient, AcmeOrder, AcmeOrderStatus, PendingAuthorization};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus, Problem,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// ACME problem type the CA uses for rate limiting
const RATE_LIMITED_PROBLEM: &str = "urn:ietf:params:acme:error:rateLimited";

/// Which ACME directory to talk to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcmeDirectory {
    /// Let's Encrypt production
    LetsEncryptProduction,
    /// Let's Encrypt staging
    LetsEncryptStaging,
    /// Any other RFC 8555 directory URL
    Custom(String),
}

impl AcmeDirectory {
    /// Directory URL
    pub fn url(&self) -> &str {
        match self {
            Self::LetsEncryptProduction => LetsEncrypt::Production.url(),
            Self::LetsEncryptStaging => LetsEncrypt::Staging.url(),
            Self::Custom(url) => url,
        }
    }
}

impl FromStr for AcmeDirectory {
    type Err = Error;

    /// `production`, `staging`, or an `https://` directory URL
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "production" => Ok(Self::LetsEncryptProduction),
            "staging" => Ok(Self::LetsEncryptStaging),
            url if url.starts_with("https://") => Ok(Self::Custom(url.to_string())),
            other => Err(Error::config(format!(
                "Invalid ACME directory '{}': expected production, staging or an https:// URL",
                other
            ))),
        }
    }
}

/// Contents of the credentials file
#[derive(Serialize, Deserialize)]
struct StoredAccount<C> {
    /// Directory URL the account was registered with
    directory: String,
    credentials: C,
}

/// Credentials from a stored account document, if they belong to `directory`
fn credentials_for<C: DeserializeOwned>(json: &str, directory: &str) -> Option<C> {
    match serde_json::from_str::<StoredAccount<C>>(json) {
        Ok(stored) if stored.directory == directory => Some(stored.credentials),
        Ok(stored) => {
            warn!(
                stored = %stored.directory,
                configured = %directory,
                "Stored ACME account belongs to another directory"
            );
            None
        }
        Err(e) => {
            warn!("Stored ACME account is unreadable: {}", e);
            None
        }
    }
}

/// Account settings
#[derive(Debug, Clone)]
pub struct AcmeAccountConfig {
    /// Directory to register with
    pub directory: AcmeDirectory,
    /// Contact address (without `mailto:`)
    pub contact_email: Option<String>,
    /// Where account credentials are stored
    pub credentials_path: PathBuf,
}

/// ACME client bound to one account
pub struct InstantAcmeClient {
    account: Account,
    directory: AcmeDirectory,
}

impl InstantAcmeClient {
    /// Load the account from `credentials_path`, or register a new one
    ///
    /// A file written for a different directory, or one that cannot be
    /// parsed, is overwritten by the new registration.
    pub async fn load_or_create(config: &AcmeAccountConfig) -> Result<Self> {
        let stored = if config.credentials_path.exists() {
            let json = tokio::fs::read_to_string(&config.credentials_path).await?;
            credentials_for::<AccountCredentials>(&json, config.directory.url())
        } else {
            None
        };

        if let Some(credentials) = stored {
            info!(path = %config.credentials_path.display(), "Loading ACME account");
            let account = Account::builder()
                .map_err(|e| Error::acme(format!("Failed to build ACME client: {}", e)))?
                .from_credentials(credentials)
                .await
                .map_err(|e| map_acme_error("Failed to load ACME account", e))?;
            return Ok(Self {
                account,
                directory: config.directory.clone(),
            });
        }

        info!(directory = %config.directory.url(), "Registering new ACME account");
        let contact = config
            .contact_email
            .as_ref()
            .map(|email| format!("mailto:{}", email));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::builder()
            .map_err(|e| Error::acme(format!("Failed to build ACME client: {}", e)))?
            .create(
                &NewAccount {
                    contact: &contact,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                config.directory.url().to_owned(),
                None,
            )
            .await
            .map_err(|e| map_acme_error("Failed to register ACME account", e))?;

        let json = serde_json::to_string_pretty(&StoredAccount {
            directory: config.directory.url().to_owned(),
            credentials,
        })?;
        write_private(&config.credentials_path, json.as_bytes())?;
        info!(path = %config.credentials_path.display(), "ACME account registered");

        Ok(Self {
            account,
            directory: config.directory.clone(),
        })
    }

    /// Directory this client talks to
    pub fn directory(&self) -> &AcmeDirectory {
        &self.directory
    }
}

impl fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn new_order(&self, identifiers: &[String]) -> Result<Box<dyn AcmeOrder>> {
        let ids: Vec<Identifier> = identifiers
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect();

        debug!(identifiers = ?identifiers, "Creating ACME order");
        let order = self
            .account
            .new_order(&NewOrder::new(&ids))
            .await
            .map_err(|e| map_acme_error("Failed to create order", e))?;

        Ok(Box::new(InstantAcmeOrder { order }))
    }
}

struct InstantAcmeOrder {
    order: Order,
}

impl InstantAcmeOrder {
    /// First challenge problem reported on any authorization
    async fn challenge_problem(&mut self) -> Option<String> {
        let mut authorizations = self.order.authorizations();
        while let Some(result) = authorizations.next().await {
            let Ok(authz) = result else {
                continue;
            };
            if let Some(problem) = authz.challenges.iter().find_map(|c| c.error.as_ref()) {
                return Some(describe_problem(problem));
            }
        }
        None
    }
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>> {
        let mut pending = Vec::new();
        let mut authorizations = self.order.authorizations();

        while let Some(result) = authorizations.next().await {
            let mut authz =
                result.map_err(|e| map_acme_error("Failed to fetch authorization", e))?;

            let identifier = authz.identifier();
            let Identifier::Dns(domain) = identifier.identifier else {
                continue;
            };
            let name = if identifier.wildcard {
                format!("*.{}", domain)
            } else {
                domain.clone()
            };

            if authz.status == AuthorizationStatus::Valid {
                debug!(identifier = %name, "Authorization already valid");
                continue;
            }

            let challenge = authz.challenge(ChallengeType::Dns01).ok_or_else(|| {
                Error::acme(format!("No DNS-01 challenge offered for {}", name))
            })?;

            pending.push(PendingAuthorization {
                identifier: name,
                challenge_url: challenge.url.clone(),
                key_authorization: challenge.key_authorization().as_str().to_string(),
            });
        }

        Ok(pending)
    }

    async fn set_challenge_ready(&mut self, challenge_url: &str) -> Result<()> {
        let mut authorizations = self.order.authorizations();

        while let Some(result) = authorizations.next().await {
            let mut authz =
                result.map_err(|e| map_acme_error("Failed to fetch authorization", e))?;

            let matches = authz
                .challenges
                .iter()
                .any(|c| c.r#type == ChallengeType::Dns01 && c.url == challenge_url);
            if !matches {
                continue;
            }
            if let Some(mut challenge) = authz.challenge(ChallengeType::Dns01) {
                return challenge
                    .set_ready()
                    .await
                    .map_err(|e| map_acme_error("Failed to mark challenge ready", e));
            }
        }

        Err(Error::acme(format!(
            "Challenge not found for URL: {}",
            challenge_url
        )))
    }

    async fn refresh(&mut self) -> Result<AcmeOrderStatus> {
        let (status, order_problem) = {
            let state = self
                .order
                .refresh()
                .await
                .map_err(|e| map_acme_error("Failed to refresh order", e))?;
            let status = match state.status {
                OrderStatus::Pending => Some(AcmeOrderStatus::Pending),
                OrderStatus::Ready => Some(AcmeOrderStatus::Ready),
                OrderStatus::Processing => Some(AcmeOrderStatus::Processing),
                OrderStatus::Valid => Some(AcmeOrderStatus::Valid),
                OrderStatus::Invalid => None,
            };
            (status, state.error.as_ref().map(describe_problem))
        };

        if let Some(status) = status {
            return Ok(status);
        }

        // Challenge problems carry the CA's validation detail
        let reason = match self.challenge_problem().await {
            Some(reason) => reason,
            None => order_problem.unwrap_or_else(|| "order became invalid".to_string()),
        };
        warn!(reason = %reason, "ACME order invalid");
        Ok(AcmeOrderStatus::Invalid(reason))
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
        self.order
            .finalize_csr(csr_der)
            .await
            .map_err(|e| map_acme_error("Failed to finalize order", e))
    }

    async fn certificate(&mut self) -> Result<Option<String>> {
        self.order
            .certificate()
            .await
            .map_err(|e| map_acme_error("Failed to download certificate", e))
    }
}

fn describe_problem(problem: &Problem) -> String {
    match (&problem.detail, &problem.r#type) {
        (Some(detail), _) => detail.clone(),
        (None, Some(kind)) => kind.clone(),
        (None, None) => "unspecified ACME problem".to_string(),
    }
}

/// Map an `instant-acme` failure into the core taxonomy
fn map_acme_error(context: &str, err: instant_acme::Error) -> Error {
    match err {
        instant_acme::Error::Api(problem) => {
            classify_problem(context, problem.r#type.as_deref(), describe_problem(&problem))
        }
        other => Error::acme(format!("{}: {}", context, other)),
    }
}

fn classify_problem(context: &str, kind: Option<&str>, detail: String) -> Error {
    if kind == Some(RATE_LIMITED_PROBLEM) {
        Error::rate_limited(format!("{}: {}", context, detail))
    } else {
        Error::acme(format!("{}: {}", context, detail))
    }
}

/// Write `data` to `path` readable by the owner only
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
