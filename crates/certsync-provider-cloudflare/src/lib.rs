// # Cloudflare DNS Provider
//
// DNS-01 challenge provider over the Cloudflare API v4.
//
// ## Behavior
//
// - One zone lookup per call unless a zone ID is configured; the lookup
//   walks from the given name towards the apex until Cloudflare knows it
// - Creates `TXT` records with a short TTL
// - Removes records by listing `TXT` entries for the name and deleting the
//   ones whose content matches
// - Status-specific errors (401/403, 404, 409, 429, 5xx); 429 surfaces as
//   `Error::RateLimited`
// - No retries and no waiting; the challenge coordinator owns both
//
// ## Security
//
// - The API token never appears in logs or in `Debug` output
// - The factory refuses an empty token
//
// ## API Reference
//
// - List Zones: GET `/zones?name=...`
// - List DNS Records: GET `/zones/:zone_id/dns_records?type=TXT&name=...`
// - Create DNS Record: POST `/zones/:zone_id/dns_records`
// - Delete DNS Record: DELETE `/zones/:zone_id/dns_records/:record_id`

use async_trait::async_trait;
use certsync_core::model::{DnsProviderRecord, DnsProviderType};
use certsync_core::traits::{DnsChallengeProvider, DnsProviderFactory};
use certsync_core::{Error, ProviderRegistry, Result};
use serde_json::Value;
use std::time::Duration;

/// Cloudflare API base URL
const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// TTL for challenge records (Cloudflare's minimum for non-enterprise zones)
const CHALLENGE_TTL: u32 = 120;

/// Environment variable switching every Cloudflare provider to dry-run
pub const DNS_MODE_ENV: &str = "CERTSYNC_DNS_MODE";

/// Cloudflare DNS-01 provider
///
/// # Dry-Run Mode
///
/// When `dry_run` is true the provider still performs zone and record
/// lookups, logs the intended write and returns success without changing
/// anything.
pub struct CloudflareProvider {
    /// Cloudflare API token (Zone:DNS:Edit)
    api_token: String,

    /// Zone ID (optional, looked up by name otherwise)
    zone_id: Option<String>,

    /// API base URL
    api_base: String,

    /// HTTP client for API requests
    client: reqwest::Client,

    /// Dry-run mode: perform lookups, skip writes
    dry_run: bool,
}

impl std::fmt::Debug for CloudflareProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareProvider")
            .field("api_token", &"<REDACTED>")
            .field("zone_id", &self.zone_id)
            .field("api_base", &self.api_base)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl CloudflareProvider {
    /// Create a new Cloudflare provider
    ///
    /// # Parameters
    ///
    /// - `api_token`: Cloudflare API token with Zone:DNS:Edit permissions
    /// - `zone_id`: Optional zone ID (looked up by name otherwise)
    /// - `dry_run`: If true, perform lookups but skip writes
    pub fn new(api_token: impl Into<String>, zone_id: Option<String>, dry_run: bool) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.is_empty() {
            return Err(Error::config("Cloudflare API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::provider("cloudflare", format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_token,
            zone_id,
            api_base: CLOUDFLARE_API_BASE.to_string(),
            client,
            dry_run,
        })
    }

    /// Create a provider in live mode
    pub fn new_live(api_token: impl Into<String>, zone_id: Option<String>) -> Result<Self> {
        Self::new(api_token, zone_id, false)
    }

    /// Create a provider in dry-run mode
    pub fn new_dry_run(api_token: impl Into<String>, zone_id: Option<String>) -> Result<Self> {
        Self::new(api_token, zone_id, true)
    }

    /// Point the provider at a different API base URL
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Whether writes are skipped
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Resolve the zone ID for `zone`
    ///
    /// Tries `zone` first, then each parent with at least two labels.
    ///
    /// ```http
    /// GET /zones?name=example.com
    /// Authorization: Bearer <token>
    /// ```
    async fn get_zone_id(&self, zone: &str) -> Result<String> {
        if let Some(ref zone_id) = self.zone_id {
            tracing::debug!("Using pre-configured zone ID");
            return Ok(zone_id.clone());
        }

        let candidates = zone_candidates(zone);
        if candidates.is_empty() {
            return Err(Error::invalid_input(format!("Invalid zone name: {}", zone)));
        }

        for candidate in &candidates {
            tracing::debug!(zone = %candidate, "Looking up Cloudflare zone");

            let response = self
                .client
                .get(format!("{}/zones", self.api_base))
                .query(&[("name", candidate.as_str())])
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|e| Error::provider("cloudflare", format!("HTTP request failed: {}", e)))?;
            let json = check_response(response, &format!("Zone lookup for {}", candidate)).await?;

            let zones = json["result"].as_array().ok_or_else(|| {
                Error::provider("cloudflare", "Invalid response format: result is not an array")
            })?;

            if let Some(zone) = zones.first() {
                let zone_id = zone["id"].as_str().ok_or_else(|| {
                    Error::provider("cloudflare", "Invalid response format: zone.id is not a string")
                })?;
                tracing::debug!(zone = %candidate, "Found Cloudflare zone");
                return Ok(zone_id.to_string());
            }
        }

        Err(Error::not_found(format!("Cloudflare zone for {}", zone)))
    }

    /// IDs of the `TXT` records named `name` whose content is `value`
    ///
    /// ```http
    /// GET /zones/:zone_id/dns_records?type=TXT&name=_acme-challenge.example.com
    /// ```
    async fn find_txt_records(&self, zone_id: &str, name: &str, value: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/zones/{}/dns_records", self.api_base, zone_id))
            .query(&[("type", "TXT"), ("name", name)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| Error::provider("cloudflare", format!("HTTP request failed: {}", e)))?;
        let json = check_response(response, &format!("Record lookup for {}", name)).await?;

        let records = json["result"].as_array().ok_or_else(|| {
            Error::provider("cloudflare", "Invalid response format: result is not an array")
        })?;

        Ok(records
            .iter()
            .filter(|record| record["content"].as_str().map(unquote) == Some(value))
            .filter_map(|record| record["id"].as_str().map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl DnsChallengeProvider for CloudflareProvider {
    /// ```http
    /// POST /zones/:zone_id/dns_records
    /// { "type": "TXT", "name": "...", "content": "...", "ttl": 120 }
    /// ```
    async fn create_record(&self, zone: &str, name: &str, value: &str) -> Result<()> {
        tracing::info!(
            record = %name,
            mode = if self.dry_run { "DRY-RUN" } else { "LIVE" },
            "Creating Cloudflare TXT record"
        );

        let zone_id = self.get_zone_id(zone).await?;
        let url = format!("{}/zones/{}/dns_records", self.api_base, zone_id);
        let payload = serde_json::json!({
            "type": "TXT",
            "name": name,
            "content": value,
            "ttl": CHALLENGE_TTL,
        });

        if self.dry_run {
            tracing::info!("[DRY-RUN] Would send POST request to {} with payload: {}", url, payload);
            return Ok(());
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::provider("cloudflare", format!("HTTP request failed: {}", e)))?;
        check_response(response, &format!("Create TXT {}", name)).await?;

        tracing::info!(record = %name, "Cloudflare TXT record created");
        Ok(())
    }

    /// ```http
    /// DELETE /zones/:zone_id/dns_records/:record_id
    /// ```
    async fn remove_record(&self, zone: &str, name: &str, value: &str) -> Result<()> {
        let zone_id = self.get_zone_id(zone).await?;
        let record_ids = self.find_txt_records(&zone_id, name, value).await?;

        if record_ids.is_empty() {
            tracing::debug!(record = %name, "No matching TXT record to remove");
            return Ok(());
        }

        for record_id in record_ids {
            let url = format!("{}/zones/{}/dns_records/{}", self.api_base, zone_id, record_id);

            if self.dry_run {
                tracing::info!("[DRY-RUN] Would send DELETE request to {}", url);
                continue;
            }

            let response = self
                .client
                .delete(&url)
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|e| Error::provider("cloudflare", format!("HTTP request failed: {}", e)))?;
            match check_response(response, &format!("Delete TXT {}", name)).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(record = %name, "Cloudflare TXT record removed");
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "cloudflare"
    }
}

/// Map a non-success status to a specific error, or parse the JSON body
async fn check_response(response: reqwest::Response, context: &str) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| Error::provider("cloudflare", format!("Failed to parse response: {}", e)));
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());

    Err(match status.as_u16() {
        401 | 403 => Error::provider(
            "cloudflare",
            format!(
                "Authentication failed: Invalid API token or insufficient permissions. Status: {}",
                status
            ),
        ),
        404 => Error::not_found(format!("{}: {}", context, status)),
        409 => Error::provider(
            "cloudflare",
            format!("Conflict: {} - {}", context, error_text),
        ),
        429 => Error::rate_limited(format!(
            "Cloudflare rate limit exceeded during {}. Status: {}",
            context, status
        )),
        500..=599 => Error::provider(
            "cloudflare",
            format!("Cloudflare server error (transient): {} - {}", status, error_text),
        ),
        _ => Error::provider(
            "cloudflare",
            format!("{} failed: {} - {}", context, status, error_text),
        ),
    })
}

/// `a.b.example.com` → `[a.b.example.com, b.example.com, example.com]`
fn zone_candidates(zone: &str) -> Vec<String> {
    let zone = zone.trim_end_matches('.');
    let labels: Vec<&str> = zone.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Vec::new();
    }
    (0..=labels.len() - 2)
        .map(|start| labels[start..].join("."))
        .collect()
}

/// Cloudflare may return TXT content wrapped in quotes
fn unquote(content: &str) -> &str {
    content
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(content)
}

/// Factory for creating Cloudflare providers
///
/// Reads `api_token` (required) and `zone_id` (optional) from the provider
/// record's credentials.
pub struct CloudflareFactory;

impl DnsProviderFactory for CloudflareFactory {
    fn create(&self, record: &DnsProviderRecord) -> Result<Box<dyn DnsChallengeProvider>> {
        if record.provider_type != DnsProviderType::Cloudflare {
            return Err(Error::config(format!(
                "Invalid provider type for Cloudflare factory: {}",
                record.provider_type
            )));
        }

        let api_token = record.credentials["api_token"].as_str().unwrap_or_default();
        if api_token.is_empty() {
            return Err(Error::config(format!(
                "Cloudflare API token is required for provider '{}'",
                record.name
            )));
        }
        let zone_id = record.credentials["zone_id"].as_str().map(str::to_string);

        let dry_run = std::env::var(DNS_MODE_ENV)
            .unwrap_or_default()
            .eq_ignore_ascii_case("dry-run");
        if dry_run {
            tracing::warn!("Cloudflare provider running in DRY-RUN mode - no changes will be made");
        }

        Ok(Box::new(CloudflareProvider::new(api_token, zone_id, dry_run)?))
    }
}

/// Register the Cloudflare provider with a registry
///
/// # Example
///
/// ```rust
/// use certsync_core::ProviderRegistry;
///
/// let registry = ProviderRegistry::new();
/// certsync_provider_cloudflare::register(&registry);
/// ```
pub fn register(registry: &ProviderRegistry) {
    registry.register_provider(DnsProviderType::Cloudflare, Box::new(CloudflareFactory));
}
