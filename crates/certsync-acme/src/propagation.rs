//! DNS propagation checks for DNS-01 challenges
//!
//! Queries public resolvers directly, with caching disabled, so a freshly
//! published TXT record is seen as soon as it is served.

use async_trait::async_trait;
use certsync_core::error::{Error, Result};
use certsync_core::traits::PropagationChecker;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::trace;

/// Resolver settings for propagation checks
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Nameservers to query (empty = system configuration)
    pub nameservers: Vec<IpAddr>,
    /// Per-query timeout
    pub query_timeout: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ],
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// [`PropagationChecker`] backed by `hickory-resolver`
pub struct DnsPropagationChecker {
    resolver: TokioResolver,
}

impl DnsPropagationChecker {
    /// Checker using the default public resolvers
    pub fn new() -> Self {
        Self::with_config(&PropagationConfig::default())
    }

    /// Checker using `config`
    pub fn with_config(config: &PropagationConfig) -> Self {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.nameservers {
                resolver_config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = config.query_timeout;
        opts.attempts = 2;
        opts.cache_size = 0;

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self { resolver }
    }
}

impl Default for DnsPropagationChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PropagationChecker for DnsPropagationChecker {
    async fn is_visible(&self, fqdn: &str, expected: &str) -> Result<bool> {
        match self.resolver.txt_lookup(fqdn).await {
            Ok(records) => {
                let values: Vec<String> = records
                    .iter()
                    .map(|txt| txt_value(txt.txt_data()))
                    .collect();
                trace!(record = %fqdn, found = ?values, "TXT lookup");
                Ok(contains_value(&values, expected))
            }
            Err(e) if is_transient(&e.to_string()) => {
                trace!(record = %fqdn, error = %e, "TXT record not visible yet");
                Ok(false)
            }
            Err(e) => Err(Error::network(format!(
                "DNS lookup failed for '{}': {}",
                fqdn, e
            ))),
        }
    }
}

/// Join the character-strings of one TXT record
fn txt_value(parts: &[Box<[u8]>]) -> String {
    parts
        .iter()
        .map(|part| String::from_utf8_lossy(part))
        .collect()
}

fn contains_value(values: &[String], expected: &str) -> bool {
    values.iter().any(|value| value == expected)
}

/// Lookup failures expected while a record propagates
fn is_transient(message: &str) -> bool {
    let message = message.to_lowercase();
    [
        "no records found",
        "no record found",
        "nxdomain",
        "record not found",
        "no connections available",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}
