// # certsyncd - certificate lifecycle daemon
//
// Thin integration layer: reads configuration from the environment, wires
// the core services to their adapters and runs them until a shutdown
// signal arrives. Issuance, renewal and protocol logic all live in
// certsync-core.
//
// The daemon is responsible for:
// 1. Reading and validating configuration
// 2. Opening the lifecycle store
// 3. Bootstrapping the ACME account and registering DNS providers
// 4. Running the renewal scheduler, the limiter sweep and the agent API
//
// ## Configuration
//
// ### Server
// - `CERTSYNC_LISTEN_ADDR`: Agent API bind address (default `0.0.0.0:8080`)
// - `CERTSYNC_SERVER_SECRET`: Key for agent path signatures (required)
// - `CERTSYNC_TRUST_FORWARDED_FOR`: Rate limit by `X-Forwarded-For` (default false)
// - `CERTSYNC_DOWNLOAD_LIMIT_PER_MINUTE`: Certificate downloads per client IP
//
// ### State Store
// - `CERTSYNC_STATE_STORE_TYPE`: `file` or `memory` (default `file`)
// - `CERTSYNC_STATE_STORE_PATH`: Path to the state file (for file store)
//
// ### ACME
// - `CERTSYNC_ACME_DIRECTORY`: `production`, `staging` or a directory URL
// - `CERTSYNC_ACME_EMAIL`: Account contact address (optional)
// - `CERTSYNC_ACME_ACCOUNT_PATH`: Account credentials file
// - `CERTSYNC_DNS_NAMESERVERS`: Comma-separated resolvers for propagation checks
//
// ### Renewal
// - `CERTSYNC_RENEW_BEFORE_DAYS`: Renewal window (default 30)
// - `CERTSYNC_PROPAGATION_TIMEOUT_SECS`: TXT visibility deadline (default 300)
// - `CERTSYNC_AGENT_POLL_INTERVAL_SECS`: Poll interval for new agents (default 300)
//
// ### Logging
// - `CERTSYNC_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export CERTSYNC_SERVER_SECRET=$(openssl rand -hex 32)
// export CERTSYNC_STATE_STORE_PATH=/var/lib/certsync/state.json
// export CERTSYNC_ACME_EMAIL=ops@example.com
//
// certsyncd
// ```

use anyhow::{Context, Result};
use certsync_acme::{
    AcmeAccountConfig, AcmeDirectory, DnsPropagationChecker, InstantAcmeClient, PropagationConfig,
};
use certsync_core::traits::{LifecycleStore, LogNotifier};
use certsync_core::{
    AgentRegistry, AgentSigner, CertsyncConfig, ChallengeCoordinator, Clock, DownloadRateLimiter,
    FileLifecycleStore, MemoryLifecycleStore, ProviderRegistry, RenewalScheduler, SyncService,
    SystemClock,
};
use certsync_server::{AppState, router};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long running work may take to wind down after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum length of the agent signing secret
const MIN_SECRET_LEN: usize = 16;

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum CertsyncExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<CertsyncExitCode> for ExitCode {
    fn from(code: CertsyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
struct Config {
    listen_addr: SocketAddr,
    server_secret: String,
    trust_forwarded_for: bool,
    state_store_type: String,
    state_store_path: Option<String>,
    acme_directory: AcmeDirectory,
    acme_email: Option<String>,
    acme_account_path: PathBuf,
    nameservers: Vec<IpAddr>,
    core: CertsyncConfig,
    log_level: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("server_secret", &"<REDACTED>")
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("state_store_type", &self.state_store_type)
            .field("state_store_path", &self.state_store_path)
            .field("acme_directory", &self.acme_directory)
            .field("acme_account_path", &self.acme_account_path)
            .field("nameservers", &self.nameservers)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup` (an environment stand-in)
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut core = CertsyncConfig::default();
        if let Some(days) = parse_var(&lookup, "CERTSYNC_RENEW_BEFORE_DAYS")? {
            core.scheduler.renew_before_days = days;
        }
        if let Some(secs) = parse_var(&lookup, "CERTSYNC_PROPAGATION_TIMEOUT_SECS")? {
            core.challenge.propagation_timeout_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "CERTSYNC_AGENT_POLL_INTERVAL_SECS")? {
            core.agent.default_poll_interval_secs = secs;
        }
        if let Some(limit) = parse_var(&lookup, "CERTSYNC_DOWNLOAD_LIMIT_PER_MINUTE")? {
            core.rate_limit.max_requests = limit;
        }

        let nameservers = lookup("CERTSYNC_DNS_NAMESERVERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("CERTSYNC_DNS_NAMESERVERS: invalid address '{}'", s))
            })
            .collect::<Result<Vec<_>>>()?;

        let acme_directory = lookup("CERTSYNC_ACME_DIRECTORY")
            .unwrap_or_default()
            .parse::<AcmeDirectory>()
            .context("CERTSYNC_ACME_DIRECTORY")?;

        Ok(Self {
            listen_addr: parse_var(&lookup, "CERTSYNC_LISTEN_ADDR")?
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            server_secret: lookup("CERTSYNC_SERVER_SECRET").unwrap_or_default(),
            trust_forwarded_for: parse_var(&lookup, "CERTSYNC_TRUST_FORWARDED_FOR")?
                .unwrap_or(false),
            state_store_type: lookup("CERTSYNC_STATE_STORE_TYPE")
                .unwrap_or_else(|| "file".to_string()),
            state_store_path: lookup("CERTSYNC_STATE_STORE_PATH"),
            acme_directory,
            acme_email: lookup("CERTSYNC_ACME_EMAIL").filter(|s| !s.is_empty()),
            acme_account_path: lookup("CERTSYNC_ACME_ACCOUNT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/certsync/acme-account.json")),
            nameservers,
            core,
            log_level: lookup("CERTSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.server_secret.is_empty() {
            anyhow::bail!(
                "CERTSYNC_SERVER_SECRET is required. \
                Set it via: export CERTSYNC_SERVER_SECRET=$(openssl rand -hex 32)"
            );
        }

        if self.server_secret.len() < MIN_SECRET_LEN {
            anyhow::bail!(
                "CERTSYNC_SERVER_SECRET appears too short ({} chars, minimum {}).",
                self.server_secret.len(),
                MIN_SECRET_LEN
            );
        }

        match self.state_store_type.as_str() {
            "file" | "memory" => {}
            _ => anyhow::bail!(
                "CERTSYNC_STATE_STORE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                self.state_store_type
            ),
        }

        if self.state_store_type == "file" {
            match self.state_store_path.as_deref() {
                None | Some("") => anyhow::bail!(
                    "CERTSYNC_STATE_STORE_PATH is required when CERTSYNC_STATE_STORE_TYPE=file. \
                    Set it via: export CERTSYNC_STATE_STORE_PATH=/var/lib/certsync/state.json"
                ),
                Some(path) => {
                    if let Some(parent) = std::path::Path::new(path).parent()
                        && !parent.as_os_str().is_empty()
                        && !parent.exists()
                    {
                        anyhow::bail!(
                            "CERTSYNC_STATE_STORE_PATH parent directory does not exist: {}. \
                            Create it first: sudo mkdir -p {}",
                            parent.display(),
                            parent.display()
                        );
                    }
                }
            }
        }

        if let Some(ref email) = self.acme_email
            && !email.contains('@')
        {
            anyhow::bail!("CERTSYNC_ACME_EMAIL '{}' is not an email address", email);
        }

        parse_log_level(&self.log_level)?;

        self.core
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(())
    }
}

/// Parse an optional variable, failing loudly on malformed values
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "CERTSYNC_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return CertsyncExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return CertsyncExitCode::ConfigError.into();
    }

    let log_level = parse_log_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CertsyncExitCode::ConfigError.into();
    }

    info!("Starting certsyncd");
    debug!(?config, "Configuration loaded");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CertsyncExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match run_daemon(config).await {
            Ok(()) => CertsyncExitCode::CleanShutdown,
            Err(e) => {
                error!("Daemon error: {:#}", e);
                CertsyncExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Run the daemon until SIGTERM/SIGINT
async fn run_daemon(config: Config) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn LifecycleStore> = match config.state_store_type.as_str() {
        "memory" => {
            warn!("Using in-memory state store; state is lost on exit");
            Arc::new(MemoryLifecycleStore::new())
        }
        _ => {
            let path = config.state_store_path.as_deref().unwrap_or_default();
            info!("Using file state store at {}", path);
            Arc::new(FileLifecycleStore::new(path).await?)
        }
    };

    let providers = Arc::new(ProviderRegistry::new());

    #[cfg(feature = "cloudflare")]
    {
        info!("Registering Cloudflare provider");
        certsync_provider_cloudflare::register(&providers);
    }

    info!(directory = %config.acme_directory.url(), "Loading ACME account");
    let acme = InstantAcmeClient::load_or_create(&AcmeAccountConfig {
        directory: config.acme_directory.clone(),
        contact_email: config.acme_email.clone(),
        credentials_path: config.acme_account_path.clone(),
    })
    .await?;

    let mut propagation_config = PropagationConfig::default();
    if !config.nameservers.is_empty() {
        propagation_config.nameservers = config.nameservers.clone();
    }
    let propagation = DnsPropagationChecker::with_config(&propagation_config);

    let coordinator = Arc::new(ChallengeCoordinator::new(
        store.clone(),
        providers,
        Arc::new(acme),
        Arc::new(propagation),
        config.core.challenge.clone(),
    ));

    let (scheduler, mut events) = RenewalScheduler::new(
        store.clone(),
        coordinator,
        Arc::new(LogNotifier),
        clock.clone(),
        config.core.scheduler.clone(),
    )?;

    let registry = Arc::new(AgentRegistry::new(
        store.clone(),
        AgentSigner::new(config.server_secret.as_bytes())?,
        clock.clone(),
        config.core.agent.clone(),
    ));
    let sync = Arc::new(SyncService::new(store.clone(), clock.clone()));
    let limiter = Arc::new(DownloadRateLimiter::new(
        config.core.rate_limit.clone(),
        clock,
    ));
    let sweeper = limiter.spawn_sweeper();

    let app = router(Arc::new(AppState {
        registry,
        sync,
        limiter,
        trust_forwarded_for: config.trust_forwarded_for,
    }));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Agent API listening on {}", config.listen_addr);

    let events_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Scheduler event");
        }
    });

    let (scheduler_tx, scheduler_rx) = oneshot::channel();
    let scheduler_task =
        tokio::spawn(async move { scheduler.run_with_shutdown(scheduler_rx).await });

    let (server_tx, server_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = server_rx.await;
        })
        .await
    });

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);
    info!("Shutting down daemon");

    let _ = scheduler_tx.send(());
    let _ = server_tx.send(());
    sweeper.abort();

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let scheduler_result = scheduler_task.await;
        let server_result = server_task.await;
        let _ = events_task.await;
        (scheduler_result, server_result)
    })
    .await;

    match drained {
        Ok((scheduler_result, server_result)) => {
            scheduler_result.context("Scheduler task panicked")??;
            server_result
                .context("Agent API task panicked")?
                .context("Agent API server failed")?;
            info!("certsyncd stopped");
            Ok(())
        }
        Err(_) => Err(anyhow::anyhow!(
            "Shutdown timeout after {:?}",
            SHUTDOWN_TIMEOUT
        )),
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
