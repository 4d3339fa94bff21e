// # certsync-agent
//
// Command line entry point. Parses flags (with environment fallbacks),
// installs logging and runs the poll loop until SIGTERM/SIGINT, or a single
// cycle with `--once`.
//
// ## Example
//
// ```bash
// certsync-agent \
//   --server https://certs.example.com \
//   --agent-id 5f0c2a8e-0a55-4f43-9d0b-3c1e5f6a7b8c \
//   --signature "$CERTSYNC_AGENT_SIGNATURE" \
//   --state-file /var/lib/certsync-agent/state.json
// ```

use anyhow::{Context, Result};
use certsync_agent::client::DEFAULT_HTTP_TIMEOUT;
use certsync_agent::state::LocalStateFile;
use certsync_agent::{AgentRunner, HttpServerApi, ShellReloader};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum AgentExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<AgentExitCode> for ExitCode {
    fn from(code: AgentExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Pull certificates from a certsync server and deploy them locally
#[derive(Parser)]
#[command(name = "certsync-agent", version, about)]
struct Cli {
    /// Server base URL
    #[arg(long, env = "CERTSYNC_SERVER")]
    server: String,

    /// Agent ID issued at registration
    #[arg(long, env = "CERTSYNC_AGENT_ID")]
    agent_id: Uuid,

    /// Agent signature issued at registration
    #[arg(long, env = "CERTSYNC_AGENT_SIGNATURE", hide_env_values = true)]
    signature: String,

    /// Where deployed fingerprints are remembered
    #[arg(
        long,
        env = "CERTSYNC_AGENT_STATE_FILE",
        default_value = "/var/lib/certsync-agent/state.json"
    )]
    state_file: PathBuf,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// trace, debug, info, warn or error
    #[arg(long, env = "CERTSYNC_LOG_LEVEL", default_value = "info", value_parser = parse_log_level)]
    log_level: Level,

    /// Bound on each reload command, in seconds
    #[arg(long, default_value_t = 60)]
    reload_timeout: u64,

    /// Bound on each server request, in seconds
    #[arg(long, default_value_t = DEFAULT_HTTP_TIMEOUT.as_secs())]
    http_timeout: u64,
}

fn parse_log_level(level: &str) -> std::result::Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "'{}' is not valid. Valid levels: trace, debug, info, warn, error",
            level
        )),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return AgentExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return AgentExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        let mut runner = match build_runner(&cli).await {
            Ok(runner) => runner,
            Err(e) => {
                error!("Startup failed: {:#}", e);
                return AgentExitCode::ConfigError;
            }
        };

        let result = if cli.once {
            runner.run_cycle().await.map(|_| ()).map_err(anyhow::Error::from)
        } else {
            run_until_signal(&mut runner).await
        };

        match result {
            Ok(()) => AgentExitCode::CleanShutdown,
            Err(e) => {
                error!("Agent error: {:#}", e);
                AgentExitCode::RuntimeError
            }
        }
    })
    .into()
}

async fn build_runner(cli: &Cli) -> Result<AgentRunner> {
    let api = HttpServerApi::new(
        &cli.server,
        cli.agent_id,
        &cli.signature,
        Duration::from_secs(cli.http_timeout),
    )?;
    let reloader = ShellReloader::new(Duration::from_secs(cli.reload_timeout));
    let state_file = LocalStateFile::open(&cli.state_file)
        .await
        .with_context(|| format!("Cannot use state file {}", cli.state_file.display()))?;

    info!(
        agent_id = %cli.agent_id,
        server = %cli.server,
        "Starting certsync-agent"
    );
    Ok(AgentRunner::new(Arc::new(api), Arc::new(reloader), state_file).await?)
}

async fn run_until_signal(runner: &mut AgentRunner) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => error!("Signal handling failed: {}", e),
        }
        let _ = tx.send(());
    });
    runner.run_with_shutdown(rx).await?;
    Ok(())
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
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
