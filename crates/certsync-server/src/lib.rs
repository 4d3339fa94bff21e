// # certsync-server
//
// HTTP surface of the agent sync protocol. Every route carries the agent's
// identity in its path:
//
// - `GET  /agent/{agent_id}/{signature}/config`
// - `GET  /agent/{agent_id}/{signature}/certs`
// - `GET  /agent/{agent_id}/{signature}/cert/{cert_id}` (rate limited per IP)
// - `POST /agent/{agent_id}/{signature}/heartbeat`
// - `POST /agent/{agent_id}/{signature}/status`
//
// Handlers only translate between HTTP and `certsync_core`; authentication,
// binding checks and bookkeeping all live in the core services.

pub mod error;
pub mod extract;
pub mod handlers;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use certsync_core::{AgentRegistry, DownloadRateLimiter, SyncService};
use std::sync::Arc;

pub use error::ApiError;

/// Shared state of the agent protocol router
pub struct AppState {
    /// Agent identities and bindings
    pub registry: Arc<AgentRegistry>,
    /// Config, certificate and status operations
    pub sync: Arc<SyncService>,
    /// Per-IP limiter for certificate downloads
    pub limiter: Arc<DownloadRateLimiter>,
    /// Take the client IP from `X-Forwarded-For` (only behind a trusted proxy)
    pub trust_forwarded_for: bool,
}

/// Build the agent protocol router
pub fn router(state: Arc<AppState>) -> Router {
    let downloads = Router::new()
        .route(
            "/agent/{agent_id}/{signature}/cert/{cert_id}",
            get(handlers::cert_bundle),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::limit_downloads,
        ));

    Router::new()
        .route("/agent/{agent_id}/{signature}/config", get(handlers::config))
        .route("/agent/{agent_id}/{signature}/certs", get(handlers::certs))
        .route(
            "/agent/{agent_id}/{signature}/heartbeat",
            post(handlers::heartbeat),
        )
        .route(
            "/agent/{agent_id}/{signature}/status",
            post(handlers::report_status),
        )
        .merge(downloads)
        .with_state(state)
}
