//! Agent protocol handlers

use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use certsync_core::Error;
use certsync_core::agent::{
    AgentConfigResponse, CertBundle, CertMetadata, HeartbeatRequest, StatusReport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::{AuthenticatedAgent, ClientIp};

/// `{cert_id}` segment of the download route
#[derive(Debug, Deserialize)]
pub struct CertPath {
    /// Certificate ID
    pub cert_id: String,
}

/// Response of `POST .../status`
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusAccepted {
    /// Bindings whose bookkeeping was updated
    pub updated: usize,
}

/// `GET /agent/{agent_id}/{signature}/config`
pub async fn config(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
) -> Result<Json<AgentConfigResponse>, ApiError> {
    Ok(Json(state.sync.config(&agent).await?))
}

/// `GET /agent/{agent_id}/{signature}/certs`
pub async fn certs(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
) -> Result<Json<Vec<CertMetadata>>, ApiError> {
    Ok(Json(state.sync.certs(&agent).await?))
}

/// `GET /agent/{agent_id}/{signature}/cert/{cert_id}`
pub async fn cert_bundle(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Path(path): Path<CertPath>,
) -> Result<Json<CertBundle>, ApiError> {
    let bundle = state.sync.cert_bundle(&agent, &path.cert_id).await?;
    debug!(agent_id = %agent.id, cert_id = %bundle.id, "Certificate bundle served");
    Ok(Json(bundle))
}

/// `POST /agent/{agent_id}/{signature}/heartbeat`
///
/// An agent that does not report its own address is recorded with the
/// address the request came from.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
    ClientIp(client): ClientIp,
    Json(mut body): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    if body.ip.as_deref().is_none_or(str::is_empty) {
        body.ip = Some(client.to_string());
    }
    state.registry.heartbeat(&agent, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /agent/{agent_id}/{signature}/status`
pub async fn report_status(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(agent): AuthenticatedAgent,
    Json(reports): Json<Vec<StatusReport>>,
) -> Result<Json<StatusAccepted>, ApiError> {
    let updated = state.sync.report_status(&agent, &reports).await?;
    Ok(Json(StatusAccepted { updated }))
}

/// Per-IP limit in front of the certificate download route
///
/// Runs before authentication so that rejected clients cost no store reads.
pub async fn limit_downloads(
    State(state): State<Arc<AppState>>,
    ClientIp(client): ClientIp,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.check(client) {
        warn!(ip = %client, "Certificate download rate limited");
        return ApiError(Error::rate_limited(client.to_string())).into_response();
    }
    next.run(request).await
}
