//! Request extractors: the signed agent identity and the client IP

use axum::extract::{ConnectInfo, FromRequestParts, Path};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use certsync_core::Error;
use certsync_core::model::Agent;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::AppState;
use crate::error::ApiError;

/// The agent named by `{agent_id}/{signature}` in the path
///
/// Runs before any body extractor, so a request with a bad signature is
/// rejected before its body is even parsed.
#[derive(Debug, Clone)]
pub struct AuthenticatedAgent(pub Agent);

impl FromRequestParts<Arc<AppState>> for AuthenticatedAgent {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Path(params) = Path::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError(Error::SignatureMismatch))?;

        let (Some(agent_id), Some(signature)) = (params.get("agent_id"), params.get("signature"))
        else {
            return Err(ApiError(Error::SignatureMismatch));
        };

        let agent = state.registry.authenticate(agent_id, signature).await?;
        Ok(Self(agent))
    }
}

/// Best-effort client address used as the rate limiter key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(Self(client_ip(
            &parts.headers,
            peer,
            state.trust_forwarded_for,
        )))
    }
}

/// Leftmost `X-Forwarded-For` entry when trusted, else the socket peer
///
/// Requests with neither share the unspecified address.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}
