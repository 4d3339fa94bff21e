//! Agent side of the sync protocol

use async_trait::async_trait;
use certsync_core::agent::{AgentConfigResponse, CertBundle, HeartbeatRequest, StatusReport};
use certsync_core::{Error, Result};
use serde::de::DeserializeOwned;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use uuid::Uuid;

/// Default HTTP timeout for protocol requests
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the agent performs against the server
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Desired state of every bound certificate
    async fn config(&self) -> Result<AgentConfigResponse>;

    /// Certificate bytes
    async fn cert_bundle(&self, cert_id: &str) -> Result<CertBundle>;

    /// Per-certificate deployment outcomes
    async fn report_status(&self, reports: &[StatusReport]) -> Result<()>;

    /// Liveness ping
    async fn heartbeat(&self, heartbeat: &HeartbeatRequest) -> Result<()>;

    /// Address to report in heartbeats
    ///
    /// `None` leaves it to the server, which records the request's source
    /// address instead.
    async fn local_ip(&self) -> Option<String> {
        None
    }
}

/// [`ServerApi`] over HTTP
///
/// The identity lives in the base URL, so `Debug` never prints it.
pub struct HttpServerApi {
    client: reqwest::Client,
    server_url: String,
    base: String,
}

impl fmt::Debug for HttpServerApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServerApi")
            .field("base", &"<REDACTED>")
            .finish()
    }
}

impl HttpServerApi {
    /// Client for the agent `agent_id` signed with `signature` at `server_url`
    pub fn new(
        server_url: &str,
        agent_id: Uuid,
        signature: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let server_url = server_url.trim_end_matches('/');
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(Error::config(format!(
                "Server URL must start with http:// or https://, got '{}'",
                server_url
            )));
        }
        if signature.is_empty() {
            return Err(Error::config("Agent signature cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("certsync-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            server_url: server_url.to_string(),
            base: format!("{}/agent/{}/{}", server_url, agent_id, signature),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| Error::network(format!("GET {} failed: {}", path, e)))?;
        let response = check_status(response, path).await?;
        response
            .json()
            .await
            .map_err(|e| Error::network(format!("Invalid response to {}: {}", path, e)))
    }

    async fn post_json<B: serde::Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::network(format!("POST {} failed: {}", path, e)))?;
        check_status(response, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn config(&self) -> Result<AgentConfigResponse> {
        self.get_json("config").await
    }

    async fn cert_bundle(&self, cert_id: &str) -> Result<CertBundle> {
        self.get_json(&format!("cert/{}", cert_id)).await
    }

    async fn report_status(&self, reports: &[StatusReport]) -> Result<()> {
        self.post_json("status", reports).await
    }

    async fn heartbeat(&self, heartbeat: &HeartbeatRequest) -> Result<()> {
        self.post_json("heartbeat", heartbeat).await
    }

    async fn local_ip(&self) -> Option<String> {
        outbound_ip(&self.server_url).await.map(|ip| ip.to_string())
    }
}

/// Local address of the route towards `server_url`
///
/// Connecting a UDP socket only selects the route; nothing is sent.
async fn outbound_ip(server_url: &str) -> Option<IpAddr> {
    let url = reqwest::Url::parse(server_url).ok()?;
    let host = url.host_str()?.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_or_known_default()?;
    let target = tokio::net::lookup_host((host, port)).await.ok()?.next()?;

    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = tokio::net::UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

async fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    Err(match status.as_u16() {
        401 => Error::SignatureMismatch,
        404 => Error::not_found(path.to_string()),
        429 => Error::rate_limited(format!("Server throttled {}", path)),
        _ => Error::network(format!("{} returned {}", path, status)),
    })
}
