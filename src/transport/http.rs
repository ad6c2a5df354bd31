use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::transport::{Transport, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str = concat!("adgate/", env!("CARGO_PKG_VERSION"));

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Follow redirects (ad servers routinely 302 to CDNs)
    pub follow_redirects: bool,
    /// Merged into requests that carry no `user-agent` metadata
    pub user_agent: String,
    /// Connect timeout, independent of per-request timeouts
    pub connect_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP/1.1+2 transport over a shared reqwest connection pool.
///
/// GET when the payload is empty, POST otherwise. 4xx/5xx surface as
/// `TransportProtocolError`; 5xx and network errors are retriable classes.
pub struct HttpTransport {
    client: Client,
    user_agent: String,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = Client::builder()
            .redirect(redirect)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::TransportUnreachable(e.to_string()))?;
        Ok(Self {
            client,
            user_agent: config.user_agent,
            closed: AtomicBool::new(false),
        })
    }

    /// Reuse an existing client (shared pools across transports).
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    fn map_error(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::TransportTimeout
        } else if err.is_connect() || err.is_request() {
            GatewayError::TransportUnreachable(err.to_string())
        } else {
            GatewayError::UpstreamError(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &str,
        payload: Option<Bytes>,
        metadata: &BTreeMap<String, String>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::TransportUnreachable(
                "transport closed".to_string(),
            ));
        }
        if endpoint.is_empty() {
            return Err(GatewayError::TransportUnreachable(
                "empty endpoint".to_string(),
            ));
        }

        let has_body = payload.as_ref().is_some_and(|p| !p.is_empty());
        let mut request = if has_body {
            self.client
                .post(endpoint)
                .body(payload.unwrap_or_default().to_vec())
        } else {
            self.client.get(endpoint)
        };

        for (name, value) in metadata {
            request = request.header(name.as_str(), value.as_str());
        }
        if !metadata.contains_key("user-agent") {
            request = request.header("user-agent", self.user_agent.as_str());
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        debug!(endpoint, has_body, "HTTP transport send");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Canceled),
            result = request.send() => result.map_err(Self::map_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            warn!(endpoint, status = status.as_u16(), "HTTP transport error status");
            metrics::record_transport_error("http", status.as_str());
            return Err(GatewayError::TransportProtocolError {
                status: status.as_u16(),
            });
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Canceled),
            result = response.bytes() => result.map_err(Self::map_error)?,
        };
        Ok(body)
    }

    async fn close(&self) {
        // Connection pool is dropped with the client; repeated calls are no-ops.
        self.closed.store(true, Ordering::Release);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}
