use crate::error::{GatewayError, Result};
use crate::transport::{Transport, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Filesystem transport: the endpoint is a path, the response is the file
/// contents. Used for canned VAST fixtures and local ad configs.
#[derive(Debug, Default)]
pub struct FileTransport;

impl FileTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(
        &self,
        endpoint: &str,
        _payload: Option<Bytes>,
        _metadata: &BTreeMap<String, String>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if endpoint.is_empty() {
            return Err(GatewayError::TransportUnreachable(
                "empty endpoint".to_string(),
            ));
        }
        debug!(path = endpoint, "file transport read");

        let read = async {
            tokio::fs::read(endpoint).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GatewayError::TransportUnreachable(format!("{endpoint}: not found"))
                } else {
                    GatewayError::TransportUnreachable(format!("{endpoint}: {e}"))
                }
            })
        };

        let bytes = match timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Canceled),
                result = tokio::time::timeout(limit, read) => {
                    result.map_err(|_| GatewayError::TransportTimeout)??
                }
            },
            None => tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Canceled),
                result = read => result?,
            },
        };
        Ok(Bytes::from(bytes))
    }

    async fn close(&self) {}

    fn kind(&self) -> TransportKind {
        TransportKind::File
    }
}
