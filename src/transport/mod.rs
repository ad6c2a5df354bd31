pub mod file;
pub mod http;
pub mod memory;

pub use file::FileTransport;
pub use http::{HttpTransport, HttpTransportConfig};
pub use memory::MemoryTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tag identifying a transport implementation, used for routing and
/// diagnostics. gRPC and WebSocket variants are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    File,
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::File => write!(f, "file"),
            TransportKind::Memory => write!(f, "memory"),
        }
    }
}

/// Byte-level endpoint client.
///
/// A transport exchanges opaque bytes with an endpoint whose meaning is
/// transport-specific (URL, file path, in-memory key). Implementations
/// must be safe for concurrent `send` calls on a single instance.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Exchange bytes with `endpoint`.
    ///
    /// Returns the complete response payload, never a partial body.
    /// `metadata` maps to protocol-appropriate headers. `timeout` bounds
    /// total wall-clock duration; cancellation is honored at the next
    /// suspension point.
    async fn send(
        &self,
        endpoint: &str,
        payload: Option<Bytes>,
        metadata: &BTreeMap<String, String>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;

    /// Release pools and handles. Idempotent after the first call.
    async fn close(&self);

    fn kind(&self) -> TransportKind;
}
