use crate::error::{GatewayError, Result};
use crate::transport::{Transport, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// In-process transport for tests and deterministic fixtures.
///
/// Endpoints map to either a static response or a scripted FIFO of
/// results. Scripted entries are consumed first; once drained, the static
/// response (if any) answers all further sends. Every send is counted
/// per endpoint so tests can assert exact send counts.
#[derive(Default)]
pub struct MemoryTransport {
    responses: DashMap<String, Bytes>,
    scripts: DashMap<String, VecDeque<Result<Bytes>>>,
    send_counts: DashMap<String, u64>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a static response for an endpoint.
    pub fn insert(&self, endpoint: impl Into<String>, body: impl Into<Bytes>) {
        self.responses.insert(endpoint.into(), body.into());
    }

    /// Queue a one-shot scripted result for an endpoint (FIFO order).
    pub fn push_script(&self, endpoint: impl Into<String>, result: Result<Bytes>) {
        self.scripts
            .entry(endpoint.into())
            .or_default()
            .push_back(result);
    }

    /// Number of sends observed for an endpoint.
    pub fn send_count(&self, endpoint: &str) -> u64 {
        self.send_counts.get(endpoint).map(|c| *c).unwrap_or(0)
    }

    /// Total sends across all endpoints.
    pub fn total_sends(&self) -> u64 {
        self.send_counts.iter().map(|e| *e.value()).sum()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        endpoint: &str,
        _payload: Option<Bytes>,
        _metadata: &BTreeMap<String, String>,
        _timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Canceled);
        }
        if endpoint.is_empty() {
            return Err(GatewayError::TransportUnreachable(
                "empty endpoint".to_string(),
            ));
        }
        *self.send_counts.entry(endpoint.to_string()).or_insert(0) += 1;

        if let Some(mut script) = self.scripts.get_mut(endpoint) {
            if let Some(result) = script.pop_front() {
                return result;
            }
        }
        match self.responses.get(endpoint) {
            Some(body) => Ok(body.clone()),
            None => Err(GatewayError::TransportUnreachable(format!(
                "no fixture for {endpoint}"
            ))),
        }
    }

    async fn close(&self) {}

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }
}
