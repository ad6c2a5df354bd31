pub mod client;
pub mod codec;

pub use client::{TransportUpstream, UpstreamDefaults};

use crate::error::Result;
use crate::session::SessionContext;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A parameter value: a scalar or a list of scalars (repeated query key).
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Single(String),
    Many(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Single(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Single(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Single(v.to_string())
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::Many(v)
    }
}

/// Request envelope handed to an [`Upstream`].
///
/// Parameters keep insertion order; header keys are case-insensitive and
/// stored lowercased. The cancellation token is honored at every
/// suspension point below this layer.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    /// Overrides the upstream's configured endpoint when set
    pub endpoint: Option<String>,
    pub params: Vec<(String, ParamValue)>,
    pub headers: BTreeMap<String, String>,
    pub payload: Option<Bytes>,
    pub timeout: Option<Duration>,
    /// Opt-out flag for response caching (non-idempotent semantics)
    pub no_cache: bool,
    /// Per-request session context; middleware reads identity from here
    pub ctx: Option<SessionContext>,
    pub cancel: CancellationToken,
}

impl UpstreamRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn context(mut self, ctx: SessionContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Merge request parameters over defaults: request values override
/// defaults key-by-key in place, new request keys append in their order.
pub fn merge_params(
    defaults: &[(String, ParamValue)],
    request: &[(String, ParamValue)],
) -> Vec<(String, ParamValue)> {
    let mut merged: Vec<(String, ParamValue)> = defaults.to_vec();
    for (key, value) in request {
        match merged.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }
    merged
}

/// Merge request headers over defaults, case-insensitively.
pub fn merge_headers(
    defaults: &BTreeMap<String, String>,
    request: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = defaults
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();
    for (key, value) in request {
        merged.insert(key.to_ascii_lowercase(), value.clone());
    }
    merged
}

/// Typed request/response component over a transport.
///
/// Middleware composes on this trait: each layer wraps another `Upstream`
/// and satisfies the same contract. Exactly one name exists for the
/// operation: `request`.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Stable key identifying this upstream in chain hop records.
    fn key(&self) -> &str;

    /// Configured endpoint; the resolver seeds its first hop from here.
    fn endpoint(&self) -> &str;

    /// Dispatch one request. Base implementations perform exactly one
    /// transport `send`; retries belong to middleware.
    async fn request(&self, req: UpstreamRequest) -> Result<Bytes>;

    /// Lightweight probe: one empty-payload send with a short timeout.
    /// Reachable-but-unhappy upstreams (4xx/5xx) still count as healthy.
    async fn health_check(&self) -> bool {
        let probe = UpstreamRequest::new()
            .timeout(Duration::from_secs(2))
            .no_cache();
        match self.request(probe).await {
            Ok(_) => true,
            Err(err) => !err.is_retriable() && err != crate::error::GatewayError::Canceled,
        }
    }

    /// Release the underlying transport if exclusively owned.
    async fn close(&self);
}
