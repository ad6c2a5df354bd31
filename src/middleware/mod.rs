pub mod budget;
pub mod cache;
pub mod circuit;
pub mod frequency;
pub mod retry;

pub use budget::{BudgetConfig, BudgetUpstream};
pub use cache::{CacheConfig, CacheUpstream};
pub use circuit::{CircuitBreakerConfig, CircuitBreakerUpstream, CircuitState};
pub use frequency::{FrequencyCapConfig, FrequencyCapUpstream};
pub use retry::{RetryConfig, RetryUpstream};

use crate::error::Result;
use crate::metrics;
use crate::session::backend::StateBackend;
use crate::upstream::{Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

/// Metrics middleware: records request counts and durations per upstream.
pub struct MetricsUpstream {
    inner: Arc<dyn Upstream>,
}

impl MetricsUpstream {
    pub fn new(inner: Arc<dyn Upstream>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Upstream for MetricsUpstream {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn request(&self, req: UpstreamRequest) -> Result<Bytes> {
        let start = Instant::now();
        let result = self.inner.request(req).await;
        match &result {
            Ok(_) => metrics::record_upstream_request(self.inner.key(), "success"),
            Err(err) => metrics::record_upstream_request(self.inner.key(), err.code()),
        }
        metrics::record_upstream_duration(self.inner.key(), start);
        result
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

/// Configuration for a full middleware stack. `None` layers are skipped.
#[derive(Default, Clone)]
pub struct MiddlewareStackConfig {
    pub retry: Option<RetryConfig>,
    pub circuit: Option<CircuitBreakerConfig>,
    pub cache: Option<CacheConfig>,
    pub frequency: Option<FrequencyCapConfig>,
    pub budget: Option<BudgetConfig>,
    pub record_metrics: bool,
}

/// Compose the canonical stack around a base upstream, outermost-first:
/// Retry ∘ CircuitBreaker ∘ Cache ∘ FrequencyCap ∘ Budget ∘ Metrics ∘ Base.
///
/// Layers needing state (frequency, budget) require `backend`; configuring
/// them without one is a programmer error.
pub fn compose(
    base: Arc<dyn Upstream>,
    backend: Option<Arc<dyn StateBackend>>,
    config: MiddlewareStackConfig,
) -> Arc<dyn Upstream> {
    let mut upstream = base;
    if config.record_metrics {
        upstream = Arc::new(MetricsUpstream::new(upstream));
    }
    if let Some(budget) = config.budget {
        let backend = backend
            .clone()
            .expect("budget middleware requires a state backend");
        upstream = Arc::new(BudgetUpstream::new(upstream, backend, budget));
    }
    if let Some(frequency) = config.frequency {
        let backend = backend
            .clone()
            .expect("frequency-cap middleware requires a state backend");
        upstream = Arc::new(FrequencyCapUpstream::new(upstream, backend, frequency));
    }
    if let Some(cache) = config.cache {
        upstream = Arc::new(CacheUpstream::new(upstream, cache));
    }
    if let Some(circuit) = config.circuit {
        upstream = Arc::new(CircuitBreakerUpstream::new(upstream, circuit));
    }
    if let Some(retry) = config.retry {
        upstream = Arc::new(RetryUpstream::new(upstream, retry));
    }
    upstream
}
