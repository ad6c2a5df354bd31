use crate::error::{GatewayError, Result};
use crate::upstream::{Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Configuration for retry behaviour on transient upstream failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first. `1` is identical to no-retry.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Multiplier applied per attempt: `delay = base_delay * factor^attempt`.
    pub factor: f64,
    /// Uniform jitter added on top of the nominal delay.
    pub jitter: Duration,
    /// Cap on any single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Compute the backoff delay for a zero-indexed attempt number.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let nominal = config.base_delay.as_millis() as f64 * config.factor.powi(attempt as i32);
    let capped = (nominal as u64).min(config.max_delay.as_millis() as u64);

    let jitter_range = config.jitter.as_millis() as u64;
    let jitter = if jitter_range > 0 {
        // Cheap pseudo-random: system-clock nanos mixed with attempt index.
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        nanos.wrapping_mul(attempt as u64 + 1) % (jitter_range + 1)
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}

/// Retry middleware: retries transient errors with exponential backoff.
///
/// Never extends the caller's deadline: the envelope timeout bounds all
/// attempts together, and backoff sleeps are abandoned when they would
/// cross it. Non-retriable errors and cancellation surface immediately.
pub struct RetryUpstream {
    inner: Arc<dyn Upstream>,
    config: RetryConfig,
}

impl RetryUpstream {
    pub fn new(inner: Arc<dyn Upstream>, config: RetryConfig) -> Self {
        let config = RetryConfig {
            max_attempts: config.max_attempts.max(1),
            ..config
        };
        Self { inner, config }
    }
}

#[async_trait]
impl Upstream for RetryUpstream {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn request(&self, req: UpstreamRequest) -> Result<Bytes> {
        let start = Instant::now();
        let overall = req.timeout;

        for attempt in 0..self.config.max_attempts {
            if req.cancel.is_cancelled() {
                return Err(GatewayError::Canceled);
            }
            let remaining = match overall {
                Some(limit) => {
                    let left = limit.saturating_sub(start.elapsed());
                    if left.is_zero() {
                        return Err(GatewayError::TransportTimeout);
                    }
                    Some(left)
                }
                None => None,
            };

            let mut attempt_req = req.clone();
            attempt_req.timeout = remaining;

            match self.inner.request(attempt_req).await {
                Ok(body) => {
                    if attempt > 0 {
                        debug!(
                            upstream = self.inner.key(),
                            attempt, "upstream request succeeded after retry"
                        );
                    }
                    return Ok(body);
                }
                Err(err) => {
                    let is_last = attempt + 1 >= self.config.max_attempts;
                    if !err.is_retriable() || is_last {
                        return Err(err);
                    }

                    let delay = compute_delay(&self.config, attempt);
                    if let Some(limit) = overall {
                        if start.elapsed() + delay >= limit {
                            return Err(err);
                        }
                    }
                    warn!(
                        upstream = self.inner.key(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable upstream error, backing off"
                    );
                    tokio::select! {
                        _ = req.cancel.cancelled() => return Err(GatewayError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        // max_attempts >= 1 guarantees the loop returned
        Err(GatewayError::UpstreamError("retry loop exhausted".into()))
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
