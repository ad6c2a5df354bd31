use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::upstream::{Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe
    pub recovery_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_interval: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Too many failures, requests rejected immediately
    Open,
    /// Testing recovery, a single probe allowed
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit-breaking middleware.
///
/// Counts consecutive upstream-health failures in Closed state; at the
/// threshold the circuit opens and requests fail fast with `CircuitOpen`
/// until `recovery_interval` elapses. HalfOpen admits exactly one probe:
/// success closes the circuit and resets counters, failure re-opens it
/// and restarts the interval. Policy rejections (caps, budgets) pass
/// through without counting; they say nothing about upstream health.
pub struct CircuitBreakerUpstream {
    inner: Arc<dyn Upstream>,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreakerUpstream {
    pub fn new(inner: Arc<dyn Upstream>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current circuit state (transitions Open → HalfOpen lazily on access).
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Admission check; returns `Err(CircuitOpen)` when rejected. When the
    /// call is admitted as a probe the flag is set under the same lock.
    async fn admit(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_interval {
                    debug!(
                        upstream = self.inner.key(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "circuit half-open, admitting probe"
                    );
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    metrics::record_circuit_transition(self.inner.key(), CircuitState::HalfOpen.as_str());
                    Ok(true)
                } else {
                    Err(GatewayError::CircuitOpen(self.inner.key().to_string()))
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(GatewayError::CircuitOpen(self.inner.key().to_string()))
                } else {
                    state.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Closed {
            debug!(upstream = self.inner.key(), "circuit closed after probe success");
            metrics::record_circuit_transition(self.inner.key(), CircuitState::Closed.as_str());
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    async fn on_failure(&self) {
        let mut state = self.state.lock().await;
        state.probe_in_flight = false;
        match state.state {
            CircuitState::HalfOpen => {
                warn!(upstream = self.inner.key(), "probe failed, circuit re-opened");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                metrics::record_circuit_transition(self.inner.key(), CircuitState::Open.as_str());
            }
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        upstream = self.inner.key(),
                        failures = state.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    metrics::record_circuit_transition(self.inner.key(), CircuitState::Open.as_str());
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[async_trait]
impl Upstream for CircuitBreakerUpstream {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn request(&self, req: UpstreamRequest) -> Result<Bytes> {
        self.admit().await?;
        match self.inner.request(req).await {
            Ok(body) => {
                self.on_success().await;
                Ok(body)
            }
            Err(err) => {
                if err.is_upstream_failure() {
                    self.on_failure().await;
                } else {
                    // Policy outcome; release a probe slot if we held one.
                    let mut state = self.state.lock().await;
                    state.probe_in_flight = false;
                }
                Err(err)
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::upstream::TransportUpstream;

    fn breaker(
        transport: &Arc<MemoryTransport>,
        config: CircuitBreakerConfig,
    ) -> CircuitBreakerUpstream {
        let inner: Arc<dyn Upstream> = Arc::new(TransportUpstream::new(
            "primary",
            "mem://ads",
            transport.clone(),
        ));
        CircuitBreakerUpstream::new(inner, config)
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let transport = Arc::new(MemoryTransport::new());
        for _ in 0..3 {
            transport.push_script("mem://ads", Err(GatewayError::TransportTimeout));
        }
        let cb = breaker(
            &transport,
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_interval: Duration::from_secs(60),
            },
        );

        for i in 0..3 {
            assert!(cb.request(UpstreamRequest::new()).await.is_err());
            let expected = if i < 2 {
                CircuitState::Closed
            } else {
                CircuitState::Open
            };
            assert_eq!(cb.state().await, expected);
        }
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script("mem://ads", Err(GatewayError::TransportTimeout));
        transport.insert("mem://ads", "ok");
        let cb = breaker(
            &transport,
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_interval: Duration::from_secs(60),
            },
        );

        assert!(cb.request(UpstreamRequest::new()).await.is_err());
        assert_eq!(cb.state().await, CircuitState::Open);

        let err = cb.request(UpstreamRequest::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(_)));
        // Fail-fast: the upstream saw only the first send
        assert_eq!(transport.send_count("mem://ads"), 1);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script("mem://ads", Err(GatewayError::TransportTimeout));
        transport.insert("mem://ads", "ok");
        let cb = breaker(
            &transport,
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_interval: Duration::from_millis(10),
            },
        );

        assert!(cb.request(UpstreamRequest::new()).await.is_err());
        tokio::time::sleep(Duration::from_millis(15)).await;

        let body = cb.request(UpstreamRequest::new()).await.unwrap();
        assert_eq!(&body[..], b"ok");
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_circuit() {
        let transport = Arc::new(MemoryTransport::new());
        transport.push_script("mem://ads", Err(GatewayError::TransportTimeout));
        transport.push_script("mem://ads", Err(GatewayError::TransportTimeout));
        let cb = breaker(
            &transport,
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_interval: Duration::from_millis(10),
            },
        );

        assert!(cb.request(UpstreamRequest::new()).await.is_err());
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert!(cb.request(UpstreamRequest::new()).await.is_err());
        assert_eq!(cb.state().await, CircuitState::Open);

        // Interval restarted: still rejecting before it elapses again
        let err = cb.request(UpstreamRequest::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(_)));
    }
}
