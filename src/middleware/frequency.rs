use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::session::backend::StateBackend;
use crate::session::context::epoch_millis;
use crate::session::state::{keys, FrequencyRecord};
use crate::upstream::{Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 86_400_000;
pub const WEEK_MS: i64 = 604_800_000;

/// Frequency-cap configuration. Absent limits are uncapped.
#[derive(Debug, Clone, Default)]
pub struct FrequencyCapConfig {
    /// Scope caps to one campaign; `None` caps the user across campaigns
    pub campaign_id: Option<String>,
    pub hourly_limit: Option<i64>,
    pub daily_limit: Option<i64>,
    pub weekly_limit: Option<i64>,
    /// Lifetime per-campaign cap (never window-reset)
    pub total_limit: Option<i64>,
}

/// Frequency-capping middleware.
///
/// Evaluates the configured caps against the `freq:{user}:{campaign?}`
/// record before delegating: an exceeded cap rejects with zero upstream
/// sends. A window counter whose `last_impression_ms` is at least one
/// window old counts as zero, and the reset is written on commit.
/// Successful requests commit via atomic backend increments. Backend
/// errors fail open: the request is served and the miss is logged.
pub struct FrequencyCapUpstream {
    inner: Arc<dyn Upstream>,
    backend: Arc<dyn StateBackend>,
    config: FrequencyCapConfig,
}

struct WindowCheck {
    name: &'static str,
    field: &'static str,
    window_ms: i64,
    count: i64,
    limit: Option<i64>,
}

impl FrequencyCapUpstream {
    pub fn new(
        inner: Arc<dyn Upstream>,
        backend: Arc<dyn StateBackend>,
        config: FrequencyCapConfig,
    ) -> Self {
        Self {
            inner,
            backend,
            config,
        }
    }

    fn windows(&self, record: &FrequencyRecord) -> [WindowCheck; 3] {
        [
            WindowCheck {
                name: "hourly",
                field: "hourly_count",
                window_ms: HOUR_MS,
                count: record.hourly_count,
                limit: self.config.hourly_limit,
            },
            WindowCheck {
                name: "daily",
                field: "daily_count",
                window_ms: DAY_MS,
                count: record.daily_count,
                limit: self.config.daily_limit,
            },
            WindowCheck {
                name: "weekly",
                field: "weekly_count",
                window_ms: WEEK_MS,
                count: record.weekly_count,
                limit: self.config.weekly_limit,
            },
        ]
    }

    /// Evaluate caps against the observed record, applying the window
    /// reset rule to each counter before comparison.
    fn evaluate(&self, record: &FrequencyRecord, now: i64) -> Result<()> {
        let elapsed = now - record.last_impression_ms;
        for check in self.windows(record) {
            let effective = if elapsed >= check.window_ms { 0 } else { check.count };
            if let Some(limit) = check.limit {
                if effective >= limit {
                    metrics::record_cap_rejection(check.name);
                    return Err(GatewayError::FrequencyCapExceeded {
                        which: check.name.to_string(),
                    });
                }
            }
        }
        if let Some(limit) = self.config.total_limit {
            if record.total_count >= limit {
                metrics::record_cap_rejection("total");
                return Err(GatewayError::FrequencyCapExceeded {
                    which: "total".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Commit an impression: window counters move by atomic increments
    /// (`1 - observed` when the window reset, `+1` otherwise), the
    /// timestamp by the delta from the observed value.
    async fn commit(&self, key: &str, record: &FrequencyRecord, now: i64) {
        let elapsed = now - record.last_impression_ms;
        for check in self.windows(record) {
            let delta = if elapsed >= check.window_ms {
                1 - check.count
            } else {
                1
            };
            if let Err(e) = self.backend.increment(key, check.field, delta).await {
                warn!(key, field = check.field, error = %e, "frequency commit failed");
            }
        }
        if let Err(e) = self.backend.increment(key, "total_count", 1).await {
            warn!(key, error = %e, "frequency commit failed");
        }
        let ts_delta = now - record.last_impression_ms;
        if let Err(e) = self
            .backend
            .increment(key, "last_impression_ms", ts_delta)
            .await
        {
            warn!(key, error = %e, "frequency timestamp commit failed");
        }
    }
}

#[async_trait]
impl Upstream for FrequencyCapUpstream {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn request(&self, req: UpstreamRequest) -> Result<Bytes> {
        let Some(user_id) = req.ctx.as_ref().and_then(|c| c.user_id.clone()) else {
            debug!(upstream = self.inner.key(), "no user identity, caps skipped");
            return self.inner.request(req).await;
        };

        let key = keys::frequency(&user_id, self.config.campaign_id.as_deref());
        let now = epoch_millis();

        let record = match self.backend.get(&key).await {
            Ok(value) => value
                .map(|v| FrequencyRecord::from_value(&v))
                .unwrap_or_default(),
            Err(e) => {
                // Fail open: an unavailable backend must not drop fill
                warn!(key, error = %e, "state backend unavailable, serving uncapped");
                return self.inner.request(req).await;
            }
        };

        self.evaluate(&record, now)?;
        let body = self.inner.request(req).await?;
        self.commit(&key, &record, now).await;
        Ok(body)
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
    use crate::session::backend::MemoryStateBackend;
    use crate::session::SessionContext;
    use crate::transport::MemoryTransport;
    use crate::upstream::TransportUpstream;
    use serde_json::Value;
    use std::time::Duration;

    fn capped(
        transport: &Arc<MemoryTransport>,
        backend: Arc<dyn StateBackend>,
        config: FrequencyCapConfig,
    ) -> FrequencyCapUpstream {
        let inner: Arc<dyn Upstream> = Arc::new(TransportUpstream::new(
            "primary",
            "mem://ads",
            transport.clone(),
        ));
        FrequencyCapUpstream::new(inner, backend, config)
    }

    fn user_request() -> UpstreamRequest {
        UpstreamRequest::new().context(SessionContext::new("s1", "r1").with_user("u1"))
    }

    #[tokio::test]
    async fn test_hourly_cap_rejects_fourth_request_with_zero_sends() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://ads", "ad");
        let backend = Arc::new(MemoryStateBackend::new());
        let upstream = capped(
            &transport,
            backend.clone(),
            FrequencyCapConfig {
                hourly_limit: Some(3),
                ..Default::default()
            },
        );

        for _ in 0..3 {
            upstream.request(user_request()).await.unwrap();
        }
        let err = upstream.request(user_request()).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::FrequencyCapExceeded {
                which: "hourly".to_string()
            }
        );
        // Exactly three sends: the rejected call contacted nothing
        assert_eq!(transport.send_count("mem://ads"), 3);

        let record = backend.get("freq:u1").await.unwrap().unwrap();
        assert_eq!(record["hourly_count"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_window_reset_allows_and_rewrites_counter() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://ads", "ad");
        let backend = Arc::new(MemoryStateBackend::new());

        // Five impressions, but the hour has elapsed
        let stale = FrequencyRecord {
            hourly_count: 5,
            daily_count: 5,
            weekly_count: 5,
            total_count: 5,
            last_impression_ms: epoch_millis() - 2 * HOUR_MS,
        };
        backend
            .set("freq:u1", serde_json::to_value(&stale).unwrap(), None)
            .await
            .unwrap();

        let upstream = capped(
            &transport,
            backend.clone(),
            FrequencyCapConfig {
                hourly_limit: Some(3),
                ..Default::default()
            },
        );
        upstream.request(user_request()).await.unwrap();

        let record = backend.get("freq:u1").await.unwrap().unwrap();
        // Hourly window reset to 1; daily/weekly windows had not elapsed
        assert_eq!(record["hourly_count"], serde_json::json!(1));
        assert_eq!(record["daily_count"], serde_json::json!(6));
        assert_eq!(record["total_count"], serde_json::json!(6));
    }

    #[tokio::test]
    async fn test_campaign_scoped_key() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://ads", "ad");
        let backend = Arc::new(MemoryStateBackend::new());
        let upstream = capped(
            &transport,
            backend.clone(),
            FrequencyCapConfig {
                campaign_id: Some("camp-1".into()),
                hourly_limit: Some(1),
                ..Default::default()
            },
        );

        upstream.request(user_request()).await.unwrap();
        assert!(backend.get("freq:u1:camp-1").await.unwrap().is_some());
        assert!(backend.get("freq:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_user_identity_skips_caps() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://ads", "ad");
        let backend = Arc::new(MemoryStateBackend::new());
        let upstream = capped(
            &transport,
            backend.clone(),
            FrequencyCapConfig {
                hourly_limit: Some(0),
                ..Default::default()
            },
        );

        // Zero-limit cap, but no user id: request is served
        upstream.request(UpstreamRequest::new()).await.unwrap();
        assert_eq!(transport.send_count("mem://ads"), 1);
    }

    struct FailingBackend;

    #[async_trait]
    impl StateBackend for FailingBackend {
        async fn get(&self, _key: &str) -> crate::error::Result<Option<Value>> {
            Err(GatewayError::StateBackendError("down".into()))
        }
        async fn set(
            &self,
            _key: &str,
            _value: Value,
            _ttl: Option<Duration>,
        ) -> crate::error::Result<()> {
            Err(GatewayError::StateBackendError("down".into()))
        }
        async fn increment(&self, _key: &str, _field: &str, _delta: i64) -> crate::error::Result<i64> {
            Err(GatewayError::StateBackendError("down".into()))
        }
        async fn delete(&self, _key: &str) -> crate::error::Result<()> {
            Err(GatewayError::StateBackendError("down".into()))
        }
        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_backend_failure_fails_open() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://ads", "ad");
        let upstream = capped(
            &transport,
            Arc::new(FailingBackend),
            FrequencyCapConfig {
                hourly_limit: Some(0),
                ..Default::default()
            },
        );

        // Backend is down: serve anyway
        let body = upstream.request(user_request()).await.unwrap();
        assert_eq!(&body[..], b"ad");
    }
}
