use crate::error::Result;
use crate::metrics;
use crate::upstream::{merge_params, ParamValue, Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Response cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Headers that participate in the cache key (lowercased)
    pub header_whitelist: BTreeSet<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            header_whitelist: BTreeSet::new(),
        }
    }
}

struct CachedResponse {
    body: Bytes,
    expires_at: Instant,
}

/// Caching middleware over raw upstream responses.
///
/// The key is a SHA-256 fingerprint of (effective endpoint, sorted
/// effective params, whitelisted headers, payload). Expired entries are
/// equivalent to absent and are evicted lazily. Envelopes flagged
/// `no_cache` bypass the cache entirely.
pub struct CacheUpstream {
    inner: Arc<dyn Upstream>,
    config: CacheConfig,
    entries: DashMap<String, CachedResponse>,
}

impl CacheUpstream {
    pub fn new(inner: Arc<dyn Upstream>, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries eagerly.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    fn fingerprint(&self, req: &UpstreamRequest) -> String {
        let endpoint = req.endpoint.as_deref().unwrap_or(self.inner.endpoint());

        let mut params = merge_params(&[], &req.params);
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        for (key, value) in &params {
            hasher.update(b"\x1f");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            match value {
                ParamValue::Single(v) => hasher.update(v.as_bytes()),
                ParamValue::Many(values) => {
                    for v in values {
                        hasher.update(v.as_bytes());
                        hasher.update(b",");
                    }
                }
            }
        }
        for header in &self.config.header_whitelist {
            if let Some(value) = req.headers.get(header) {
                hasher.update(b"\x1f");
                hasher.update(header.as_bytes());
                hasher.update(b":");
                hasher.update(value.as_bytes());
            }
        }
        if let Some(payload) = &req.payload {
            hasher.update(b"\x1f");
            hasher.update(payload);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl Upstream for CacheUpstream {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn request(&self, req: UpstreamRequest) -> Result<Bytes> {
        if req.no_cache {
            return self.inner.request(req).await;
        }

        let fingerprint = self.fingerprint(&req);
        if let Some(entry) = self.entries.get(&fingerprint) {
            if entry.expires_at > Instant::now() {
                metrics::record_cache_lookup("hit");
                debug!(upstream = self.inner.key(), "upstream cache hit");
                return Ok(entry.body.clone());
            }
            drop(entry);
            self.entries.remove(&fingerprint);
            metrics::record_cache_lookup("expired");
        } else {
            metrics::record_cache_lookup("miss");
        }

        let body = self.inner.request(req).await?;
        self.entries.insert(
            fingerprint,
            CachedResponse {
                body: body.clone(),
                expires_at: Instant::now() + self.config.ttl,
            },
        );
        Ok(body)
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
