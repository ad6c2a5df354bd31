use crate::error::Result;
use crate::transport::Transport;
use crate::upstream::{merge_headers, merge_params, ParamValue, Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default parameters, headers and timeout applied to every request of a
/// [`TransportUpstream`]. Request values override key-by-key.
#[derive(Debug, Clone, Default)]
pub struct UpstreamDefaults {
    pub params: Vec<(String, ParamValue)>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Query keys whose values are appended verbatim, for values that
    /// arrive already percent-encoded and must not be double-encoded.
    pub raw_keys: BTreeSet<String>,
}

/// Base upstream: one transport `send` per `request`, no retries.
///
/// Builds the effective URL from the configured endpoint (or the
/// envelope's override), the merged parameter list, and percent-encoded
/// values (except `raw_keys`).
pub struct TransportUpstream {
    key: String,
    endpoint: String,
    transport: Arc<dyn Transport>,
    owns_transport: bool,
    defaults: UpstreamDefaults,
}

impl TransportUpstream {
    pub fn new(
        key: impl Into<String>,
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            key: key.into(),
            endpoint: endpoint.into(),
            transport,
            owns_transport: true,
            defaults: UpstreamDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: UpstreamDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Mark the transport as shared: `close` will not cascade to it.
    pub fn shared_transport(mut self) -> Self {
        self.owns_transport = false;
        self
    }

    fn build_url(&self, endpoint: &str, params: &[(String, ParamValue)]) -> String {
        if params.is_empty() {
            return endpoint.to_string();
        }
        let mut url = endpoint.to_string();
        let mut separator = if endpoint.contains('?') { '&' } else { '?' };
        for (key, value) in params {
            let raw = self.defaults.raw_keys.contains(key);
            match value {
                ParamValue::Single(v) => {
                    url.push(separator);
                    url.push_str(key);
                    url.push('=');
                    url.push_str(&encode_value(v, raw));
                    separator = '&';
                }
                ParamValue::Many(values) => {
                    for v in values {
                        url.push(separator);
                        url.push_str(key);
                        url.push('=');
                        url.push_str(&encode_value(v, raw));
                        separator = '&';
                    }
                }
            }
        }
        url
    }
}

/// Percent-encode a query value unless the caller opted the key out.
fn encode_value(value: &str, raw: bool) -> String {
    if raw {
        return value.to_string();
    }
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[async_trait]
impl Upstream for TransportUpstream {
    fn key(&self) -> &str {
        &self.key
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, req: UpstreamRequest) -> Result<Bytes> {
        let endpoint = req.endpoint.as_deref().unwrap_or(&self.endpoint);
        let params = merge_params(&self.defaults.params, &req.params);
        let headers = merge_headers(&self.defaults.headers, &req.headers);
        let timeout = req.timeout.or(self.defaults.timeout);
        let url = self.build_url(endpoint, &params);

        debug!(upstream = %self.key, url = %url, "dispatching upstream request");
        self.transport
            .send(&url, req.payload, &headers, timeout, &req.cancel)
            .await
    }

    async fn close(&self) {
        if self.owns_transport {
            self.transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn upstream_with(transport: Arc<MemoryTransport>) -> TransportUpstream {
        TransportUpstream::new("primary", "mem://vast", transport).with_defaults(UpstreamDefaults {
            params: vec![("w".to_string(), ParamValue::from("640"))],
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_one_send_per_request_with_merged_params() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://vast?w=640&h=720", "ok");

        let upstream = upstream_with(transport.clone());
        let body = upstream
            .request(UpstreamRequest::new().param("h", "720"))
            .await
            .unwrap();

        assert_eq!(&body[..], b"ok");
        assert_eq!(transport.send_count("mem://vast?w=640&h=720"), 1);
        assert_eq!(transport.total_sends(), 1);
    }

    #[tokio::test]
    async fn test_request_param_overrides_default() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://vast?w=1280", "wide");

        let upstream = upstream_with(transport);
        let body = upstream
            .request(UpstreamRequest::new().param("w", "1280"))
            .await
            .unwrap();
        assert_eq!(&body[..], b"wide");
    }

    #[tokio::test]
    async fn test_endpoint_override() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://other?w=640", "other");

        let upstream = upstream_with(transport);
        let body = upstream
            .request(UpstreamRequest::new().endpoint("mem://other"))
            .await
            .unwrap();
        assert_eq!(&body[..], b"other");
    }

    #[test]
    fn test_query_value_encoding() {
        let transport: Arc<dyn crate::transport::Transport> = Arc::new(MemoryTransport::new());
        let upstream = TransportUpstream::new("k", "http://ads.test/vast", transport);

        let url = upstream.build_url(
            "http://ads.test/vast",
            &[("q".to_string(), ParamValue::from("a b&c"))],
        );
        assert_eq!(url, "http://ads.test/vast?q=a%20b%26c");
    }

    #[test]
    fn test_raw_key_skips_encoding() {
        let transport: Arc<dyn crate::transport::Transport> = Arc::new(MemoryTransport::new());
        let mut raw_keys = BTreeSet::new();
        raw_keys.insert("u".to_string());
        let upstream = TransportUpstream::new("k", "http://ads.test/vast", transport)
            .with_defaults(UpstreamDefaults {
                raw_keys,
                ..Default::default()
            });

        let url = upstream.build_url(
            "http://ads.test/vast",
            &[("u".to_string(), ParamValue::from("already%20encoded"))],
        );
        assert_eq!(url, "http://ads.test/vast?u=already%20encoded");
    }

    #[test]
    fn test_existing_query_string_extended() {
        let transport: Arc<dyn crate::transport::Transport> = Arc::new(MemoryTransport::new());
        let upstream = TransportUpstream::new("k", "http://ads.test/vast?src=1", transport);
        let url = upstream.build_url(
            "http://ads.test/vast?src=1",
            &[("cb".to_string(), ParamValue::from("9"))],
        );
        assert_eq!(url, "http://ads.test/vast?src=1&cb=9");
    }

    #[tokio::test]
    async fn test_repeated_keys_for_many_values() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://vast?mime=video%2Fmp4&mime=video%2Fwebm", "ok");

        let upstream = TransportUpstream::new("k", "mem://vast", transport);
        let body = upstream
            .request(UpstreamRequest::new().param(
                "mime",
                vec!["video/mp4".to_string(), "video/webm".to_string()],
            ))
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_health_check_on_healthy_fixture() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://vast", "pong");
        let upstream = TransportUpstream::new("k", "mem://vast", transport);
        assert!(upstream.health_check().await);
    }

    #[tokio::test]
    async fn test_health_check_on_unreachable() {
        let transport = Arc::new(MemoryTransport::new());
        let upstream = TransportUpstream::new("k", "mem://void", transport);
        assert!(!upstream.health_check().await);
    }
}
