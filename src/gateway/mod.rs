pub mod handler;

pub use handler::{AdHandler, OpenRtbHandler, VastHandler};

use crate::error::GatewayError;
use crate::metrics;
use crate::session::backend::StateBackend;
use crate::session::state::keys;
use crate::session::SessionContext;
use crate::types::{AdRequest, AdResponse};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Protocol inference priority when the request does not name one.
const PROTOCOL_PRIORITY: &[&str] = &["vast", "openrtb", "daast"];

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl: Duration::from_secs(60),
        }
    }
}

struct CachedResponse {
    response: AdResponse,
    expires_at: Instant,
}

/// Orchestrator: routes generic ad requests to protocol handlers and
/// applies a fingerprinted response cache.
pub struct Gateway {
    handlers: DashMap<String, Arc<dyn AdHandler>>,
    cache: DashMap<String, CachedResponse>,
    config: GatewayConfig,
    state: Option<Arc<dyn StateBackend>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            handlers: DashMap::new(),
            cache: DashMap::new(),
            config,
            state: None,
        }
    }

    /// Attach a state backend for per-session counters
    /// (`session:{session_id}` records).
    pub fn with_state_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.state = Some(backend);
        self
    }

    /// Best-effort session bookkeeping; backend trouble never blocks serving.
    async fn touch_session(&self, session_id: &str, field: &str) {
        if let Some(backend) = &self.state {
            let key = keys::session(session_id);
            if let Err(e) = backend.increment(&key, field, 1).await {
                debug!(key, field, error = %e, "session counter update failed");
            }
        }
    }

    /// Register a protocol handler under its name.
    ///
    /// # Panics
    /// Registering two handlers under the same name is a programmer error.
    pub fn register_handler(&self, handler: Arc<dyn AdHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            panic!("handler {name:?} already registered");
        }
        info!(handler = name, "registered protocol handler");
    }

    /// Serve one ad request. Failures never raise: they map to an
    /// `AdResponse` with `success=false` and a taxonomy `error_code`.
    pub async fn serve(&self, request: AdRequest) -> AdResponse {
        if request.request_id.is_empty() && request.placement_id.is_none() {
            let err = GatewayError::InvalidAdRequest(
                "request_id or placement_id required".to_string(),
            );
            metrics::record_gateway_request("unknown", err.code());
            return AdResponse::failure(&request.request_id, &err);
        }

        let Some(protocol) = self.dispatch_key(&request) else {
            let err =
                GatewayError::InvalidAdRequest("cannot determine protocol".to_string());
            metrics::record_gateway_request("unknown", err.code());
            return AdResponse::failure(&request.request_id, &err);
        };

        let Some(handler) = self.handlers.get(&protocol).map(|h| h.value().clone()) else {
            let err = GatewayError::NoHandler(protocol.clone());
            metrics::record_gateway_request(&protocol, err.code());
            warn!(protocol, "no handler registered");
            return AdResponse::failure(&request.request_id, &err);
        };

        if !handler.validate_request(&request) {
            let err = GatewayError::InvalidAdRequest(format!(
                "request rejected by {protocol} handler"
            ));
            metrics::record_gateway_request(&protocol, err.code());
            return AdResponse::failure(&request.request_id, &err);
        }

        let fingerprint = self.fingerprint(&request, &protocol);
        if self.config.cache_enabled {
            if let Some(entry) = self.cache.get(&fingerprint) {
                if entry.expires_at > Instant::now() {
                    debug!(protocol, "gateway cache hit");
                    metrics::record_gateway_request(&protocol, "cache_hit");
                    let mut response = entry.response.clone();
                    response.cached = true;
                    response.request_id = request.request_id.clone();
                    return response;
                }
                drop(entry);
                self.cache.remove(&fingerprint);
            }
        }

        let ctx = SessionContext::from_ad_request(&request);
        self.touch_session(&ctx.session_id, "request_count").await;
        match handler.fetch(&request, &ctx).await {
            Ok(mut response) => {
                response.protocol.get_or_insert_with(|| protocol.clone());
                metrics::record_gateway_request(&protocol, "success");
                self.touch_session(&ctx.session_id, "impression_count").await;
                if self.config.cache_enabled {
                    self.cache.insert(
                        fingerprint,
                        CachedResponse {
                            response: response.clone(),
                            expires_at: Instant::now() + self.config.cache_ttl,
                        },
                    );
                }
                response
            }
            Err(err) => {
                warn!(protocol, error = %err, "handler fetch failed");
                metrics::record_gateway_request(&protocol, err.code());
                let mut response = AdResponse::failure(&request.request_id, &err);
                response.protocol = Some(protocol);
                response
            }
        }
    }

    /// Forward an application playback/interaction signal to the handler
    /// that produced the response.
    pub async fn track(&self, event: &str, response: &AdResponse, ctx: &SessionContext) {
        let Some(protocol) = response.protocol.as_deref() else {
            debug!(event, "response without protocol tag, track dropped");
            return;
        };
        if let Some(handler) = self.handlers.get(protocol).map(|h| h.value().clone()) {
            handler.track(event, response, ctx).await;
        }
    }

    /// Drop expired cache entries eagerly.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.cache.retain(|_, entry| entry.expires_at > now);
    }

    fn dispatch_key(&self, request: &AdRequest) -> Option<String> {
        if let Some(protocol) = &request.protocol {
            return Some(protocol.clone());
        }
        for candidate in PROTOCOL_PRIORITY {
            if request.extensions.contains_key(*candidate) {
                return Some((*candidate).to_string());
            }
        }
        // Custom protocols: first extension key with a registered handler
        request
            .extensions
            .keys()
            .find(|key| self.handlers.contains_key(*key))
            .cloned()
    }

    /// Request fingerprint over a whitelist of routing-relevant fields.
    fn fingerprint(&self, request: &AdRequest, protocol: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(protocol.as_bytes());
        for field in [
            request.placement_id.as_deref(),
            request.user_id.as_deref(),
            request.content_id.as_deref(),
            request.country.as_deref(),
        ] {
            hasher.update(b"\x1f");
            hasher.update(field.unwrap_or_default().as_bytes());
        }
        hasher.update(b"\x1f");
        hasher.update(request.width.unwrap_or(0).to_le_bytes());
        hasher.update(request.height.unwrap_or(0).to_le_bytes());
        if let Some(ext) = request.extensions.get(protocol) {
            hasher.update(b"\x1f");
            hasher.update(ext.to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}
