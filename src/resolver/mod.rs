pub mod selection;
pub mod tracking;

pub use selection::{select_media, CustomSelector, SelectionStrategy};

use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::session::SessionContext;
use crate::types::MediaFile;
use crate::upstream::codec;
use crate::upstream::{merge_params, ParamValue, Upstream, UpstreamRequest};
use crate::vast::macros::{MacroContext, MacroRegistry};
use crate::vast::parser::{self, VastDocument, VastKind};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the resolver walks a wrapper chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionStrategy {
    /// Follow wrappers recursively until an Inline document (canonical)
    #[default]
    Recursive,
    /// Stop at the first Inline encountered, whichever upstream produced it
    FirstInline,
    /// Like Recursive, but exhausting the depth is not a failure: partial
    /// data is returned with no error
    MaxDepth,
    /// Reserved for ad pods; single chains resolve recursively.
    /// See [`ChainResolver::resolve_pod`].
    Parallel,
}

/// One traversed hop of a wrapper chain.
#[derive(Debug, Clone)]
pub struct ChainHop {
    pub url: String,
    pub used_upstream_key: String,
    pub depth: u32,
    pub duration_ms: u64,
    pub ok: bool,
    pub error: Option<String>,
}

/// Outcome of one chain resolution. Terminal errors are embedded here
/// rather than raised, so callers can observe partial data.
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    pub success: bool,
    pub chain: Vec<ChainHop>,
    pub final_document: Option<VastDocument>,
    pub selected_media: Option<MediaFile>,
    pub used_fallback: bool,
    pub accumulated_impressions: Vec<String>,
    pub accumulated_errors: Vec<String>,
    pub accumulated_tracking_events: BTreeMap<String, Vec<String>>,
    pub total_duration_ms: u64,
    pub error: Option<GatewayError>,
}

/// Chain resolver configuration
#[derive(Clone)]
pub struct ResolverConfig {
    /// Maximum wrapper redirects (VAST 4.2 §2.4.1.2 recommends 5)
    pub max_depth: u32,
    /// Wall-clock bound on the whole resolution
    pub total_timeout: Duration,
    /// Bound on each hop; the tighter of this and the remaining total wins
    pub per_request_timeout: Duration,
    pub enable_fallbacks: bool,
    pub resolution_strategy: ResolutionStrategy,
    pub selection_strategy: SelectionStrategy,
    /// Required iff `selection_strategy == Custom`
    pub custom_selector: Option<CustomSelector>,
    pub collect_tracking_urls: bool,
    pub collect_error_urls: bool,
    /// Preserve duplicate impression URLs across the chain (the default)
    pub dedup_impressions: bool,
    /// Fire accumulated impression beacons after a successful resolve
    pub fire_impressions: bool,
    /// Extra well-formedness sweep over each response before parsing
    pub validate_each_response: bool,
    /// Merged into every hop's request parameters
    pub additional_params: Vec<(String, ParamValue)>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            total_timeout: Duration::from_secs(8),
            per_request_timeout: Duration::from_secs(2),
            enable_fallbacks: true,
            resolution_strategy: ResolutionStrategy::Recursive,
            selection_strategy: SelectionStrategy::HighestBitrate,
            custom_selector: None,
            collect_tracking_urls: true,
            collect_error_urls: true,
            dedup_impressions: false,
            fire_impressions: false,
            validate_each_response: false,
            additional_params: Vec::new(),
        }
    }
}

/// Recursive VAST wrapper-chain resolver.
///
/// Walks the chain from a primary upstream with ordered fallbacks,
/// accumulating impressions, error URLs and tracking events along every
/// traversed document, enforcing both per-hop and total deadlines,
/// detecting cycles through a visited set, and finally selecting a
/// creative from the terminal Inline document.
pub struct ChainResolver {
    upstreams: Vec<Arc<dyn Upstream>>,
    config: ResolverConfig,
    registry: MacroRegistry,
    beacon_client: reqwest::Client,
}

impl ChainResolver {
    pub fn new(primary: Arc<dyn Upstream>, config: ResolverConfig) -> Self {
        Self {
            upstreams: vec![primary],
            config,
            registry: MacroRegistry::new(),
            beacon_client: reqwest::Client::new(),
        }
    }

    /// Ordered fallbacks, tried when the current upstream fails a hop.
    pub fn with_fallbacks(mut self, fallbacks: Vec<Arc<dyn Upstream>>) -> Self {
        self.upstreams.extend(fallbacks);
        self
    }

    pub fn with_registry(mut self, registry: MacroRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_beacon_client(mut self, client: reqwest::Client) -> Self {
        self.beacon_client = client;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve the chain for one request context.
    pub async fn resolve(
        &self,
        session: &SessionContext,
        cancel: &CancellationToken,
    ) -> ResolutionResult {
        self.resolve_with_params(session, &[], cancel).await
    }

    /// Resolve with additional per-request parameters merged after the
    /// configured `additional_params`.
    pub async fn resolve_with_params(
        &self,
        session: &SessionContext,
        extra_params: &[(String, ParamValue)],
        cancel: &CancellationToken,
    ) -> ResolutionResult {
        let start = Instant::now();
        let params = merge_params(&self.config.additional_params, extra_params);

        let mut result = ResolutionResult::default();
        let mut seen_impressions: HashSet<String> = HashSet::new();
        let mut upstream_idx = 0usize;
        let mut wrapped = false;
        let mut current_url = self.upstreams[0].endpoint().to_string();
        let mut visited: HashSet<String> = HashSet::from([current_url.clone()]);
        let mut error_code: Option<u32> = None;

        'chain: for depth in 0..self.config.max_depth {
            // Fetch the current URL, falling back across upstreams without
            // advancing depth.
            let (xml, hop_start) = loop {
                let remaining = self.config.total_timeout.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    result.error = Some(GatewayError::ChainTimeout);
                    error_code = Some(900);
                    break 'chain;
                }
                let hop_timeout = self.config.per_request_timeout.min(remaining);
                let upstream = &self.upstreams[upstream_idx];
                let hop_start = Instant::now();

                let mut req = UpstreamRequest::new()
                    .endpoint(current_url.clone())
                    .context(session.clone())
                    .cancellation(cancel.clone())
                    .timeout(hop_timeout);
                req.params = params.clone();

                let fetched = match upstream.request(req).await {
                    Ok(bytes) => codec::decode_text(&bytes, None),
                    Err(err) => Err(err),
                };
                match fetched {
                    Ok(xml) => break (xml, hop_start),
                    Err(err) => {
                        // Only upstream-health failures are recovered via
                        // fallback; policy rejections (caps, budgets) and
                        // cancellation propagate unchanged.
                        let recoverable = err.is_upstream_failure()
                            || matches!(err, GatewayError::CircuitOpen(_));
                        if !recoverable {
                            result.error = Some(err);
                            break 'chain;
                        }
                        warn!(
                            upstream = upstream.key(),
                            url = %current_url,
                            depth,
                            error = %err,
                            "hop failed"
                        );
                        if self.config.enable_fallbacks && upstream_idx + 1 < self.upstreams.len()
                        {
                            upstream_idx += 1;
                            result.used_fallback = true;
                            let next = &self.upstreams[upstream_idx];
                            metrics::record_fallback(next.key());
                            info!(fallback = next.key(), "advancing to fallback upstream");
                            if !wrapped {
                                // Before any wrapper was followed each
                                // upstream serves its own tag URL.
                                current_url = next.endpoint().to_string();
                                visited.insert(current_url.clone());
                            }
                            continue;
                        }
                        result.error = Some(GatewayError::ChainUpstreamExhausted);
                        error_code = Some(303);
                        break 'chain;
                    }
                }
            };

            if self.config.validate_each_response {
                if let Err(err) = validate_xml(&xml) {
                    self.record_hop(&mut result, &current_url, upstream_idx, depth, hop_start, Some(&err));
                    result.error = Some(err);
                    error_code = Some(100);
                    break 'chain;
                }
            }

            // Version comes from the response; any version is accepted here
            let document = match parser::parse_auto(&xml) {
                Ok(document) => document,
                Err(err) => {
                    self.record_hop(&mut result, &current_url, upstream_idx, depth, hop_start, Some(&err));
                    result.error = Some(err);
                    error_code = Some(100);
                    break 'chain;
                }
            };

            if self.config.collect_tracking_urls {
                for url in &document.impressions {
                    if self.config.dedup_impressions && !seen_impressions.insert(url.clone()) {
                        continue;
                    }
                    result.accumulated_impressions.push(url.clone());
                }
                for (event, urls) in &document.tracking_events {
                    result
                        .accumulated_tracking_events
                        .entry(event.clone())
                        .or_default()
                        .extend(urls.iter().cloned());
                }
            }
            if self.config.collect_error_urls {
                result.accumulated_errors.extend(document.error_urls.iter().cloned());
            }

            if document.kind == VastKind::Inline {
                self.record_hop(&mut result, &current_url, upstream_idx, depth, hop_start, None);
                debug!(depth, "chain reached inline document");
                result.final_document = Some(document);
                break 'chain;
            }

            // Wrapper: non-empty URI guaranteed by the parser invariant
            let next_url = document.vast_ad_tag_uri.clone().unwrap_or_default();
            let next_url =
                self.registry
                    .substitute(&next_url, session, &MacroContext::new());
            self.record_hop(&mut result, &current_url, upstream_idx, depth, hop_start, None);
            wrapped = true;

            if !visited.insert(next_url.clone()) {
                warn!(url = %next_url, "wrapper chain cycle detected");
                result.error = Some(GatewayError::WrapperCycle(next_url));
                error_code = Some(301);
                break 'chain;
            }
            debug!(depth, next = %next_url, "following wrapper");
            current_url = next_url;
        }

        if result.final_document.is_none() && result.error.is_none() {
            // Depth exhausted without an Inline
            if self.config.resolution_strategy == ResolutionStrategy::MaxDepth {
                debug!("max-depth strategy: returning accumulated data without error");
            } else {
                result.error = Some(GatewayError::WrapperDepthExceeded(self.config.max_depth));
                error_code = Some(301);
            }
        }

        result.success = result.final_document.is_some();
        result.total_duration_ms = start.elapsed().as_millis() as u64;
        metrics::record_resolution(match (result.success, result.error.as_ref()) {
            (true, _) => "success",
            (false, Some(err)) => err.code(),
            (false, None) => "empty",
        });
        metrics::record_resolution_duration(start);

        if result.success {
            if self.config.collect_tracking_urls && self.config.fire_impressions {
                tracking::fire_impressions(&self.beacon_client, &result.accumulated_impressions);
            }
            result.selected_media = result.final_document.as_ref().and_then(|doc| {
                select_media(
                    &doc.media_files,
                    self.config.selection_strategy,
                    self.config.custom_selector.as_ref(),
                )
            });
        } else if self.config.collect_error_urls {
            if let Some(code) = error_code {
                tracking::fire_error_urls(
                    &self.beacon_client,
                    &result.accumulated_errors,
                    code,
                    session,
                    &self.registry,
                );
            }
        }

        result
    }

    fn record_hop(
        &self,
        result: &mut ResolutionResult,
        url: &str,
        upstream_idx: usize,
        depth: u32,
        hop_start: Instant,
        error: Option<&GatewayError>,
    ) {
        result.chain.push(ChainHop {
            url: url.to_string(),
            used_upstream_key: self.upstreams[upstream_idx].key().to_string(),
            depth,
            duration_ms: hop_start.elapsed().as_millis() as u64,
            ok: error.is_none(),
            error: error.map(|e| e.to_string()),
        });
    }

    /// Resolve an ad pod: each chain runs concurrently, results come back
    /// in pod position order regardless of completion order.
    pub async fn resolve_pod(
        resolvers: &[Arc<ChainResolver>],
        session: &SessionContext,
        cancel: &CancellationToken,
    ) -> Vec<ResolutionResult> {
        let mut set = tokio::task::JoinSet::new();
        for (position, resolver) in resolvers.iter().enumerate() {
            let resolver = resolver.clone();
            let session = session.with_metadata("pod_position", serde_json::json!(position));
            let cancel = cancel.clone();
            set.spawn(async move { (position, resolver.resolve(&session, &cancel).await) });
        }

        let mut slots: Vec<Option<ResolutionResult>> =
            (0..resolvers.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, result)) => slots[position] = Some(result),
                Err(e) => warn!(error = %e, "pod chain task failed"),
            }
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| ResolutionResult {
                    error: Some(GatewayError::UpstreamError("pod chain task failed".into())),
                    ..Default::default()
                })
            })
            .collect()
    }
}

/// Well-formedness sweep used by `validate_each_response`.
fn validate_xml(xml: &str) -> Result<()> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => return Ok(()),
            Err(e) => {
                return Err(GatewayError::VastMalformed(format!(
                    "response failed validation: {e}"
                )));
            }
            _ => {}
        }
    }
}
