//! End-to-end chain resolution tests over in-memory transports.
//!
//! Each scenario wires real upstreams against deterministic fixtures and
//! drives the resolver through the full fetch → parse → accumulate →
//! select pipeline.

use adgate::error::GatewayError;
use adgate::resolver::{ChainResolver, ResolutionStrategy, ResolverConfig, SelectionStrategy};
use adgate::session::SessionContext;
use adgate::transport::{MemoryTransport, Transport, TransportKind};
use adgate::upstream::{TransportUpstream, Upstream};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INLINE_S1: &str = r#"<VAST version="4.2"><Ad id="A1"><InLine><AdSystem>S</AdSystem><AdTitle>T</AdTitle><Impression>https://t/imp</Impression><Creatives><Creative><Linear><Duration>00:00:30</Duration><MediaFiles><MediaFile delivery="progressive" type="video/mp4" width="1280" height="720" bitrate="1500">https://cdn/v.mp4</MediaFile></MediaFiles></Linear></Creative></Creatives></InLine></Ad></VAST>"#;

fn inline_with_impression(imp: &str) -> String {
    INLINE_S1.replace("https://t/imp", imp)
}

fn wrapper(tag_uri: &str, impression: &str) -> String {
    format!(
        r#"<VAST version="4.0"><Ad id="W"><Wrapper><AdSystem>W</AdSystem><VASTAdTagURI><![CDATA[{tag_uri}]]></VASTAdTagURI><Impression>{impression}</Impression></Wrapper></Ad></VAST>"#
    )
}

fn upstream(key: &str, endpoint: &str, transport: Arc<MemoryTransport>) -> Arc<dyn Upstream> {
    Arc::new(TransportUpstream::new(key, endpoint, transport))
}

fn session() -> SessionContext {
    let mut ctx = SessionContext::new("sess-1", "req-1");
    ctx.cachebusting = "424242".to_string();
    ctx
}

#[tokio::test]
async fn s1_inline_at_depth_zero() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://primary", INLINE_S1);

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport),
        ResolverConfig {
            max_depth: 5,
            selection_strategy: SelectionStrategy::HighestBitrate,
            ..Default::default()
        },
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.chain.len(), 1);
    assert_eq!(result.accumulated_impressions, vec!["https://t/imp"]);
    assert_eq!(
        result.selected_media.as_ref().map(|m| m.uri.as_str()),
        Some("https://cdn/v.mp4")
    );
    assert_eq!(
        result.final_document.as_ref().and_then(|d| d.ad_id.as_deref()),
        Some("A1")
    );
    assert!(!result.used_fallback);
}

#[tokio::test]
async fn s2_one_wrapper_then_inline_with_macro_substitution() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        "mem://primary",
        wrapper("https://ads/next?cb=[CACHEBUSTING]", "https://t/imp1"),
    );
    transport.insert(
        "https://ads/next?cb=424242",
        inline_with_impression("https://t/imp2"),
    );

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport),
        ResolverConfig::default(),
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.chain.len(), 2);
    // Traversal order: wrapper impressions first, the inline's last
    assert_eq!(
        result.accumulated_impressions,
        vec!["https://t/imp1", "https://t/imp2"]
    );
    assert_eq!(
        result.selected_media.as_ref().map(|m| m.uri.as_str()),
        Some("https://cdn/v.mp4")
    );
    // The second hop's URL carries the substituted cachebusting token
    assert_eq!(result.chain[1].url, "https://ads/next?cb=424242");
    assert!(!result.chain[1].url.contains("[CACHEBUSTING]"));
}

#[tokio::test]
async fn s3_wrapper_cycle() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://primary", wrapper("mem://primary", "https://t/imp1"));

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport),
        ResolverConfig::default(),
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(
        result.error,
        Some(GatewayError::WrapperCycle("mem://primary".to_string()))
    );
    assert_eq!(result.chain.len(), 1);
}

#[tokio::test]
async fn s4_depth_exceeded() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://primary", wrapper("mem://w1", "https://t/a"));
    transport.insert("mem://w1", wrapper("mem://w2", "https://t/b"));
    transport.insert("mem://w2", wrapper("mem://w3", "https://t/c"));

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport),
        ResolverConfig {
            max_depth: 2,
            ..Default::default()
        },
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error, Some(GatewayError::WrapperDepthExceeded(2)));
    assert_eq!(result.chain.len(), 2);
}

#[tokio::test]
async fn s5_primary_fails_fallback_succeeds() {
    let transport = Arc::new(MemoryTransport::new());
    transport.push_script(
        "mem://primary",
        Err(GatewayError::TransportUnreachable("refused".into())),
    );
    transport.insert("mem://secondary", INLINE_S1);

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport.clone()),
        ResolverConfig::default(),
    )
    .with_fallbacks(vec![upstream("secondary", "mem://secondary", transport)]);

    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(result.success);
    assert!(result.used_fallback);
    assert_eq!(result.chain.len(), 1);
    assert_eq!(result.chain[0].used_upstream_key, "secondary");
}

#[tokio::test]
async fn fallback_ordering_is_strict() {
    let transport = Arc::new(MemoryTransport::new());
    transport.push_script(
        "mem://primary",
        Err(GatewayError::TransportUnreachable("down".into())),
    );
    transport.push_script(
        "mem://fb1",
        Err(GatewayError::TransportProtocolError { status: 503 }),
    );
    transport.insert("mem://fb2", INLINE_S1);

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport.clone()),
        ResolverConfig::default(),
    )
    .with_fallbacks(vec![
        upstream("fallback-1", "mem://fb1", transport.clone()),
        upstream("fallback-2", "mem://fb2", transport.clone()),
    ]);

    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.chain[0].used_upstream_key, "fallback-2");
    // Fallback #1 was attempted before fallback #2
    assert_eq!(transport.send_count("mem://fb1"), 1);
    assert_eq!(transport.send_count("mem://fb2"), 1);
}

#[tokio::test]
async fn all_upstreams_exhausted() {
    let transport = Arc::new(MemoryTransport::new());

    let resolver = ChainResolver::new(
        upstream("primary", "mem://void-a", transport.clone()),
        ResolverConfig::default(),
    )
    .with_fallbacks(vec![upstream("secondary", "mem://void-b", transport)]);

    let result = resolver.resolve(&session(), &CancellationToken::new()).await;
    assert!(!result.success);
    assert_eq!(result.error, Some(GatewayError::ChainUpstreamExhausted));
    assert!(result.used_fallback);
}

#[tokio::test]
async fn fallbacks_disabled_exhausts_on_primary() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://secondary", INLINE_S1);

    let resolver = ChainResolver::new(
        upstream("primary", "mem://void", transport.clone()),
        ResolverConfig {
            enable_fallbacks: false,
            ..Default::default()
        },
    )
    .with_fallbacks(vec![upstream("secondary", "mem://secondary", transport.clone())]);

    let result = resolver.resolve(&session(), &CancellationToken::new()).await;
    assert!(!result.success);
    assert_eq!(result.error, Some(GatewayError::ChainUpstreamExhausted));
    assert_eq!(transport.send_count("mem://secondary"), 0);
}

#[tokio::test]
async fn max_depth_one_wrapper_fails_inline_succeeds() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://wrapped", wrapper("mem://next", "https://t/a"));
    transport.insert("mem://inline", INLINE_S1);

    let config = ResolverConfig {
        max_depth: 1,
        ..Default::default()
    };
    let wrapped = ChainResolver::new(
        upstream("primary", "mem://wrapped", transport.clone()),
        config.clone(),
    );
    let result = wrapped.resolve(&session(), &CancellationToken::new()).await;
    assert!(!result.success);
    assert_eq!(result.error, Some(GatewayError::WrapperDepthExceeded(1)));

    let inline = ChainResolver::new(upstream("primary", "mem://inline", transport), config);
    let result = inline.resolve(&session(), &CancellationToken::new()).await;
    assert!(result.success);
}

#[tokio::test]
async fn malformed_response_is_terminal() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://primary", "<VAST version=\"4.2\"><Ad></Ad></VAST>");

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport),
        ResolverConfig::default(),
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;
    assert!(!result.success);
    assert!(matches!(result.error, Some(GatewayError::VastMalformed(_))));
    assert_eq!(result.chain.len(), 1);
    assert!(!result.chain[0].ok);
}

#[tokio::test]
async fn empty_media_files_selects_none() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        "mem://primary",
        r#"<VAST version="4.2"><Ad id="A1"><InLine><AdTitle>T</AdTitle><Impression>https://t/imp</Impression></InLine></Ad></VAST>"#,
    );

    for strategy in [
        SelectionStrategy::HighestBitrate,
        SelectionStrategy::LowestBitrate,
        SelectionStrategy::BestQuality,
    ] {
        let resolver = ChainResolver::new(
            upstream("primary", "mem://primary", transport.clone()),
            ResolverConfig {
                selection_strategy: strategy,
                ..Default::default()
            },
        );
        let result = resolver.resolve(&session(), &CancellationToken::new()).await;
        assert!(result.success);
        assert!(result.selected_media.is_none());
    }
}

#[tokio::test]
async fn zero_total_timeout_is_chain_timeout() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://primary", INLINE_S1);

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport),
        ResolverConfig {
            total_timeout: Duration::ZERO,
            ..Default::default()
        },
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;
    assert!(!result.success);
    assert_eq!(result.error, Some(GatewayError::ChainTimeout));
    assert!(result.chain.is_empty());
}

/// Transport that sleeps before answering, honoring the envelope timeout.
struct SlowTransport {
    delay: Duration,
    body: Bytes,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn send(
        &self,
        _endpoint: &str,
        _payload: Option<Bytes>,
        _metadata: &BTreeMap<String, String>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> adgate::Result<Bytes> {
        let work = async {
            tokio::time::sleep(self.delay).await;
            Ok(self.body.clone())
        };
        match timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => Err(GatewayError::Canceled),
                result = tokio::time::timeout(limit, work) => {
                    result.map_err(|_| GatewayError::TransportTimeout)?
                }
            },
            None => work.await,
        }
    }

    async fn close(&self) {}

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }
}

#[tokio::test]
async fn per_request_timeout_dominates_when_tighter() {
    let slow: Arc<dyn Transport> = Arc::new(SlowTransport {
        delay: Duration::from_millis(200),
        body: Bytes::from_static(INLINE_S1.as_bytes()),
    });
    let primary: Arc<dyn Upstream> =
        Arc::new(TransportUpstream::new("primary", "slow://tag", slow));

    let resolver = ChainResolver::new(
        primary,
        ResolverConfig {
            per_request_timeout: Duration::from_millis(30),
            total_timeout: Duration::from_secs(10),
            ..Default::default()
        },
    );
    let start = std::time::Instant::now();
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(!result.success);
    assert_eq!(result.error, Some(GatewayError::ChainUpstreamExhausted));
    // The hop was cut off by the per-request bound, not the 10s total
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn total_timeout_dominates_when_tighter() {
    let slow: Arc<dyn Transport> = Arc::new(SlowTransport {
        delay: Duration::from_millis(500),
        body: Bytes::from_static(INLINE_S1.as_bytes()),
    });
    let primary: Arc<dyn Upstream> =
        Arc::new(TransportUpstream::new("primary", "slow://tag", slow));

    let resolver = ChainResolver::new(
        primary,
        ResolverConfig {
            per_request_timeout: Duration::from_secs(10),
            total_timeout: Duration::from_millis(40),
            ..Default::default()
        },
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(!result.success);
    // Hop budget was clamped to the remaining total
    assert!(result.total_duration_ms <= 500);
}

#[tokio::test]
async fn chain_and_duration_invariants() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("mem://primary", wrapper("mem://w1", "https://t/a"));
    transport.insert("mem://w1", wrapper("mem://w2", "https://t/b"));
    transport.insert("mem://w2", inline_with_impression("https://t/c"));

    let config = ResolverConfig {
        max_depth: 5,
        total_timeout: Duration::from_secs(8),
        ..Default::default()
    };
    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport),
        config.clone(),
    );
    let result = resolver.resolve(&session(), &CancellationToken::new()).await;

    assert!(result.success);
    assert!(result.chain.len() <= (config.max_depth + 1) as usize);
    assert!(result.total_duration_ms <= config.total_timeout.as_millis() as u64 + 100);
    // No URL repeats across the traversal
    let mut urls: Vec<&str> = result.chain.iter().map(|h| h.url.as_str()).collect();
    urls.sort_unstable();
    urls.dedup();
    assert_eq!(urls.len(), result.chain.len());
    // Accumulation order follows traversal
    assert_eq!(
        result.accumulated_impressions,
        vec!["https://t/a", "https://t/b", "https://t/c"]
    );
}

#[tokio::test]
async fn first_inline_strategy_stops_at_first_inline() {
    let transport = Arc::new(MemoryTransport::new());
    transport.push_script(
        "mem://primary",
        Err(GatewayError::TransportUnreachable("down".into())),
    );
    transport.insert("mem://secondary", INLINE_S1);

    let resolver = ChainResolver::new(
        upstream("primary", "mem://primary", transport.clone()),
        ResolverConfig {
            resolution_strategy: ResolutionStrategy::FirstInline,
            ..Default::default()
        },
    )
    .with_fallbacks(vec![upstream("secondary", "mem://secondary", transport)]);

    let result = resolver.resolve(&session(), &CancellationToken::new()).await;
    // Inline produced by a different upstream than primary still wins
    assert!(result.success);
    assert_eq!(result.chain.len(), 1);
    assert_eq!(result.chain[0].used_upstream_key, "secondary");
}
