use crate::error::{GatewayError, Result};
use crate::resolver::{tracking, ChainResolver};
use crate::session::SessionContext;
use crate::types::{AdRequest, AdResponse};
use crate::upstream::{codec, ParamValue, Upstream, UpstreamRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Protocol handler contract at the gateway boundary.
#[async_trait]
pub trait AdHandler: Send + Sync {
    /// Registry name; doubles as the protocol key in `AdRequest.extensions`.
    fn name(&self) -> &str;

    /// Map the generic request to protocol parameters, run the protocol
    /// machinery, and map the outcome back to a generic response.
    async fn fetch(&self, request: &AdRequest, ctx: &SessionContext) -> Result<AdResponse>;

    /// Deliver an application-side playback/interaction signal.
    async fn track(&self, event: &str, response: &AdResponse, ctx: &SessionContext);

    fn validate_request(&self, request: &AdRequest) -> bool;
}

/// VAST protocol handler: maps `AdRequest` fields and the `vast`
/// extension block to tag parameters, resolves the wrapper chain, and
/// flattens the resolution into an `AdResponse`.
pub struct VastHandler {
    resolver: Arc<ChainResolver>,
    beacon_client: reqwest::Client,
}

impl VastHandler {
    pub fn new(resolver: Arc<ChainResolver>) -> Self {
        Self {
            resolver,
            beacon_client: reqwest::Client::new(),
        }
    }

    fn request_params(request: &AdRequest) -> Vec<(String, ParamValue)> {
        let mut params = Vec::new();
        if let Some(width) = request.width {
            params.push(("w".to_string(), ParamValue::from(width)));
        }
        if let Some(height) = request.height {
            params.push(("h".to_string(), ParamValue::from(height)));
        }
        if let Some(ip) = &request.ip_address {
            params.push(("ip".to_string(), ParamValue::from(ip.clone())));
        }
        if let Some(ua) = &request.user_agent {
            params.push(("ua".to_string(), ParamValue::from(ua.clone())));
        }
        // Scalars from the protocol extension become tag parameters
        if let Some(Value::Object(ext)) = request.extensions.get("vast") {
            for (key, value) in ext {
                let scalar = match value {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                };
                if let Some(scalar) = scalar {
                    params.push((key.clone(), ParamValue::Single(scalar)));
                }
            }
        }
        params
    }
}

#[async_trait]
impl AdHandler for VastHandler {
    fn name(&self) -> &str {
        "vast"
    }

    async fn fetch(&self, request: &AdRequest, ctx: &SessionContext) -> Result<AdResponse> {
        let params = Self::request_params(request);
        let cancel = CancellationToken::new();
        let result = self
            .resolver
            .resolve_with_params(ctx, &params, &cancel)
            .await;

        if !result.success {
            return Err(result
                .error
                .unwrap_or_else(|| GatewayError::UpstreamError("empty resolution".into())));
        }
        let document = result
            .final_document
            .as_ref()
            .ok_or_else(|| GatewayError::UpstreamError("resolution without document".into()))?;

        info!(
            request_id = request.request_id,
            chain_len = result.chain.len(),
            used_fallback = result.used_fallback,
            "VAST chain resolved"
        );

        let mut response = AdResponse::for_request(request);
        response.protocol = Some("vast".to_string());
        response.ad_id = document.ad_id.clone();
        response.ad_title = document.ad_title.clone();
        response.advertiser = document.advertiser.clone();
        response.price_micros = document.price_micros;
        response.currency = document.currency.clone();
        response.impression_urls = result.accumulated_impressions.clone();
        response.tracking_events = result.accumulated_tracking_events.clone();
        response.media_files = document.media_files.clone();
        response.extensions.insert(
            "vast".to_string(),
            serde_json::json!({
                "version": document.version.as_str(),
                "chain_depth": result.chain.len(),
                "used_fallback": result.used_fallback,
                "selected_media_uri": result.selected_media.as_ref().map(|m| m.uri.clone()),
                "click_through": document.click_through,
                "duration_seconds": document.duration_seconds,
            }),
        );
        Ok(response)
    }

    async fn track(&self, event: &str, response: &AdResponse, _ctx: &SessionContext) {
        let Some(urls) = response.tracking_events.get(event) else {
            debug!(event, "no tracking URLs for event");
            return;
        };
        for url in urls {
            tracking::fire_beacon(self.beacon_client.clone(), url.clone(), event.to_string());
        }
    }

    fn validate_request(&self, request: &AdRequest) -> bool {
        // The resolver carries the tag endpoint; any identified request works
        !request.request_id.is_empty() || request.placement_id.is_some()
    }
}

/// Minimal OpenRTB handler: one bid request, first bid of the first seat.
pub struct OpenRtbHandler {
    upstream: Arc<dyn Upstream>,
}

impl OpenRtbHandler {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    fn bid_request(request: &AdRequest) -> Value {
        serde_json::json!({
            "id": request.request_id,
            "imp": [{
                "id": "1",
                "video": {
                    "w": request.width,
                    "h": request.height,
                    "mimes": ["video/mp4"],
                }
            }],
            "device": {
                "ua": request.user_agent,
                "ip": request.ip_address,
            },
            "user": { "id": request.user_id },
        })
    }
}

#[async_trait]
impl AdHandler for OpenRtbHandler {
    fn name(&self) -> &str {
        "openrtb"
    }

    async fn fetch(&self, request: &AdRequest, ctx: &SessionContext) -> Result<AdResponse> {
        let req = codec::json_payload(
            UpstreamRequest::new().context(ctx.clone()).no_cache(),
            &Self::bid_request(request),
        )?;
        let body = self.upstream.request(req).await?;
        let bid_response = codec::decode_json(&body)?;

        let bid = bid_response
            .get("seatbid")
            .and_then(|s| s.get(0))
            .and_then(|s| s.get("bid"))
            .and_then(|b| b.get(0))
            .ok_or_else(|| GatewayError::UpstreamError("no bid in response".into()))?;

        let mut response = AdResponse::for_request(request);
        response.protocol = Some("openrtb".to_string());
        response.ad_id = bid
            .get("adid")
            .or_else(|| bid.get("id"))
            .and_then(Value::as_str)
            .map(String::from);
        response.creative_id = bid.get("crid").and_then(Value::as_str).map(String::from);
        response.campaign_id = bid.get("cid").and_then(Value::as_str).map(String::from);
        response.price_micros = bid
            .get("price")
            .and_then(Value::as_f64)
            .map(|cpm| (cpm * 1_000_000.0).round() as i64);
        response.currency = bid_response
            .get("cur")
            .and_then(Value::as_str)
            .map(String::from);
        if let Some(nurl) = bid.get("nurl").and_then(Value::as_str) {
            response.impression_urls.push(nurl.to_string());
        }
        if let Some(adm) = bid.get("adm").and_then(Value::as_str) {
            response.extensions.insert(
                "openrtb".to_string(),
                serde_json::json!({ "adm": adm }),
            );
        }
        Ok(response)
    }

    async fn track(&self, event: &str, _response: &AdResponse, _ctx: &SessionContext) {
        // Win/billing notices ride on nurl/burl at bid time; nothing to do here
        debug!(event, "openrtb track is a no-op");
    }

    fn validate_request(&self, request: &AdRequest) -> bool {
        request.width.is_some() && request.height.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolverConfig;
    use crate::transport::MemoryTransport;
    use crate::upstream::TransportUpstream;

    const INLINE: &str = r#"<VAST version="4.2"><Ad id="A1"><InLine>
        <AdTitle>Spot</AdTitle>
        <Impression>https://t/imp</Impression>
        <Creatives><Creative><Linear>
          <Duration>00:00:15</Duration>
          <MediaFiles>
            <MediaFile delivery="progressive" type="video/mp4" width="1280" height="720" bitrate="1500">https://cdn/v.mp4</MediaFile>
          </MediaFiles>
        </Linear></Creative></Creatives>
    </InLine></Ad></VAST>"#;

    fn vast_handler(transport: Arc<MemoryTransport>, endpoint: &str) -> VastHandler {
        let primary: Arc<dyn Upstream> =
            Arc::new(TransportUpstream::new("primary", endpoint, transport));
        VastHandler::new(Arc::new(ChainResolver::new(
            primary,
            ResolverConfig::default(),
        )))
    }

    #[tokio::test]
    async fn test_vast_fetch_maps_resolution() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://vast?w=1280&h=720", INLINE);

        let handler = vast_handler(transport, "mem://vast");
        let mut request = AdRequest::new("r1");
        request.width = Some(1280);
        request.height = Some(720);
        let ctx = SessionContext::from_ad_request(&request);

        let response = handler.fetch(&request, &ctx).await.unwrap();
        assert!(response.success);
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.ad_id.as_deref(), Some("A1"));
        assert_eq!(response.ad_title.as_deref(), Some("Spot"));
        assert_eq!(response.impression_urls, vec!["https://t/imp"]);
        assert_eq!(response.media_files.len(), 1);
        assert_eq!(
            response.extensions["vast"]["selected_media_uri"],
            serde_json::json!("https://cdn/v.mp4")
        );
    }

    #[tokio::test]
    async fn test_vast_fetch_failure_surfaces_error() {
        let transport = Arc::new(MemoryTransport::new());
        let handler = vast_handler(transport, "mem://void");
        let request = AdRequest::new("r1");
        let ctx = SessionContext::from_ad_request(&request);

        let err = handler.fetch(&request, &ctx).await.unwrap_err();
        assert_eq!(err, GatewayError::ChainUpstreamExhausted);
    }

    #[tokio::test]
    async fn test_vast_extension_scalars_become_params() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://vast?pod=3", INLINE);

        let handler = vast_handler(transport, "mem://vast");
        let request =
            AdRequest::new("r1").with_extension("vast", serde_json::json!({"pod": 3}));
        let ctx = SessionContext::from_ad_request(&request);
        let response = handler.fetch(&request, &ctx).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_openrtb_fetch_maps_first_bid() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(
            "mem://dsp",
            serde_json::json!({
                "id": "r1",
                "cur": "USD",
                "seatbid": [{
                    "bid": [{
                        "id": "b1",
                        "impid": "1",
                        "price": 2.5,
                        "adid": "ad-77",
                        "crid": "cr-9",
                        "cid": "camp-3",
                        "nurl": "https://dsp/win",
                        "adm": "<VAST/>",
                    }]
                }]
            })
            .to_string(),
        );

        let upstream: Arc<dyn Upstream> =
            Arc::new(TransportUpstream::new("dsp", "mem://dsp", transport));
        let handler = OpenRtbHandler::new(upstream);

        let mut request = AdRequest::new("r1");
        request.width = Some(640);
        request.height = Some(480);
        let ctx = SessionContext::from_ad_request(&request);

        let response = handler.fetch(&request, &ctx).await.unwrap();
        assert_eq!(response.ad_id.as_deref(), Some("ad-77"));
        assert_eq!(response.creative_id.as_deref(), Some("cr-9"));
        assert_eq!(response.campaign_id.as_deref(), Some("camp-3"));
        assert_eq!(response.price_micros, Some(2_500_000));
        assert_eq!(response.currency.as_deref(), Some("USD"));
        assert_eq!(response.impression_urls, vec!["https://dsp/win"]);
    }

    #[tokio::test]
    async fn test_openrtb_no_bid_is_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert("mem://dsp", r#"{"id": "r1", "seatbid": []}"#);
        let upstream: Arc<dyn Upstream> =
            Arc::new(TransportUpstream::new("dsp", "mem://dsp", transport));
        let handler = OpenRtbHandler::new(upstream);

        let request = AdRequest::new("r1");
        let ctx = SessionContext::from_ad_request(&request);
        let err = handler.fetch(&request, &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamError(_)));
    }

    #[test]
    fn test_openrtb_validate_requires_dimensions() {
        let transport = Arc::new(MemoryTransport::new());
        let upstream: Arc<dyn Upstream> =
            Arc::new(TransportUpstream::new("dsp", "mem://dsp", transport));
        let handler = OpenRtbHandler::new(upstream);

        let mut request = AdRequest::new("r1");
        assert!(!handler.validate_request(&request));
        request.width = Some(640);
        request.height = Some(480);
        assert!(handler.validate_request(&request));
    }
}
