use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Delivery mode of an ad media file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Progressive,
    Streaming,
}

/// A single media file for an ad creative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub uri: String,
    pub mime_type: String,
    pub delivery: Option<Delivery>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub codec: Option<String>,
}

impl MediaFile {
    /// Pixel area used for resolution tie-breaks; 0 when dimensions are unknown.
    pub fn resolution(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }
}

/// Protocol-agnostic ad request at the gateway boundary.
///
/// Sparse by design: handlers read only the fields their protocol needs.
/// Protocol-specific parameters travel in `extensions`, keyed by protocol
/// name ("vast", "openrtb", ...). Immutable once dispatched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdRequest {
    pub request_id: String,
    pub timestamp_ms: i64,
    /// Explicit protocol selection; inferred from `extensions` when absent
    pub protocol: Option<String>,
    pub placement_id: Option<String>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub content_id: Option<String>,
    pub content_title: Option<String>,
    pub country: Option<String>,
    pub consent_string: Option<String>,
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl AdRequest {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp_ms: crate::session::context::epoch_millis(),
            ..Default::default()
        }
    }

    /// Attach a protocol-specific extension block.
    pub fn with_extension(mut self, protocol: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(protocol.into(), value);
        self
    }
}

/// Protocol-agnostic ad response at the gateway boundary.
///
/// On failure only `response_id`, `request_id`, `timestamp_ms`, `success`,
/// `error_code` and `protocol` are populated; creative fields stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdResponse {
    pub response_id: String,
    pub request_id: String,
    pub timestamp_ms: i64,
    pub success: bool,
    pub error_code: Option<String>,
    /// Set when the response was served from the gateway response cache
    pub cached: bool,
    pub ad_id: Option<String>,
    pub ad_title: Option<String>,
    pub advertiser: Option<String>,
    pub campaign_id: Option<String>,
    pub creative_id: Option<String>,
    pub impression_urls: Vec<String>,
    pub tracking_events: BTreeMap<String, Vec<String>>,
    pub media_files: Vec<MediaFile>,
    /// Price in integer micro-units of `currency`
    pub price_micros: Option<i64>,
    pub currency: Option<String>,
    pub protocol: Option<String>,
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl AdResponse {
    /// Successful response skeleton echoing the request.
    pub fn for_request(request: &AdRequest) -> Self {
        Self {
            response_id: uuid::Uuid::new_v4().to_string(),
            request_id: request.request_id.clone(),
            timestamp_ms: crate::session::context::epoch_millis(),
            success: true,
            ..Default::default()
        }
    }

    /// Failure response: echoes the request id, carries the taxonomy tag,
    /// never populates creative fields.
    pub fn failure(request_id: &str, error: &GatewayError) -> Self {
        Self {
            response_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            timestamp_ms: crate::session::context::epoch_millis(),
            success: false,
            error_code: Some(error.code().to_string()),
            ..Default::default()
        }
    }
}
