use crate::types::AdRequest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current time as epoch milliseconds
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Immutable per-request session context.
///
/// Constructed once per request and shared by value through every layer:
/// macros read `timestamp_ms`/`cachebusting`/`correlator`, middleware reads
/// `user_id` for caps, the resolver threads it into macro substitution.
/// There is no in-place mutation; derivation goes through [`with_metadata`].
///
/// [`with_metadata`]: SessionContext::with_metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub request_id: String,
    pub timestamp_ms: i64,
    /// Correlates all upstream calls made for one request
    pub correlator: String,
    /// Cache-busting token substituted for `[CACHEBUSTING]`
    pub cachebusting: String,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub cookies: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SessionContext {
    /// Create a context with generated correlator and cachebusting tokens.
    pub fn new(session_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        let now = epoch_millis();
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            timestamp_ms: now,
            correlator: uuid::Uuid::new_v4().simple().to_string(),
            cachebusting: cachebusting_token(),
            user_id: None,
            device_id: None,
            ip_address: None,
            user_agent: None,
            cookies: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Derive a context from a gateway [`AdRequest`], carrying over the
    /// user/device identity fields.
    pub fn from_ad_request(request: &AdRequest) -> Self {
        let session_id = request
            .user_id
            .clone()
            .or_else(|| request.device_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let mut ctx = Self::new(session_id, request.request_id.clone());
        ctx.user_id = request.user_id.clone();
        ctx.device_id = request.device_id.clone();
        ctx.ip_address = request.ip_address.clone();
        ctx.user_agent = request.user_agent.clone();
        ctx
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Functional update: returns a new context equal to this one except
    /// for the merged metadata entry. The original is untouched.
    pub fn with_metadata(&self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value);
        next
    }
}

/// Numeric cache-busting token, distinct across calls within one process.
fn cachebusting_token() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}", nanos % 10_000_000_000)
}
