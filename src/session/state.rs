use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Mutable per-session/per-user state persisted via a
/// [`StateBackend`](crate::session::backend::StateBackend).
///
/// Counters only ever increase within a window; window resets are the
/// frequency capper's policy, not the record's.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub impression_count: i64,
    #[serde(default)]
    pub hourly_count: i64,
    #[serde(default)]
    pub daily_count: i64,
    #[serde(default)]
    pub weekly_count: i64,
    #[serde(default)]
    pub last_impression_ms: Option<i64>,
    #[serde(default)]
    pub ad_history: Vec<String>,
    /// Spend attributed to this session, integer micro-units
    #[serde(default)]
    pub budget_spent_micros: Option<i64>,
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
}

/// Frequency-cap record stored under `freq:{user_id}:{campaign_id?}`.
///
/// Field names double as the backend `increment` field keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRecord {
    #[serde(default)]
    pub hourly_count: i64,
    #[serde(default)]
    pub daily_count: i64,
    #[serde(default)]
    pub weekly_count: i64,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub last_impression_ms: i64,
}

impl FrequencyRecord {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Campaign budget record stored under `budget:{campaign_id}`.
/// Invariant: `spent_micros <= total_micros` at every observable point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub campaign_id: String,
    pub total_micros: i64,
    #[serde(default)]
    pub spent_micros: i64,
    pub currency: String,
}

impl BudgetRecord {
    pub fn remaining_micros(&self) -> i64 {
        self.total_micros - self.spent_micros
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| GatewayError::StateBackendError(format!("bad budget record: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Backend key layout. Kept in one place so memory and remote backends
/// agree with the persisted-state contract.
pub mod keys {
    /// `freq:{user_id}` or `freq:{user_id}:{campaign_id}`
    pub fn frequency(user_id: &str, campaign_id: Option<&str>) -> String {
        match campaign_id {
            Some(campaign) => format!("freq:{user_id}:{campaign}"),
            None => format!("freq:{user_id}"),
        }
    }

    /// `budget:{campaign_id}`
    pub fn budget(campaign_id: &str) -> String {
        format!("budget:{campaign_id}")
    }

    /// `session:{session_id}`
    pub fn session(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    /// `cache:{fingerprint}`
    pub fn cache(fingerprint: &str) -> String {
        format!("cache:{fingerprint}")
    }
}
