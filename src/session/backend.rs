use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

#[cfg(feature = "redis")]
use redis::aio::ConnectionManager;
#[cfg(feature = "redis")]
use tracing::info;

/// Async key/value state store shared by frequency capping, budgets,
/// session records and the gateway response cache.
///
/// Values are JSON objects (field → scalar). `increment` must be atomic
/// under contention; callers never read-modify-write counters.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value, optionally with a TTL. Objects are stored field-wise
    /// so later `increment` calls can address individual fields.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Atomically add `delta` to an integer field of the record at `key`,
    /// creating record and field as needed. Returns the new value.
    async fn increment(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory state backend with per-key TTL and lazy expiration.
///
/// Increment atomicity comes from the DashMap shard lock held across the
/// entry access.
pub struct MemoryStateBackend {
    entries: DashMap<String, MemoryEntry>,
    default_ttl: Option<Duration>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: None,
        }
    }

    pub fn with_default_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: Some(ttl),
        }
    }

    /// Drop expired entries eagerly. Expiration is otherwise lazy on `get`.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.expired());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.or(self.default_ttl).map(|t| Instant::now() + t);
        self.entries
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            MemoryEntry {
                value: Value::Object(serde_json::Map::new()),
                expires_at: self.default_ttl.map(|t| Instant::now() + t),
            }
        });
        if entry.expired() {
            entry.value = Value::Object(serde_json::Map::new());
            entry.expires_at = self.default_ttl.map(|t| Instant::now() + t);
        }
        let obj = entry.value.as_object_mut().ok_or_else(|| {
            GatewayError::StateBackendError(format!("key {key} does not hold a record"))
        })?;
        let current = obj.get(field).and_then(Value::as_i64).unwrap_or(0);
        let next = current + delta;
        obj.insert(field.to_string(), Value::from(next));
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Redis-backed state store. Records are Redis hashes so `increment`
/// maps to server-side `HINCRBY`; scalar fields are JSON-encoded strings.
#[cfg(feature = "redis")]
pub struct RedisStateBackend {
    conn: ConnectionManager,
    key_prefix: String,
    default_ttl: Option<Duration>,
}

#[cfg(feature = "redis")]
impl RedisStateBackend {
    pub async fn connect(url: &str, default_ttl: Option<Duration>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
        info!("Connected to Redis state backend at {}", url);
        Ok(Self {
            conn,
            key_prefix: "adgate".to_string(),
            default_ttl,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn apply_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        if let Some(ttl) = ttl.or(self.default_ttl) {
            let mut conn = self.conn.clone();
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs())
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl StateBackend for RedisStateBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&full)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut obj = serde_json::Map::new();
        for (field, raw) in fields {
            let parsed = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            obj.insert(field, parsed);
        }
        Ok(Some(Value::Object(obj)))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let full = self.full_key(key);
        let obj = match value {
            Value::Object(obj) => obj,
            other => {
                // Scalars are stored as single-field records
                let mut obj = serde_json::Map::new();
                obj.insert("__value".to_string(), other);
                obj
            }
        };
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&full);
        for (field, field_value) in &obj {
            let raw = serde_json::to_string(field_value)
                .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
            cmd.arg(field).arg(raw);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
        self.apply_ttl(&full, ttl).await
    }

    async fn increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();
        let next: i64 = redis::cmd("HINCRBY")
            .arg(&full)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
        self.apply_ttl(&full, None).await?;
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full = self.full_key(key);
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(&full)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| GatewayError::StateBackendError(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager has no explicit shutdown; dropping closes it.
        Ok(())
    }
}
