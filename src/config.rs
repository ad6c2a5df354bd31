use std::env;
use std::time::Duration;

/// State backend selection
#[derive(Clone, Debug, PartialEq)]
pub enum StateBackendType {
    /// In-memory backend (default for dev and tests)
    Memory,
    /// Remote Redis-compatible backend (requires the `redis` feature)
    Redis,
}

/// Budget debit timing. Never chosen implicitly; callers pick one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebitMode {
    /// Debit after the upstream succeeds (an over-committed race loses the
    /// response rather than over-spending)
    #[default]
    PostSuccess,
    /// Reserve before dispatch, roll back on failure
    Reserve,
}

/// Gateway configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub is_dev: bool,
    /// Primary VAST endpoint URL (supports `[NAME]` macros)
    pub vast_endpoint: Option<String>,
    /// Ordered fallback VAST endpoints, tried when the primary fails
    pub vast_fallback_endpoints: Vec<String>,
    /// Maximum VAST wrapper redirects to follow (VAST 4.2 recommends 5)
    pub max_wrapper_depth: u32,
    /// Wall-clock bound for one whole chain resolution
    pub total_timeout: Duration,
    /// Bound for each individual hop
    pub per_request_timeout: Duration,
    pub enable_fallbacks: bool,
    /// Gateway response cache TTL; zero disables caching
    pub response_cache_ttl: Duration,
    pub session_ttl: Duration,
    pub state_backend: StateBackendType,
    pub redis_url: Option<String>,
    /// Frequency caps; absent means uncapped for that window
    pub hourly_cap: Option<i64>,
    pub daily_cap: Option<i64>,
    pub weekly_cap: Option<i64>,
    pub budget_debit_mode: DebitMode,
    pub user_agent: String,
}

impl Config {
    /// Load configuration from environment variables.
    /// In DEV mode, provides sensible defaults. In PROD mode, the VAST
    /// endpoint is required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let vast_endpoint = env::var("VAST_ENDPOINT").ok();
        if !is_dev && vast_endpoint.is_none() {
            return Err("VAST_ENDPOINT is required in production".into());
        }

        // Comma-separated fallback tags, in priority order
        let vast_fallback_endpoints = env::var("VAST_FALLBACK_ENDPOINTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let max_wrapper_depth = env_parse("MAX_WRAPPER_DEPTH", 5);
        let total_timeout = Duration::from_millis(env_parse("TOTAL_TIMEOUT_MS", 8_000));
        let per_request_timeout = Duration::from_millis(env_parse("REQUEST_TIMEOUT_MS", 2_000));
        let enable_fallbacks = env_parse("ENABLE_FALLBACKS", true);
        let response_cache_ttl = Duration::from_secs(env_parse("RESPONSE_CACHE_TTL_SECS", 60));
        let session_ttl = Duration::from_secs(env_parse("SESSION_TTL_SECS", 3_600));

        let redis_url = env::var("REDIS_URL").ok();
        let state_backend = match env::var("STATE_BACKEND")
            .unwrap_or_else(|_| "auto".to_string())
            .to_lowercase()
            .as_str()
        {
            "redis" => StateBackendType::Redis,
            "memory" => StateBackendType::Memory,
            _ => {
                if redis_url.is_some() {
                    StateBackendType::Redis
                } else {
                    StateBackendType::Memory
                }
            }
        };

        let hourly_cap = env::var("HOURLY_CAP").ok().and_then(|v| v.parse().ok());
        let daily_cap = env::var("DAILY_CAP").ok().and_then(|v| v.parse().ok());
        let weekly_cap = env::var("WEEKLY_CAP").ok().and_then(|v| v.parse().ok());

        let budget_debit_mode = match env::var("BUDGET_DEBIT_MODE")
            .unwrap_or_else(|_| "post-success".to_string())
            .to_lowercase()
            .as_str()
        {
            "reserve" => DebitMode::Reserve,
            _ => DebitMode::PostSuccess,
        };

        let user_agent = env::var("GATEWAY_USER_AGENT")
            .unwrap_or_else(|_| format!("adgate/{}", env!("CARGO_PKG_VERSION")));

        Ok(Config {
            is_dev,
            vast_endpoint,
            vast_fallback_endpoints,
            max_wrapper_depth,
            total_timeout,
            per_request_timeout,
            enable_fallbacks,
            response_cache_ttl,
            session_ttl,
            state_backend,
            redis_url,
            hourly_cap,
            daily_cap,
            weekly_cap,
            budget_debit_mode,
            user_agent,
        })
    }
}

impl Config {
    /// Chain-resolver configuration derived from this config.
    pub fn resolver_config(&self) -> crate::resolver::ResolverConfig {
        crate::resolver::ResolverConfig {
            max_depth: self.max_wrapper_depth,
            total_timeout: self.total_timeout,
            per_request_timeout: self.per_request_timeout,
            enable_fallbacks: self.enable_fallbacks,
            ..Default::default()
        }
    }

    /// Frequency-cap middleware configuration, when any cap is set.
    pub fn frequency_config(&self) -> Option<crate::middleware::FrequencyCapConfig> {
        if self.hourly_cap.is_none() && self.daily_cap.is_none() && self.weekly_cap.is_none() {
            return None;
        }
        Some(crate::middleware::FrequencyCapConfig {
            hourly_limit: self.hourly_cap,
            daily_limit: self.daily_cap,
            weekly_limit: self.weekly_cap,
            ..Default::default()
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
