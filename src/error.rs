use thiserror::Error;

/// Domain-specific error taxonomy for the gateway.
///
/// Every layer reports failures through these tagged variants so that
/// middleware can recover exactly the errors it understands and pass the
/// rest through unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    // ── Transport ───────────────────────────────────────────────────────
    #[error("Upstream request timed out")]
    TransportTimeout,

    #[error("Upstream unreachable: {0}")]
    TransportUnreachable(String),

    #[error("Upstream protocol error (status {status})")]
    TransportProtocolError { status: u16 },

    #[error("Request canceled")]
    Canceled,

    // ── Upstream ────────────────────────────────────────────────────────
    #[error("Failed to decode upstream response: {0}")]
    DecodeError(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    // ── VAST protocol ───────────────────────────────────────────────────
    #[error("Malformed VAST document: {0}")]
    VastMalformed(String),

    #[error("VAST version mismatch: parser expects {expected}, document is {found}")]
    VastVersionMismatch { expected: String, found: String },

    // ── Chain resolver ──────────────────────────────────────────────────
    #[error("VAST wrapper chain exceeded max depth {0}")]
    WrapperDepthExceeded(u32),

    #[error("VAST wrapper chain cycle at {0}")]
    WrapperCycle(String),

    #[error("Chain resolution exceeded total timeout")]
    ChainTimeout,

    #[error("All upstreams exhausted during chain resolution")]
    ChainUpstreamExhausted,

    // ── Middleware ──────────────────────────────────────────────────────
    #[error("Circuit breaker open for upstream {0}")]
    CircuitOpen(String),

    #[error("Frequency cap exceeded ({which})")]
    FrequencyCapExceeded { which: String },

    #[error("Budget exceeded for campaign {campaign_id}")]
    BudgetExceeded { campaign_id: String },

    // ── State backend ───────────────────────────────────────────────────
    #[error("State backend error: {0}")]
    StateBackendError(String),

    // ── Gateway ─────────────────────────────────────────────────────────
    #[error("No handler registered for protocol {0}")]
    NoHandler(String),

    #[error("Invalid ad request: {0}")]
    InvalidAdRequest(String),
}

impl GatewayError {
    /// Stable tag used as the `error_code` on failed [`crate::types::AdResponse`]s.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::TransportTimeout => "TransportTimeout",
            GatewayError::TransportUnreachable(_) => "TransportUnreachable",
            GatewayError::TransportProtocolError { .. } => "TransportProtocolError",
            GatewayError::Canceled => "Canceled",
            GatewayError::DecodeError(_) => "DecodeError",
            GatewayError::UpstreamError(_) => "UpstreamError",
            GatewayError::VastMalformed(_) => "VastMalformed",
            GatewayError::VastVersionMismatch { .. } => "VastVersionMismatch",
            GatewayError::WrapperDepthExceeded(_) => "WrapperDepthExceeded",
            GatewayError::WrapperCycle(_) => "WrapperCycle",
            GatewayError::ChainTimeout => "ChainTimeout",
            GatewayError::ChainUpstreamExhausted => "ChainUpstreamExhausted",
            GatewayError::CircuitOpen(_) => "CircuitOpen",
            GatewayError::FrequencyCapExceeded { .. } => "FrequencyCapExceeded",
            GatewayError::BudgetExceeded { .. } => "BudgetExceeded",
            GatewayError::StateBackendError(_) => "StateBackendError",
            GatewayError::NoHandler(_) => "NoHandler",
            GatewayError::InvalidAdRequest(_) => "InvalidAdRequest",
        }
    }

    /// Returns `true` if the error is eligible for retry.
    ///
    /// Timeouts, unreachable upstreams and 5xx responses are transient.
    /// Protocol violations, policy rejections and cancellation are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            GatewayError::TransportTimeout | GatewayError::TransportUnreachable(_) => true,
            GatewayError::TransportProtocolError { status } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` for errors that reflect upstream health rather than
    /// gateway policy. Only these count against a circuit breaker.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::TransportTimeout
                | GatewayError::TransportUnreachable(_)
                | GatewayError::TransportProtocolError { .. }
                | GatewayError::DecodeError(_)
                | GatewayError::UpstreamError(_)
        )
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, GatewayError>;
