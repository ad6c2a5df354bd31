use metrics::{counter, histogram};
use std::time::Instant;

// ── Metric names ────────────────────────────────────────────────────────

/// Upstream requests by upstream key and result (success, error class)
pub const UPSTREAM_REQUESTS: &str = "adgate_upstream_requests_total";
/// Upstream request duration in seconds
pub const UPSTREAM_DURATION: &str = "adgate_upstream_request_duration_seconds";
/// Transport-level errors by kind and status
pub const TRANSPORT_ERRORS: &str = "adgate_transport_errors_total";
/// Chain resolutions by result (success, timeout, depth, cycle, exhausted, malformed)
pub const RESOLUTIONS: &str = "adgate_resolutions_total";
/// Chain resolution duration in seconds
pub const RESOLUTION_DURATION: &str = "adgate_resolution_duration_seconds";
/// Fallback upstream activations during resolution
pub const FALLBACKS: &str = "adgate_fallbacks_total";
/// Middleware cache lookups by outcome (hit, miss, expired)
pub const CACHE_LOOKUPS: &str = "adgate_cache_lookups_total";
/// Tracking beacons by event name and result
pub const BEACONS: &str = "adgate_beacons_total";
/// Requests rejected by frequency caps, labelled by window
pub const CAP_REJECTIONS: &str = "adgate_frequency_cap_rejections_total";
/// Requests rejected by budget checks
pub const BUDGET_REJECTIONS: &str = "adgate_budget_rejections_total";
/// Circuit breaker transitions by upstream key and new state
pub const CIRCUIT_TRANSITIONS: &str = "adgate_circuit_transitions_total";
/// Gateway serve calls by protocol and result
pub const GATEWAY_REQUESTS: &str = "adgate_gateway_requests_total";

// ── Recording helpers ───────────────────────────────────────────────────

/// Record one upstream request outcome
pub fn record_upstream_request(key: &str, result: &str) {
    counter!(UPSTREAM_REQUESTS, "upstream" => key.to_string(), "result" => result.to_string())
        .increment(1);
}

/// Record upstream request duration
pub fn record_upstream_duration(key: &str, start: Instant) {
    histogram!(UPSTREAM_DURATION, "upstream" => key.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// Record a transport-level error
pub fn record_transport_error(kind: &str, status: &str) {
    counter!(TRANSPORT_ERRORS, "kind" => kind.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a chain resolution outcome
pub fn record_resolution(result: &str) {
    counter!(RESOLUTIONS, "result" => result.to_string()).increment(1);
}

/// Record chain resolution duration
pub fn record_resolution_duration(start: Instant) {
    histogram!(RESOLUTION_DURATION).record(start.elapsed().as_secs_f64());
}

/// Record a fallback activation
pub fn record_fallback(upstream: &str) {
    counter!(FALLBACKS, "upstream" => upstream.to_string()).increment(1);
}

/// Record a cache lookup outcome
pub fn record_cache_lookup(outcome: &str) {
    counter!(CACHE_LOOKUPS, "outcome" => outcome.to_string()).increment(1);
}

/// Record a tracking beacon result
pub fn record_beacon(event: &str, result: &str) {
    counter!(BEACONS, "event" => event.to_string(), "result" => result.to_string()).increment(1);
}

/// Record a frequency-cap rejection
pub fn record_cap_rejection(window: &str) {
    counter!(CAP_REJECTIONS, "window" => window.to_string()).increment(1);
}

/// Record a budget rejection
pub fn record_budget_rejection(campaign_id: &str) {
    counter!(BUDGET_REJECTIONS, "campaign" => campaign_id.to_string()).increment(1);
}

/// Record a circuit breaker state transition
pub fn record_circuit_transition(upstream: &str, state: &str) {
    counter!(CIRCUIT_TRANSITIONS, "upstream" => upstream.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Record a gateway serve outcome
pub fn record_gateway_request(protocol: &str, result: &str) {
    counter!(GATEWAY_REQUESTS, "protocol" => protocol.to_string(), "result" => result.to_string())
        .increment(1);
}
