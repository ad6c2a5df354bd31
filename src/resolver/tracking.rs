use crate::metrics;
use crate::session::SessionContext;
use crate::vast::macros::{MacroContext, MacroRegistry};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a single beacon request; a slow tracker cannot outlive
/// the process gracelessly.
const BEACON_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire a tracking beacon (fire-and-forget).
///
/// Spawns a background task and does not block the caller. No retries,
/// best effort as per VAST. Failures are logged, never raised.
pub fn fire_beacon(client: Client, url: String, event_name: String) {
    tokio::spawn(async move {
        match client.get(&url).timeout(BEACON_TIMEOUT).send().await {
            Ok(resp) => {
                debug!("Tracking beacon: {} -> {} ({})", event_name, url, resp.status());
                metrics::record_beacon(&event_name, "success");
            }
            Err(e) => {
                warn!("Tracking beacon failed: {} ({})", event_name, e);
                metrics::record_beacon(&event_name, "error");
            }
        }
    });
}

/// Fire impression beacons accumulated across a resolved chain.
pub fn fire_impressions(client: &Client, impression_urls: &[String]) {
    for url in impression_urls {
        fire_beacon(client.clone(), url.clone(), "impression".to_string());
    }
}

/// Fire accumulated error beacons with `[ERRORCODE]` substituted.
pub fn fire_error_urls(
    client: &Client,
    error_urls: &[String],
    code: u32,
    session: &SessionContext,
    registry: &MacroRegistry,
) {
    let ctx = MacroContext::error_code(code);
    for url in error_urls {
        let substituted = registry.substitute(url, session, &ctx);
        fire_beacon(client.clone(), substituted, "error".to_string());
    }
}

/// Determine which quartile events fire for a playback progress step.
///
/// Threshold crossing: an event fires on the first step whose progress
/// crosses the quartile boundary, so all events fire even for coarse
/// progress reports. `prev` below zero means "no previous report".
pub fn events_for_progress(prev: f64, progress: f64) -> Vec<&'static str> {
    let mut events = Vec::new();
    if prev < 0.0 && progress >= 0.0 {
        events.push("start");
    }
    if progress >= 0.25 && prev < 0.25 {
        events.push("firstQuartile");
    }
    if progress >= 0.50 && prev < 0.50 {
        events.push("midpoint");
    }
    if progress >= 0.75 && prev < 0.75 {
        events.push("thirdQuartile");
    }
    if progress >= 1.0 && prev < 1.0 {
        events.push("complete");
    }
    events
}
