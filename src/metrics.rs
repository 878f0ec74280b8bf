//! Metrics (C14).
//!
//! Uses the `metrics` facade the same way [`crate::logging`] uses
//! `tracing`: call sites record through free functions, and a process-wide
//! recorder is installed once in `main`. Names are illustrative per
//! spec.md §4.14 — callers should not depend on exact label sets beyond
//! what is documented here.

use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install a Prometheus recorder and return a handle whose `render()`
/// produces the text-exposition payload for a `/metrics` endpoint.
pub fn install() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("failed to install prometheus recorder: {e}"))
}

/// A scan attempt was made against `store` for `category`, succeeding or not.
pub fn record_scan_attempt(store: &str, category: &str, success: bool) {
    metrics::counter!("scan_attempts_total", "store" => store.to_string(), "category" => category.to_string(), "success" => success.to_string()).increment(1);
}

/// Record the wall-clock duration of a category scan.
pub fn record_scan_duration(store: &str, seconds: f64) {
    metrics::histogram!("scan_duration_seconds", "store" => store.to_string()).record(seconds);
}

/// Record how many products a category scan discovered.
pub fn record_products_discovered(store: &str, count: u64) {
    metrics::counter!("products_discovered_total", "store" => store.to_string()).increment(count);
}

/// Record a detected deal by its confidence tier (`"high"` ≥ 0.8, `"medium"` ≥ 0.6, else `"low"`).
pub fn record_deal_detected(store: &str, confidence: f64) {
    let tier = if confidence >= 0.8 {
        "high"
    } else if confidence >= 0.6 {
        "medium"
    } else {
        "low"
    };
    metrics::counter!("deals_detected_total", "store" => store.to_string(), "tier" => tier).increment(1);
}

/// Record an HTTP response by status code.
pub fn record_http_status(store: &str, status: u16) {
    metrics::counter!("http_responses_total", "store" => store.to_string(), "status" => status.to_string()).increment(1);
}

/// Record a scan block classified by `block_type` (e.g. `"bot_challenge"`, `"url_blocked"`).
pub fn record_block(store: &str, block_type: &str) {
    metrics::counter!("scan_blocks_total", "store" => store.to_string(), "block_type" => block_type.to_string()).increment(1);
}

/// Record an HTTP cache lookup outcome.
pub fn record_cache_result(hit: bool) {
    metrics::counter!("http_cache_total", "result" => if hit { "hit" } else { "miss" }).increment(1);
}

/// Record a delta-detector verdict.
pub fn record_delta_result(changed: bool) {
    metrics::counter!("delta_results_total", "result" => if changed { "changed" } else { "skip" }).increment(1);
}

/// Record a proxy receiving an HTTP 403.
pub fn record_proxy_403(proxy_host: &str) {
    metrics::counter!("proxy_403_total", "proxy" => proxy_host.to_string()).increment(1);
}

/// Update the consecutive-403-strike gauge for a proxy.
pub fn set_proxy_strike_gauge(proxy_host: &str, strikes: u32) {
    metrics::gauge!("proxy_consecutive_strikes", "proxy" => proxy_host.to_string()).set(f64::from(strikes));
}

/// Update the rolling error-rate gauge for a store (spec.md §4.2).
pub fn set_store_error_rate(store: &str, error_rate: f64) {
    metrics::gauge!("store_error_rate", "store" => store.to_string()).set(error_rate);
}

/// Update the recommended-delay gauge for a store (spec.md §4.2).
pub fn set_recommended_delay(store: &str, delay_ms: u64) {
    metrics::gauge!("store_recommended_delay_ms", "store" => store.to_string()).set(delay_ms as f64);
}

/// Track the number of currently-running category scans.
pub fn set_active_scans(count: i64) {
    metrics::gauge!("active_scans").set(count as f64);
}

/// Record a fetch-strategy attempt (`"direct"`, `"headless"`, …) and whether
/// it was a fallback from a previous strategy.
pub fn record_fetch_strategy(strategy: &str, success: bool, fallback: bool) {
    metrics::counter!(
        "fetch_strategy_attempts_total",
        "strategy" => strategy.to_string(),
        "success" => success.to_string(),
        "fallback" => fallback.to_string(),
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::with_local_recorder;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn scan_attempt_increments_counter() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        with_local_recorder(&recorder, || {
            record_scan_attempt("walmart", "electronics", true);
        });
        let snapshot = snapshotter.snapshot().into_vec();
        let found = snapshot.iter().any(|(key, _, _, value)| {
            key.key().name() == "scan_attempts_total" && matches!(value, DebugValue::Counter(1))
        });
        assert!(found, "expected a scan_attempts_total counter entry");
    }

    #[test]
    fn deal_tier_thresholds() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        with_local_recorder(&recorder, || {
            record_deal_detected("amazon_us", 0.85);
        });
        let snapshot = snapshotter.snapshot().into_vec();
        let found = snapshot.iter().any(|(key, _, _, _)| {
            key.key().name() == "deals_detected_total"
                && key.key().labels().any(|l| l.key() == "tier" && l.value() == "high")
        });
        assert!(found, "expected a high-tier deal counter entry");
    }
}
