//! Store health tracker (C2).
//!
//! Grounded in `original_source/src/ingest/store_health.py`: a bounded
//! rolling window of request outcomes per store, with a recommended-delay
//! formula that compounds several multipliers.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::domain::RequestOutcome;

const WINDOW_SIZE: usize = 100;
const ERROR_RATE_THRESHOLD: f64 = 0.3;
const HIGH_LATENCY_MS: u64 = 4000;
const COOLDOWN_WINDOW_SECONDS: i64 = 900;

/// A stable projection of a store's health for the scheduler and operators.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HealthSummary {
    pub store: String,
    pub sample_count: usize,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub last_429_at: Option<DateTime<Utc>>,
    pub last_block_at: Option<DateTime<Utc>>,
    pub is_healthy: bool,
}

#[derive(Default)]
struct Metrics {
    window: VecDeque<RequestOutcome>,
    consecutive_failures: u32,
    last_429_at: Option<DateTime<Utc>>,
    last_block_at: Option<DateTime<Utc>>,
}

impl Metrics {
    fn update_from_recent(&mut self, outcome: &RequestOutcome) {
        self.window.push_back(outcome.clone());
        while self.window.len() > WINDOW_SIZE {
            self.window.pop_front();
        }

        if outcome.success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        if outcome.status_code == Some(429) {
            self.last_429_at = Some(outcome.timestamp);
        }
        if outcome.blocked {
            self.last_block_at = Some(outcome.timestamp);
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|o| !o.success).count();
        failures as f64 / self.window.len() as f64
    }

    fn avg_response_time_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let total: u64 = self.window.iter().map(|o| o.duration_ms).sum();
        total as f64 / self.window.len() as f64
    }
}

/// Adaptive recommended-delay configuration; when `adaptive_enabled` is
/// false, `recommended_delay` always returns `base_delay_seconds`
/// (spec.md §4.2).
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveParams {
    pub adaptive_enabled: bool,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
}

/// Per-site rolling success/latency/block stats (spec.md §4.2).
pub struct StoreHealthTracker {
    stores: RwLock<HashMap<String, Metrics>>,
    params: AdaptiveParams,
}

impl StoreHealthTracker {
    #[must_use]
    pub fn new(params: AdaptiveParams) -> Self {
        Self { stores: RwLock::new(HashMap::new()), params }
    }

    /// Append an outcome to the store's rolling window and update counters.
    pub fn record(&self, store: &str, outcome: RequestOutcome) {
        let mut stores = self.stores.write().expect("store_health lock poisoned");
        stores.entry(store.to_string()).or_default().update_from_recent(&outcome);
    }

    /// `recommended_delay(store) → seconds` per spec.md §4.2's compounding
    /// multiplier chain.
    #[must_use]
    pub fn recommended_delay(&self, store: &str) -> f64 {
        let base = self.params.base_delay_seconds;
        if !self.params.adaptive_enabled {
            return base;
        }

        let stores = self.stores.read().expect("store_health lock poisoned");
        let Some(metrics) = stores.get(store) else {
            return base;
        };

        let mut delay = base;

        let error_rate = metrics.error_rate();
        if error_rate > ERROR_RATE_THRESHOLD {
            delay *= 1.0 + 2.0 * error_rate;
        }

        let now = Utc::now();
        if let Some(last_429) = metrics.last_429_at {
            let age = (now - last_429).num_seconds().max(0);
            if age < COOLDOWN_WINDOW_SECONDS {
                let fraction = age as f64 / COOLDOWN_WINDOW_SECONDS as f64;
                delay *= 1.0 + 3.0 * (1.0 - fraction);
            }
        }

        if let Some(last_block) = metrics.last_block_at {
            let age = (now - last_block).num_seconds().max(0);
            if age < COOLDOWN_WINDOW_SECONDS {
                let fraction = age as f64 / COOLDOWN_WINDOW_SECONDS as f64;
                delay *= 1.0 + 3.0 * (1.0 - fraction);
            }
        }

        if metrics.avg_response_time_ms() > HIGH_LATENCY_MS as f64 {
            delay *= 1.5;
        }

        let failure_multiplier = (1.0 + 0.5 * f64::from(metrics.consecutive_failures)).min(5.0);
        delay *= failure_multiplier;

        delay.min(self.params.max_delay_seconds)
    }

    /// `is_healthy(store)`: false if `consecutive_failures ≥ 10` or
    /// `error_rate > 0.8` (spec.md §4.2).
    #[must_use]
    pub fn is_healthy(&self, store: &str) -> bool {
        let stores = self.stores.read().expect("store_health lock poisoned");
        match stores.get(store) {
            Some(metrics) => metrics.consecutive_failures < 10 && metrics.error_rate() <= 0.8,
            None => true,
        }
    }

    /// Stable health projection for C11 and operators.
    #[must_use]
    pub fn health_summary(&self, store: &str) -> HealthSummary {
        let stores = self.stores.read().expect("store_health lock poisoned");
        match stores.get(store) {
            Some(metrics) => HealthSummary {
                store: store.to_string(),
                sample_count: metrics.window.len(),
                error_rate: metrics.error_rate(),
                avg_response_time_ms: metrics.avg_response_time_ms(),
                consecutive_failures: metrics.consecutive_failures,
                last_429_at: metrics.last_429_at,
                last_block_at: metrics.last_block_at,
                is_healthy: metrics.consecutive_failures < 10 && metrics.error_rate() <= 0.8,
            },
            None => HealthSummary { store: store.to_string(), is_healthy: true, ..Default::default() },
        }
    }

    /// Clear all recorded state for a store.
    pub fn reset_store(&self, store: &str) {
        let mut stores = self.stores.write().expect("store_health lock poisoned");
        stores.remove(store);
    }
}

fn outcome(success: bool, status: Option<u16>, blocked: bool, duration_ms: u64) -> RequestOutcome {
    RequestOutcome { timestamp: Utc::now(), success, duration_ms, status_code: status, blocked, block_type: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AdaptiveParams {
        AdaptiveParams { adaptive_enabled: true, base_delay_seconds: 2.0, max_delay_seconds: 120.0 }
    }

    #[test]
    fn unhealthy_after_ten_consecutive_failures() {
        let tracker = StoreHealthTracker::new(params());
        for _ in 0..10 {
            tracker.record("target_store", outcome(false, Some(500), false, 100));
        }
        assert!(!tracker.is_healthy("target_store"));
    }

    #[test]
    fn healthy_store_with_no_history() {
        let tracker = StoreHealthTracker::new(params());
        assert!(tracker.is_healthy("never_seen"));
        assert_eq!(tracker.recommended_delay("never_seen"), 2.0);
    }

    #[test]
    fn recommended_delay_compounds_with_recent_429() {
        let tracker = StoreHealthTracker::new(params());
        tracker.record("best_buy", outcome(false, Some(429), false, 200));
        let delay = tracker.recommended_delay("best_buy");
        assert!(delay > params().base_delay_seconds);
        assert!(delay <= params().max_delay_seconds);
    }

    #[test]
    fn recommended_delay_is_constant_when_adaptive_disabled() {
        let p = AdaptiveParams { adaptive_enabled: false, base_delay_seconds: 3.0, max_delay_seconds: 60.0 };
        let tracker = StoreHealthTracker::new(p);
        for _ in 0..20 {
            tracker.record("amazon_us", outcome(false, Some(500), false, 9000));
        }
        assert_eq!(tracker.recommended_delay("amazon_us"), 3.0);
    }

    #[test]
    fn window_is_bounded_at_100_entries() {
        let tracker = StoreHealthTracker::new(params());
        for _ in 0..150 {
            tracker.record("walmart", outcome(true, Some(200), false, 50));
        }
        let summary = tracker.health_summary("walmart");
        assert_eq!(summary.sample_count, 100);
    }
}
