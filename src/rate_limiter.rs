//! Per-host rate limiter (C1).
//!
//! Grounded in `original_source/src/ingest/rate_limiter.py`'s
//! `acquire_with_interval`/`acquire`/`set_cooldown`/`wait_for_backoff`, and
//! in the teacher's `governor`-based token bucket in `http_client.rs`. Keyed
//! per host; distinct hosts never block each other because each host gets
//! its own `Mutex`-guarded bucket behind a `DashMap`-style sharded map
//! (here, a single `Mutex<HashMap>` guarding bucket state, with the actual
//! wait happening outside any lock).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

/// One host's rate-limiter state.
#[derive(Debug, Clone)]
struct Bucket {
    last_release: Option<Instant>,
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

impl Bucket {
    fn new() -> Self {
        Self { last_release: None, tokens: 0.0, last_refill: Instant::now(), cooldown_until: None }
    }
}

/// Per-host pacing with jitter and cooldown (spec.md §4.1).
///
/// Each host is guarded independently; a lock on host A's bucket state is
/// held only long enough to compute the wait duration, never across the
/// `sleep` itself, so concurrent callers for distinct hosts never block
/// each other and concurrent callers for the *same* host serialise
/// correctly through the per-host `Mutex`.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self { buckets: Mutex::new(HashMap::new()) }
    }

    async fn bucket_for(&self, host: &str) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new())))
            .clone()
    }

    /// Interval mode: wait until `elapsed_since_last_release ≥
    /// uniform(min_s, max_s) ± uniform(-jitter_s, jitter_s)`, honouring any
    /// active cooldown first (spec.md §4.1).
    pub async fn acquire_with_interval(&self, host: &str, min_s: f64, max_s: f64, jitter_s: f64) {
        let bucket = self.bucket_for(host).await;
        let mut guard = bucket.lock().await;

        if let Some(until) = guard.cooldown_until {
            let now = Instant::now();
            if now < until {
                let wait = until - now;
                drop(guard);
                sleep(wait).await;
                guard = bucket.lock().await;
            }
        }

        let now = Instant::now();
        let elapsed = guard.last_release.map_or(Duration::from_secs(u64::MAX), |t| now - t);

        let base = uniform(min_s, max_s);
        let jittered = if jitter_s > 0.0 {
            (base + uniform(-jitter_s, jitter_s)).max(min_s)
        } else {
            base
        };
        let interval = Duration::from_secs_f64(jittered.max(0.0));

        let wait_needed = interval.saturating_sub(elapsed);
        if !wait_needed.is_zero() {
            drop(guard);
            sleep(wait_needed).await;
            guard = bucket.lock().await;
        }

        guard.last_release = Some(Instant::now());
    }

    /// Token-bucket mode: classical refill-and-consume; a caller short on
    /// tokens sleeps for `(1 − tokens)/rps` (spec.md §4.1).
    pub async fn acquire_token_bucket(&self, host: &str, rps: f64, burst: u32) {
        let bucket = self.bucket_for(host).await;
        let mut guard = bucket.lock().await;

        let now = Instant::now();
        let elapsed = (now - guard.last_refill).as_secs_f64();
        guard.tokens = (guard.tokens + elapsed * rps).min(f64::from(burst.max(1)));
        guard.last_refill = now;

        if guard.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - guard.tokens) / rps);
            guard.tokens = 0.0;
            drop(guard);
            sleep(wait).await;
        } else {
            guard.tokens -= 1.0;
        }
    }

    /// Set a host cooldown until `now + seconds`, enforced by the next
    /// `acquire_*` call (spec.md §4.1, set externally e.g. by C2 after a 429).
    pub async fn set_cooldown(&self, host: &str, seconds: f64) {
        let bucket = self.bucket_for(host).await;
        let mut guard = bucket.lock().await;
        guard.cooldown_until = Some(Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));
    }

    /// Wait with exponential backoff after a failed request.
    pub async fn wait_for_backoff(&self, attempt: u32, multiplier: f64, max_seconds: f64) {
        let wait = multiplier.powi((attempt.max(1) - 1) as i32).min(max_seconds);
        sleep(Duration::from_secs_f64(wait.max(0.0))).await;
    }
}

fn uniform(min: f64, max: f64) -> f64 {
    if max <= min {
        return min;
    }
    min + fastrand::f64() * (max - min)
}
