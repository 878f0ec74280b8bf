//! Category scheduler (C11).
//!
//! Grounded in `original_source/src/schedule/scheduler.py`'s tick-based
//! `effective_interval`/priority-score design; generalised from the
//! teacher's `crawling`/timer-driven orchestration style. Invoked by an
//! external timer every `scheduler_interval_minutes` (spec.md §4.11).

use chrono::{DateTime, Utc};

use crate::domain::Category;
use crate::error::CooldownReason;
use crate::store_health::StoreHealthTracker;

/// Multipliers `effective_interval` composes, tunable separately from the
/// fixed ratios spec.md §4.11 hard-codes for priority/name buckets.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerParams {
    pub no_deals_penalty: f64,
    pub success_rate_boost: f64,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self { no_deals_penalty: 1.5, success_rate_boost: 0.7 }
    }
}

fn priority_multiplier(priority: i32) -> f64 {
    if priority >= 8 {
        1.0
    } else if priority >= 5 {
        1.5
    } else {
        2.0
    }
}

fn yield_adjust(deals_found: i64, last_scanned: Option<DateTime<Utc>>, params: &SchedulerParams) -> f64 {
    if deals_found == 0 && last_scanned.is_some() {
        params.no_deals_penalty
    } else if deals_found >= 5 {
        params.success_rate_boost
    } else {
        1.0
    }
}

fn domain_adjust(name: &str) -> f64 {
    let lowered = name.to_lowercase();
    if lowered.contains("new") || lowered.contains("arrival") {
        0.5
    } else if ["flash", "lightning", "deal", "sale", "clearance"].iter().any(|kw| lowered.contains(kw)) {
        0.7
    } else {
        1.0
    }
}

/// `effective_interval(c)` per spec.md §4.11 step 2, clamped to at least
/// `base_interval` and at least one minute.
#[must_use]
pub fn effective_interval(category: &Category, health: &StoreHealthTracker, params: &SchedulerParams) -> chrono::Duration {
    let base = category.base_scan_interval_minutes.max(1) as f64;

    let mut minutes = base;
    minutes *= priority_multiplier(category.priority);
    minutes *= yield_adjust(category.deals_found, category.last_scanned_at, params);
    if !health.is_healthy(&category.store) {
        minutes *= 1.5;
    }
    minutes *= domain_adjust(&category.name);

    let clamped = minutes.max(base).max(1.0);
    chrono::Duration::minutes(clamped.round() as i64)
}

/// `a category is due iff last_scanned == null ∨ now ≥ last_scanned +
/// effective_interval` (spec.md §4.11 step 3).
#[must_use]
pub fn is_due(category: &Category, now: DateTime<Utc>, health: &StoreHealthTracker, params: &SchedulerParams) -> bool {
    match category.last_scanned_at {
        None => true,
        Some(last) => now >= last + effective_interval(category, health, params),
    }
}

/// Skip a due category whose `last_error` maps to an active cooldown
/// (spec.md §4.11 step 4).
#[must_use]
pub fn is_cooling_down(category: &Category, now: DateTime<Utc>) -> bool {
    let (Some(last_error), Some(last_error_at)) = (&category.last_error, category.last_error_at) else {
        return false;
    };
    let Some(reason) = CooldownReason::classify(last_error) else {
        return false;
    };
    let cooldown = chrono::Duration::from_std(reason.default_cooldown()).unwrap_or(chrono::Duration::zero());
    now < last_error_at + cooldown
}

/// Priority score combining base priority, yield/value bonuses, and a
/// recency penalty (spec.md §4.11 step 5). Higher sorts first.
#[must_use]
pub fn priority_score(category: &Category, now: DateTime<Utc>) -> f64 {
    let mut score = f64::from(category.priority);

    if category.deals_found >= 5 {
        score += 2.0;
    } else if category.deals_found > 0 {
        score += 1.0;
    }

    let lowered = category.name.to_lowercase();
    if ["electronic", "laptop", "tv", "phone", "tablet"].iter().any(|kw| lowered.contains(kw)) {
        score += 1.5;
    }

    if let Some(last_error_at) = category.last_error_at {
        let age = now - last_error_at;
        if age <= chrono::Duration::hours(1) {
            score -= 2.0;
        } else if age <= chrono::Duration::hours(6) {
            score -= 1.0;
        }
    }

    score
}

/// Select and order the categories due for a scan this tick (spec.md §4.11
/// steps 1-5). Takes already-loaded enabled categories; loading from
/// storage is the caller's responsibility (C18/C19 wiring).
#[must_use]
pub fn select_due_categories(
    categories: Vec<Category>,
    now: DateTime<Utc>,
    health: &StoreHealthTracker,
    params: &SchedulerParams,
) -> Vec<Category> {
    let mut due: Vec<Category> = categories
        .into_iter()
        .filter(|c| c.enabled)
        .filter(|c| is_due(c, now, health, params))
        .filter(|c| !is_cooling_down(c, now))
        .collect();

    due.sort_by(|a, b| {
        priority_score(b, now).partial_cmp(&priority_score(a, now)).unwrap_or(std::cmp::Ordering::Equal)
    });
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Id;
    use crate::store_health::AdaptiveParams;

    fn category() -> Category {
        Category {
            id: Id::new(),
            store: "walmart".into(),
            name: "gadgets".into(),
            url: "https://example.com".into(),
            enabled: true,
            priority: 5,
            base_scan_interval_minutes: 30,
            max_pages: 3,
            keyword_include: None,
            keyword_exclude: None,
            brand_include: None,
            brand_exclude: None,
            min_price: None,
            max_price: None,
            min_discount_percent: None,
            last_scanned_at: None,
            last_error: None,
            last_error_at: None,
            products_found: 0,
            deals_found: 0,
        }
    }

    fn health() -> StoreHealthTracker {
        StoreHealthTracker::new(AdaptiveParams { adaptive_enabled: true, base_delay_seconds: 2.0, max_delay_seconds: 60.0 })
    }

    #[test]
    fn never_scanned_category_is_always_due() {
        let cat = category();
        assert!(is_due(&cat, Utc::now(), &health(), &SchedulerParams::default()));
    }

    #[test]
    fn priority_and_yield_multipliers_compound() {
        let mut cat = category();
        cat.priority = 3;
        cat.deals_found = 0;
        cat.last_scanned_at = Some(Utc::now());
        let interval = effective_interval(&cat, &health(), &SchedulerParams::default());
        // base 30 * priority(<5 -> 2.0) * no_deals_penalty(1.5) = 90 minutes
        assert_eq!(interval, chrono::Duration::minutes(90));
    }

    #[test]
    fn flash_sale_name_multiplier_is_clamped_to_base_interval() {
        let mut cat = category();
        cat.name = "Flash Deals".into();
        cat.priority = 10;
        let interval = effective_interval(&cat, &health(), &SchedulerParams::default());
        // base 30 * priority(>=8 -> 1.0) * yield(1.0, never scanned) * domain(0.7) = 21,
        // clamped back up to the base interval of 30 by the `minutes.max(base)` floor.
        assert_eq!(interval, chrono::Duration::minutes(30));
    }

    #[test]
    fn cooldown_skips_recently_blocked_category() {
        let mut cat = category();
        cat.last_error = Some("HTTP 403 Forbidden".into());
        cat.last_error_at = Some(Utc::now());
        assert!(is_cooling_down(&cat, Utc::now()));
        assert!(!is_cooling_down(&cat, Utc::now() + chrono::Duration::hours(9)));
    }

    #[test]
    fn priority_score_orders_high_yield_above_recent_errors() {
        let now = Utc::now();
        let mut strong = category();
        strong.deals_found = 6;

        let mut weak = category();
        weak.last_error_at = Some(now - chrono::Duration::minutes(10));
        weak.last_error = Some("transient scrape hiccup".into());

        let ordered = select_due_categories(vec![weak, strong], now, &health(), &SchedulerParams::default());
        assert_eq!(ordered[0].deals_found, 6);
    }
}
