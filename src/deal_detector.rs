//! Deal detector (C8).
//!
//! Grounded line-for-line in
//! `original_source/src/detect/deal_detector.py`: `CATEGORY_THRESHOLDS`,
//! `STORE_ADJUSTMENTS`, `DetectionConfig.for_category`, and
//! `DealDetector.detect_deal`/`_check_strikethrough`/`_check_msrp`/
//! `_calculate_confidence`. The module-level `deal_detector` singleton is
//! replaced with an explicit, stateless detector value per the REDESIGN
//! FLAGS — detection config is passed in rather than carried on `self`.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::domain::{DetectedDeal, DetectionMethod, DiscoveredProduct};

/// Per-category thresholds (spec.md §4.8), ported verbatim from
/// `CATEGORY_THRESHOLDS`.
#[derive(Debug, Clone, Copy)]
pub struct CategoryThresholds {
    pub min_discount_percent: f64,
    pub msrp_threshold: f64,
    pub min_price: f64,
    pub max_price: f64,
}

static CATEGORY_THRESHOLDS: Lazy<HashMap<&'static str, CategoryThresholds>> = Lazy::new(|| {
    HashMap::from([
        ("electronics", CategoryThresholds { min_discount_percent: 35.0, msrp_threshold: 0.65, min_price: 25.0, max_price: 5000.0 }),
        ("computers", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 50.0, max_price: 10000.0 }),
        ("gaming", CategoryThresholds { min_discount_percent: 25.0, msrp_threshold: 0.75, min_price: 15.0, max_price: 3000.0 }),
        ("tv", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 100.0, max_price: 10000.0 }),
        ("deals", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 10.0, max_price: 10000.0 }),
        ("clearance", CategoryThresholds { min_discount_percent: 40.0, msrp_threshold: 0.60, min_price: 5.0, max_price: 10000.0 }),
        ("open-box", CategoryThresholds { min_discount_percent: 20.0, msrp_threshold: 0.80, min_price: 25.0, max_price: 10000.0 }),
        ("rollback", CategoryThresholds { min_discount_percent: 25.0, msrp_threshold: 0.75, min_price: 10.0, max_price: 5000.0 }),
        ("special", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 10.0, max_price: 5000.0 }),
        ("apparel", CategoryThresholds { min_discount_percent: 55.0, msrp_threshold: 0.45, min_price: 10.0, max_price: 1000.0 }),
        ("shoes", CategoryThresholds { min_discount_percent: 50.0, msrp_threshold: 0.50, min_price: 15.0, max_price: 500.0 }),
        ("home", CategoryThresholds { min_discount_percent: 40.0, msrp_threshold: 0.60, min_price: 15.0, max_price: 5000.0 }),
        ("kitchen", CategoryThresholds { min_discount_percent: 40.0, msrp_threshold: 0.60, min_price: 15.0, max_price: 3000.0 }),
        ("appliances", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 50.0, max_price: 10000.0 }),
        ("tools", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 15.0, max_price: 3000.0 }),
        ("power tools", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 25.0, max_price: 2000.0 }),
        ("toys", CategoryThresholds { min_discount_percent: 45.0, msrp_threshold: 0.55, min_price: 10.0, max_price: 500.0 }),
        ("toy", CategoryThresholds { min_discount_percent: 45.0, msrp_threshold: 0.55, min_price: 10.0, max_price: 500.0 }),
        ("videogames", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 10.0, max_price: 500.0 }),
        ("video games", CategoryThresholds { min_discount_percent: 30.0, msrp_threshold: 0.70, min_price: 10.0, max_price: 500.0 }),
        ("default", CategoryThresholds { min_discount_percent: 40.0, msrp_threshold: 0.60, min_price: 1.0, max_price: 10000.0 }),
    ])
});

static STORE_DISCOUNT_MULTIPLIERS: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("homedepot", 0.85),
        ("lowes", 0.85),
        ("costco", 0.75),
        ("bestbuy", 0.90),
        ("newegg", 0.80),
        ("microcenter", 0.75),
        ("gamestop", 0.85),
        ("bhphotovideo", 0.80),
        ("kohls", 1.10),
        ("officedepot", 0.90),
        ("ebay", 0.85),
        ("macys", 1.15),
    ])
});

/// Per-category/store-parameterised detection parameters (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub msrp_threshold: f64,
    pub min_discount_percent: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub category: Option<String>,
    pub store: Option<String>,
}

/// Normalise by lowercase category name with substring fallback, then
/// apply the store's `min_discount_multiplier` if configured.
#[must_use]
pub fn category_table() -> &'static HashMap<&'static str, CategoryThresholds> {
    &CATEGORY_THRESHOLDS
}

/// The store multiplier applied to `min_discount_percent`, or `1.0`.
#[must_use]
pub fn store_multiplier(store: &str) -> f64 {
    STORE_DISCOUNT_MULTIPLIERS.get(store.to_lowercase().as_str()).copied().unwrap_or(1.0)
}

impl DetectionConfig {
    /// `DetectionConfig.for_category` (spec.md §4.8): exact match, then
    /// substring match either direction, then `"default"`.
    #[must_use]
    pub fn for_category(category: &str, store: Option<&str>) -> Self {
        let category_lower = category.to_lowercase();
        let thresholds = CATEGORY_THRESHOLDS.get(category_lower.as_str()).copied().unwrap_or_else(|| {
            CATEGORY_THRESHOLDS
                .iter()
                .find(|(key, _)| category_lower.contains(**key) || key.contains(category_lower.as_str()))
                .map(|(_, v)| *v)
                .unwrap_or(CATEGORY_THRESHOLDS["default"])
        });

        let mut min_discount = thresholds.min_discount_percent;
        if let Some(store) = store {
            min_discount *= store_multiplier(store);
        }

        Self {
            msrp_threshold: thresholds.msrp_threshold,
            min_discount_percent: min_discount,
            min_price: thresholds.min_price,
            max_price: thresholds.max_price,
            category: Some(category.to_string()),
            store: store.map(str::to_string),
        }
    }
}

fn confidence(discount_percent: f64, has_strikethrough: bool, has_msrp: bool) -> f64 {
    let mut confidence = 0.5;

    if (50.0..=70.0).contains(&discount_percent) {
        confidence += 0.2;
    } else if discount_percent > 70.0 && discount_percent <= 85.0 {
        confidence += 0.15;
    } else if discount_percent > 85.0 && discount_percent <= 95.0 {
        confidence += 0.1;
    } else if discount_percent > 95.0 {
        confidence -= 0.1;
    }

    if has_strikethrough {
        confidence += 0.15;
    }
    if has_msrp {
        confidence += 0.1;
    }

    confidence.clamp(0.1, 1.0)
}

fn check_strikethrough(product: &DiscoveredProduct, config: &DetectionConfig, current: f64) -> Option<(f64, f64)> {
    let original = product.original_price?;
    if original <= 0.0 || current >= original {
        return None;
    }
    let discount_percent = (1.0 - current / original) * 100.0;
    if discount_percent >= config.min_discount_percent {
        let conf = confidence(discount_percent, true, product.msrp.is_some());
        Some((discount_percent, conf))
    } else {
        None
    }
}

fn check_msrp(product: &DiscoveredProduct, config: &DetectionConfig, current: f64) -> Option<(f64, f64)> {
    let msrp = product.msrp?;
    if msrp <= 0.0 || current >= msrp {
        return None;
    }
    let discount_percent = (1.0 - current / msrp) * 100.0;
    let ratio = current / msrp;
    if ratio <= config.msrp_threshold {
        let conf = confidence(discount_percent, product.original_price.is_some(), true);
        Some((discount_percent, conf))
    } else {
        None
    }
}

/// Check a single product against a [`DetectionConfig`] (spec.md §4.8).
#[must_use]
pub fn detect_deal(product: &DiscoveredProduct, config: &DetectionConfig) -> Option<DetectedDeal> {
    let current = product.current_price?;
    if current < config.min_price || current > config.max_price {
        return None;
    }

    let strikethrough = check_strikethrough(product, config, current);
    let msrp = check_msrp(product, config, current);

    let mut signals = Vec::new();
    if strikethrough.is_some() {
        signals.push(DetectionMethod::Strikethrough);
    }
    if msrp.is_some() {
        signals.push(DetectionMethod::Msrp);
    }

    let (discount_percent, base_confidence, method) = match (strikethrough, msrp) {
        (Some((d_s, c_s)), Some((d_m, c_m))) => {
            if d_s >= d_m {
                (d_s, c_s, DetectionMethod::Strikethrough)
            } else {
                (d_m, c_m, DetectionMethod::Msrp)
            }
        }
        (Some((d, c)), None) => (d, c, DetectionMethod::Strikethrough),
        (None, Some((d, c))) => (d, c, DetectionMethod::Msrp),
        (None, None) => return None,
    };

    let (final_method, final_confidence) = if signals.len() > 1 {
        (DetectionMethod::Combined, (base_confidence + 0.15).min(1.0))
    } else {
        (method, base_confidence)
    };

    Some(DetectedDeal {
        product: product.clone(),
        discount_percent,
        detection_method: final_method,
        confidence: final_confidence,
        signals,
        category_context: config.category.clone(),
    })
}

/// Detect deals in a batch, sorted by discount percent descending.
#[must_use]
pub fn detect_deals_batch(products: &[DiscoveredProduct], config: &DetectionConfig, min_confidence: f64) -> Vec<DetectedDeal> {
    let mut deals: Vec<DetectedDeal> = products
        .iter()
        .filter_map(|p| detect_deal(p, config))
        .filter(|d| d.confidence >= min_confidence)
        .collect();
    deals.sort_by(|a, b| b.discount_percent.partial_cmp(&a.discount_percent).unwrap_or(std::cmp::Ordering::Equal));
    deals
}

/// `detect_deals_for_category(name)`: selects the `DetectionConfig` via
/// the category table before running.
#[must_use]
pub fn detect_deals_for_category(
    products: &[DiscoveredProduct],
    category_name: &str,
    store: Option<&str>,
    min_confidence: f64,
) -> Vec<DetectedDeal> {
    let config = DetectionConfig::for_category(category_name, store);
    detect_deals_batch(products, &config, min_confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(current: f64, original: Option<f64>, msrp: Option<f64>) -> DiscoveredProduct {
        DiscoveredProduct {
            sku: "B0TEST".into(),
            title: "test product".into(),
            url: "https://example.com/p".into(),
            current_price: Some(current),
            original_price: original,
            msrp,
            store: "amazon_us".into(),
            image_url: None,
            category_id: None,
        }
    }

    /// S1 — Strikethrough deal.
    #[test]
    fn scenario_s1_strikethrough_only() {
        let config = DetectionConfig::for_category("electronics", None);
        let deal = detect_deal(&product(49.99, Some(199.99), None), &config).unwrap();
        assert!((deal.discount_percent - 75.0).abs() < 0.1);
        assert_eq!(deal.detection_method, DetectionMethod::Strikethrough);
        assert!((deal.confidence - 0.80).abs() < 0.01);
        assert!(deal.is_significant());
        assert!(deal.is_price_error());
    }

    /// S2 — MSRP path only.
    #[test]
    fn scenario_s2_msrp_only() {
        let config = DetectionConfig::for_category("electronics", None);
        let deal = detect_deal(&product(60.0, None, Some(100.0)), &config).unwrap();
        assert!((deal.discount_percent - 40.0).abs() < 0.1);
        assert_eq!(deal.detection_method, DetectionMethod::Msrp);
        assert!((deal.confidence - 0.60).abs() < 0.01);
        assert!(deal.is_significant());
    }

    /// S3 — Both signals combine.
    #[test]
    fn scenario_s3_combined_signals() {
        let config = DetectionConfig::for_category("electronics", None);
        let deal = detect_deal(&product(30.0, Some(100.0), Some(120.0)), &config).unwrap();
        assert_eq!(deal.detection_method, DetectionMethod::Combined);
        assert_eq!(deal.signals.len(), 2);
        assert!(deal.is_price_error());
    }

    #[test]
    fn store_multiplier_lowers_min_discount_for_costco() {
        let config = DetectionConfig::for_category("electronics", Some("costco"));
        assert!((config.min_discount_percent - 35.0 * 0.75).abs() < 0.001);
    }

    #[test]
    fn unknown_category_falls_back_to_default() {
        let config = DetectionConfig::for_category("completely-unmapped-xyz", None);
        assert!((config.min_discount_percent - 40.0).abs() < 0.001);
    }

    #[test]
    fn price_outside_bounds_is_skipped() {
        let config = DetectionConfig::for_category("electronics", None);
        assert!(detect_deal(&product(10.0, Some(500.0), None), &config).is_none());
    }

    #[test]
    fn batch_is_sorted_by_discount_descending() {
        let config = DetectionConfig::for_category("electronics", None);
        let products = vec![product(80.0, Some(199.99), None), product(20.0, Some(199.99), None)];
        let deals = detect_deals_batch(&products, &config, 0.0);
        assert!(deals[0].discount_percent >= deals[1].discount_percent);
    }
}
