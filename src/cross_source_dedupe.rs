//! Cross-source deduper (C12).
//!
//! Grounded in `original_source/src/notify/cross_source_dedupe.py`:
//! ASIN normalisation, a short-TTL KV record keyed by the normalised sku,
//! and the notify/suppress decision table.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::http_cache::KvStore;

static ASIN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{10}$").unwrap());
static ASIN_PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(?:dp|product|gp/product)/([A-Za-z0-9]{10})").unwrap());

/// Whether C12 permits the alert (`Notify`) or drops it (`Suppress`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossSourceDecision {
    Notify,
    Suppress,
}

fn normalize_key(sku: &str, url: &str) -> String {
    if ASIN_PATTERN.is_match(sku) {
        return format!("asin:{}", sku.to_uppercase());
    }
    if let Some(caps) = ASIN_PATH_PATTERN.captures(url) {
        return format!("asin:{}", caps[1].to_uppercase());
    }
    format!("sku:{sku}")
}

fn kv_key(normalized: &str) -> String {
    format!("crosssource:{normalized}")
}

/// Collapses the same product seen via multiple aggregators to the best
/// price (spec.md §4.12). Only activates for a configured set of
/// aggregator stores — callers are expected to check membership before
/// calling [`CrossSourceDeduper::check`].
pub struct CrossSourceDeduper {
    kv: Arc<dyn KvStore>,
    ttl_seconds: i64,
}

impl CrossSourceDeduper {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, ttl_seconds: i64) -> Self {
        Self { kv, ttl_seconds }
    }

    /// `(sku, store, price, url) → decision` per spec.md §4.12.
    pub async fn check(&self, sku: &str, store: &str, price: f64, url: &str) -> anyhow::Result<CrossSourceDecision> {
        let normalized = normalize_key(sku, url);
        let key = kv_key(&normalized);

        let Some(raw) = self.kv.get(&key).await? else {
            self.record(&key, store, price).await?;
            return Ok(CrossSourceDecision::Notify);
        };

        let record = String::from_utf8_lossy(&raw).to_string();
        let Some((old_store, old_price_str)) = record.split_once(':') else {
            self.record(&key, store, price).await?;
            return Ok(CrossSourceDecision::Notify);
        };
        let old_price: f64 = old_price_str.parse().unwrap_or(f64::MAX);

        if price < old_price {
            self.record(&key, store, price).await?;
            Ok(CrossSourceDecision::Notify)
        } else if (price - old_price).abs() < f64::EPSILON && store != old_store {
            Ok(CrossSourceDecision::Suppress)
        } else {
            Ok(CrossSourceDecision::Suppress)
        }
    }

    async fn record(&self, key: &str, store: &str, price: f64) -> anyhow::Result<()> {
        self.kv.set_ex(key, format!("{store}:{price}").into_bytes(), self.ttl_seconds).await
    }

    /// Drop the cross-source record for a product (e.g. after a long idle window).
    pub async fn clear_product(&self, sku: &str, url: &str) -> anyhow::Result<()> {
        let normalized = normalize_key(sku, url);
        self.kv.del(&kv_key(&normalized)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct InMemoryKv(Mutex<HashMap<String, Vec<u8>>>);
    impl InMemoryKv {
        fn new() -> Self {
            Self(Mutex::new(HashMap::new()))
        }
    }
    #[async_trait]
    impl KvStore for InMemoryKv {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.0.lock().await.get(key).cloned())
        }
        async fn set_ex(&self, key: &str, value: Vec<u8>, _ttl: i64) -> anyhow::Result<()> {
            self.0.lock().await.insert(key.to_string(), value);
            Ok(())
        }
        async fn del(&self, key: &str) -> anyhow::Result<()> {
            self.0.lock().await.remove(key);
            Ok(())
        }
        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            Ok(self.0.lock().await.contains_key(key))
        }
        async fn ttl(&self, _key: &str) -> anyhow::Result<Option<i64>> {
            Ok(None)
        }
    }

    #[test]
    fn normalizes_asin_shaped_sku() {
        assert_eq!(normalize_key("B09AAA1234", "https://x.example/item"), "asin:B09AAA1234");
    }

    #[test]
    fn normalizes_asin_from_url_path() {
        assert_eq!(normalize_key("sku-local", "https://amazon.com/dp/B09AAA1234/ref=xyz"), "asin:B09AAA1234");
    }

    #[test]
    fn falls_back_to_raw_sku() {
        assert_eq!(normalize_key("local-sku-1", "https://store.example/p/1"), "sku:local-sku-1");
    }

    /// S6 — Cross-source suppression scenario.
    #[tokio::test]
    async fn scenario_s6_cross_source_suppression() {
        let deduper = CrossSourceDeduper::new(Arc::new(InMemoryKv::new()), 600);

        let d1 = deduper.check("B09AAA", "slickdeals", 29.99, "https://slickdeals.net/x").await.unwrap();
        assert_eq!(d1, CrossSourceDecision::Notify);

        let d2 = deduper.check("B09AAA", "saveyourdeals", 29.99, "https://saveyourdeals.com/x").await.unwrap();
        assert_eq!(d2, CrossSourceDecision::Suppress);

        let d3 = deduper.check("B09AAA", "woot", 24.99, "https://woot.com/x").await.unwrap();
        assert_eq!(d3, CrossSourceDecision::Notify);
    }
}
