//! Delta detector (C9).
//!
//! Suppresses products unchanged since last scan (spec.md §4.9), backed by
//! the key-value contract from [`crate::http_cache::KvStore`].

use std::sync::Arc;

use crate::domain::DiscoveredProduct;
use crate::http_cache::KvStore;

fn price_hash(product: &DiscoveredProduct) -> String {
    let current = product.current_price.map_or_else(|| "0".to_string(), |p| format!("{p:.4}"));
    let original = product.original_price.map_or_else(|| "0".to_string(), |p| format!("{p:.4}"));
    let input = format!("{}:{}:{}", product.sku, current, original);
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

fn kv_key(store: &str, sku: &str) -> String {
    format!("delta:{store}:{sku}")
}

/// Suppresses products whose `(sku, current_price, original_price)` hash
/// is unchanged since last scan (spec.md §4.9). When `enabled` is false,
/// everything passes through unchanged.
pub struct DeltaDetector {
    kv: Arc<dyn KvStore>,
    ttl_seconds: i64,
    enabled: bool,
}

impl DeltaDetector {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, ttl_seconds: i64, enabled: bool) -> Self {
        Self { kv, ttl_seconds, enabled }
    }

    /// `has_changed(product, store)`: true if no prior hash is stored.
    pub async fn has_changed(&self, product: &DiscoveredProduct, store: &str) -> anyhow::Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let key = kv_key(store, &product.sku);
        match self.kv.get(&key).await? {
            Some(prior) => Ok(prior != price_hash(product).into_bytes()),
            None => Ok(true),
        }
    }

    /// `filter_changed(list, store)`: only products whose hash differs.
    pub async fn filter_changed(
        &self,
        products: Vec<DiscoveredProduct>,
        store: &str,
    ) -> anyhow::Result<Vec<DiscoveredProduct>> {
        if !self.enabled {
            return Ok(products);
        }
        let mut changed = Vec::with_capacity(products.len());
        for product in products {
            if self.has_changed(&product, store).await? {
                changed.push(product);
            }
        }
        Ok(changed)
    }

    /// `mark_seen(list, store)`: write current hashes with TTL.
    pub async fn mark_seen(&self, products: &[DiscoveredProduct], store: &str) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        for product in products {
            let key = kv_key(store, &product.sku);
            self.kv.set_ex(&key, price_hash(product).into_bytes(), self.ttl_seconds).await?;
        }
        Ok(())
    }

    /// Drop the stored hash for one sku.
    pub async fn invalidate(&self, store: &str, sku: &str) -> anyhow::Result<()> {
        self.kv.del(&kv_key(store, sku)).await
    }
}
