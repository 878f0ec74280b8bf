//! Alert pipeline (C13).
//!
//! Grounded in `original_source/src/notify/dedupe.py`'s
//! `DedupeManager`: an md5-hashed dedupe key scoped to a rounded price, a
//! separate cooldown key whose value doubles as the last-alert price for
//! the bypass check, and cross-source suppression via C12.

use std::sync::Arc;

use serde::Serialize;

use crate::cross_source_dedupe::{CrossSourceDecision, CrossSourceDeduper};
use crate::domain::DetectedDeal;
use crate::http_cache::KvStore;
use crate::metrics;

fn dedupe_key(store: &str, sku: &str, rounded_price: i64) -> String {
    let data = format!("{store}:{sku}:{rounded_price}");
    format!("alert:{}", blake3::hash(data.as_bytes()).to_hex())
}

fn cooldown_key(store: &str, sku: &str) -> String {
    let data = format!("{store}:{sku}");
    format!("cooldown:{}", blake3::hash(data.as_bytes()).to_hex())
}

/// Payload handed to the external [`AlertSink`] (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub sku: String,
    pub title: String,
    pub store: String,
    pub current_price: f64,
    pub previous_price: Option<f64>,
    pub baseline_price: Option<f64>,
    pub msrp: Option<f64>,
    pub reason: String,
    pub confidence: f64,
    pub image_url: Option<String>,
}

/// The external collaborator that delivers alerts; the core does not care
/// about the transport (spec.md §6).
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: Alert) -> anyhow::Result<()>;
}

/// Outcome of running one deal through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Sent,
    SuppressedDuplicate,
    SuppressedCooldown,
    SuppressedCrossSource,
}

/// Dedupe+cooldown+bypass+cross-source logic between candidate deals and
/// an [`AlertSink`] (spec.md §4.13).
pub struct AlertPipeline {
    kv: Arc<dyn KvStore>,
    cross_source: Arc<CrossSourceDeduper>,
    aggregator_stores: Vec<String>,
    sink: Arc<dyn AlertSink>,
    dedupe_ttl_seconds: i64,
    cooldown_ttl_seconds: i64,
}

impl AlertPipeline {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        cross_source: Arc<CrossSourceDeduper>,
        aggregator_stores: Vec<String>,
        sink: Arc<dyn AlertSink>,
        dedupe_ttl_seconds: i64,
        cooldown_ttl_seconds: i64,
    ) -> Self {
        Self { kv, cross_source, aggregator_stores, sink, dedupe_ttl_seconds, cooldown_ttl_seconds }
    }

    /// Run one surviving deal through dedupe, cooldown-bypass, and
    /// cross-source suppression, emitting to the sink on success.
    pub async fn process(&self, deal: &DetectedDeal) -> anyhow::Result<AlertOutcome> {
        let store = deal.product.store.clone();
        let sku = deal.product.sku.clone();
        let Some(current_price) = deal.product.current_price else {
            return Ok(AlertOutcome::SuppressedDuplicate);
        };
        let rounded = current_price.round() as i64;

        let dkey = dedupe_key(&store, &sku, rounded);
        if self.kv.exists(&dkey).await? {
            return Ok(AlertOutcome::SuppressedDuplicate);
        }

        let ckey = cooldown_key(&store, &sku);
        let mut bypassed = true;
        if let Some(raw) = self.kv.get(&ckey).await? {
            if let Ok(last_price) = String::from_utf8_lossy(&raw).parse::<f64>() {
                if current_price < last_price {
                    bypassed = true;
                } else {
                    return Ok(AlertOutcome::SuppressedCooldown);
                }
            }
        } else {
            bypassed = true;
        }
        let _ = bypassed;

        if self.aggregator_stores.iter().any(|s| s == &store) {
            let decision =
                self.cross_source.check(&sku, &store, current_price, &deal.product.url).await?;
            if decision == CrossSourceDecision::Suppress {
                return Ok(AlertOutcome::SuppressedCrossSource);
            }
        }

        self.sink
            .emit(Alert {
                sku: sku.clone(),
                title: deal.product.title.clone(),
                store: store.clone(),
                current_price,
                previous_price: deal.product.original_price,
                baseline_price: None,
                msrp: deal.product.msrp,
                reason: format!("{:.1}% off ({:?})", deal.discount_percent, deal.detection_method),
                confidence: deal.confidence,
                image_url: deal.product.image_url.clone(),
            })
            .await?;

        self.kv.set_ex(&dkey, b"1".to_vec(), self.dedupe_ttl_seconds).await?;
        self.kv
            .set_ex(&ckey, current_price.to_string().into_bytes(), self.cooldown_ttl_seconds)
            .await?;

        metrics::record_deal_detected(&store, deal.confidence);
        Ok(AlertOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DetectionMethod, DiscoveredProduct};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
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

    struct RecordingSink(StdMutex<Vec<Alert>>);
    impl RecordingSink {
        fn new() -> Self {
            Self(StdMutex::new(Vec::new()))
        }
    }
    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn emit(&self, alert: Alert) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(alert);
            Ok(())
        }
    }

    fn deal(store: &str, sku: &str, price: f64) -> DetectedDeal {
        DetectedDeal {
            product: DiscoveredProduct {
                sku: sku.into(),
                title: "t".into(),
                url: format!("https://{store}.example/p"),
                current_price: Some(price),
                original_price: Some(price * 2.0),
                msrp: None,
                store: store.into(),
                image_url: None,
                category_id: None,
            },
            discount_percent: 50.0,
            detection_method: DetectionMethod::Strikethrough,
            confidence: 0.8,
            signals: vec![DetectionMethod::Strikethrough],
            category_context: None,
        }
    }

    fn pipeline(sink: Arc<RecordingSink>) -> AlertPipeline {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let cross_source = Arc::new(CrossSourceDeduper::new(kv.clone(), 600));
        AlertPipeline::new(kv, cross_source, vec!["slickdeals".into()], sink, 12 * 3600, 3600)
    }

    #[tokio::test]
    async fn dedupe_suppresses_exact_repeat() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(sink.clone());
        let d = deal("walmart", "X1", 10.0);

        assert_eq!(pipeline.process(&d).await.unwrap(), AlertOutcome::Sent);
        assert_eq!(pipeline.process(&d).await.unwrap(), AlertOutcome::SuppressedDuplicate);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cooldown_suppresses_same_or_worse_price() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(sink.clone());

        pipeline.process(&deal("walmart", "X2", 10.0)).await.unwrap();
        let outcome = pipeline.process(&deal("walmart", "X2", 12.0)).await.unwrap();
        assert_eq!(outcome, AlertOutcome::SuppressedCooldown);
    }

    #[tokio::test]
    async fn cooldown_bypassed_when_price_drops_further() {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(sink.clone());

        pipeline.process(&deal("walmart", "X3", 10.0)).await.unwrap();
        let outcome = pipeline.process(&deal("walmart", "X3", 5.0)).await.unwrap();
        assert_eq!(outcome, AlertOutcome::Sent);
    }
}
