//! HTTP cache (C5).
//!
//! ETag / Last-Modified conditional request cache keyed by URL (spec.md
//! §4.5). Persisted through the key-value store (C18's `redis` contract);
//! this module holds the policy/shape and is exercised in tests against an
//! in-memory stand-in for that store via the [`KvStore`] trait so the core
//! logic is storage-agnostic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimal key-value contract C5/C9/C12/C13 depend on; implemented for
/// `redis` in [`crate::kv`].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_seconds: i64) -> anyhow::Result<()>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn ttl(&self, key: &str) -> anyhow::Result<Option<i64>>;
}

/// One URL's conditional metadata + last body (spec.md §3 "Cache Entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub stored_at: DateTime<Utc>,
}

/// Conditional request headers to attach to the next GET.
#[derive(Debug, Clone, Default)]
pub struct ConditionalHeaders {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// Response metadata the cache needs to decide what to store, decoupled
/// from any particular HTTP client type.
pub struct ResponseMeta<'a> {
    pub status: u16,
    pub etag: Option<&'a str>,
    pub last_modified: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

fn cache_key(url: &str) -> String {
    format!("httpcache:{}", blake3::hash(url.as_bytes()).to_hex())
}

/// ETag/Last-Modified conditional request cache (spec.md §4.5).
pub struct HttpCache {
    kv: std::sync::Arc<dyn KvStore>,
    ttl_seconds: i64,
    enabled: bool,
    stats: tokio::sync::Mutex<CacheStats>,
}

impl HttpCache {
    #[must_use]
    pub fn new(kv: std::sync::Arc<dyn KvStore>, ttl_seconds: i64, enabled: bool) -> Self {
        Self { kv, ttl_seconds, enabled, stats: tokio::sync::Mutex::new(CacheStats::default()) }
    }

    /// `conditional_headers(url)`: empty if absent or the cache is disabled.
    pub async fn conditional_headers(&self, url: &str) -> ConditionalHeaders {
        if !self.enabled {
            return ConditionalHeaders::default();
        }
        let Ok(Some(raw)) = self.kv.get(&cache_key(url)).await else {
            return ConditionalHeaders::default();
        };
        let Ok(entry) = serde_json::from_slice::<CacheEntry>(&raw) else {
            return ConditionalHeaders::default();
        };
        ConditionalHeaders { if_none_match: entry.etag, if_modified_since: entry.last_modified }
    }

    /// `handle_response(url, response) → (body, from_cache)` (spec.md §4.5).
    pub async fn handle_response(
        &self,
        url: &str,
        meta: ResponseMeta<'_>,
        body: Vec<u8>,
    ) -> anyhow::Result<(Vec<u8>, bool)> {
        if !self.enabled {
            return Ok((body, false));
        }

        let key = cache_key(url);

        if meta.status == 304 {
            let mut stats = self.stats.lock().await;
            if let Some(raw) = self.kv.get(&key).await? {
                if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&raw) {
                    stats.hits += 1;
                    return Ok((entry.body, true));
                }
            }
            stats.misses += 1;
            return Ok((Vec::new(), false));
        }

        if (200..300).contains(&meta.status) && (meta.etag.is_some() || meta.last_modified.is_some()) {
            let entry = CacheEntry {
                body: body.clone(),
                etag: meta.etag.map(str::to_string),
                last_modified: meta.last_modified.map(str::to_string),
                stored_at: Utc::now(),
            };
            let encoded = serde_json::to_vec(&entry)?;
            self.kv.set_ex(&key, encoded, self.ttl_seconds).await?;
        }

        Ok((body, false))
    }

    /// Drop a URL's cached entry.
    pub async fn invalidate(&self, url: &str) -> anyhow::Result<()> {
        self.kv.del(&cache_key(url)).await
    }

    /// Snapshot of hit/miss counters.
    pub async fn stats(&self) -> CacheStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex as TokioMutex;

    struct InMemoryKv(TokioMutex<HashMap<String, Vec<u8>>>);

    impl InMemoryKv {
        fn new() -> Self {
            Self(TokioMutex::new(HashMap::new()))
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

    #[tokio::test]
    async fn roundtrip_identity_on_304() {
        let kv = std::sync::Arc::new(InMemoryKv::new());
        let cache = HttpCache::new(kv, 3600, true);

        let (_, from_cache) = cache
            .handle_response(
                "https://example.com/a",
                ResponseMeta { status: 200, etag: Some("v1"), last_modified: None },
                b"body-v1".to_vec(),
            )
            .await
            .unwrap();
        assert!(!from_cache);

        let (body, from_cache) = cache
            .handle_response(
                "https://example.com/a",
                ResponseMeta { status: 304, etag: None, last_modified: None },
                Vec::new(),
            )
            .await
            .unwrap();
        assert!(from_cache);
        assert_eq!(body, b"body-v1".to_vec());
    }

    #[tokio::test]
    async fn missing_body_on_304_is_treated_as_uncached() {
        let kv = std::sync::Arc::new(InMemoryKv::new());
        let cache = HttpCache::new(kv, 3600, true);

        let (body, from_cache) = cache
            .handle_response(
                "https://example.com/never-cached",
                ResponseMeta { status: 304, etag: None, last_modified: None },
                Vec::new(),
            )
            .await
            .unwrap();
        assert!(!from_cache);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let kv = std::sync::Arc::new(InMemoryKv::new());
        let cache = HttpCache::new(kv.clone(), 3600, false);
        cache
            .handle_response(
                "https://example.com/b",
                ResponseMeta { status: 200, etag: Some("v1"), last_modified: None },
                b"body".to_vec(),
            )
            .await
            .unwrap();
        assert!(!kv.exists(&cache_key("https://example.com/b")).await.unwrap());
    }
}
