//! Proxy pool (C3).
//!
//! Grounded in `original_source/src/ingest/proxy_manager.py`'s
//! `ProxyRotator`: round-robin selection per sub-pool, per-proxy cooldown,
//! and 403-strike exclusion that never flips the operator-managed
//! `enabled` flag.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::domain::{Id, Proxy, ProxyType};

/// In-memory bookkeeping for one proxy, separate from the persisted row
/// so reloads (`refresh`) can preserve cooldown/strike state across a
/// storage refresh (spec.md §4.3).
#[derive(Debug, Clone, Default)]
struct ProxyState {
    consecutive_403s: u32,
    cooldown_until: Option<Instant>,
    success_count: u64,
    failure_count: u64,
    last_used_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

/// The kind of failure reported against a proxy (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Http403,
    Other,
}

/// Rotating pool with per-proxy cooldown and 403-strike disabling (spec.md §4.3).
pub struct ProxyPool {
    proxies: RwLock<Vec<Proxy>>,
    state: RwLock<HashMap<Id, ProxyState>>,
    cursor: RwLock<HashMap<Option<ProxyType>, usize>>,
    max_consecutive_403s: u32,
    cooldown: Duration,
}

impl ProxyPool {
    #[must_use]
    pub fn new(proxies: Vec<Proxy>, max_consecutive_403s: u32, cooldown_minutes: i64) -> Self {
        let state = proxies.iter().map(|p| (p.id, ProxyState::default())).collect();
        Self {
            proxies: RwLock::new(proxies),
            state: RwLock::new(state),
            cursor: RwLock::new(HashMap::new()),
            max_consecutive_403s,
            cooldown: Duration::from_secs((cooldown_minutes.max(0) as u64) * 60),
        }
    }

    /// Round-robin over the non-cooling, non-disabled sub-pool matching
    /// `proxy_type`, skipping `exclude_ids` (spec.md §4.3). Returns `None`
    /// rather than spinning when nothing is eligible.
    #[must_use]
    pub fn next(&self, exclude_ids: &[Id], proxy_type: Option<ProxyType>) -> Option<Proxy> {
        let proxies = self.proxies.read().expect("proxy_pool lock poisoned");
        let state = self.state.read().expect("proxy_pool lock poisoned");
        let now = Instant::now();

        let eligible: Vec<&Proxy> = proxies
            .iter()
            .filter(|p| p.enabled)
            .filter(|p| proxy_type.map_or(true, |t| p.proxy_type == t))
            .filter(|p| !exclude_ids.contains(&p.id))
            .filter(|p| {
                state.get(&p.id).map_or(true, |s| {
                    s.consecutive_403s < self.max_consecutive_403s
                        && s.cooldown_until.map_or(true, |until| now >= until)
                })
            })
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.write().expect("proxy_pool lock poisoned");
        let idx_slot = cursor.entry(proxy_type).or_insert(0);
        let idx = *idx_slot % eligible.len();
        *idx_slot = idx_slot.wrapping_add(1);

        let chosen = eligible[idx].clone();
        drop(state);
        drop(proxies);
        drop(cursor);

        let mut state = self.state.write().expect("proxy_pool lock poisoned");
        state.entry(chosen.id).or_default().last_used_at = Some(Instant::now());

        Some(chosen)
    }

    /// Clear strike/cooldown bookkeeping and bump success counters.
    pub fn report_success(&self, id: Id) {
        let mut state = self.state.write().expect("proxy_pool lock poisoned");
        let entry = state.entry(id).or_default();
        entry.last_success_at = Some(Instant::now());
        entry.consecutive_403s = 0;
        entry.cooldown_until = None;
        entry.failure_count = 0;
        entry.success_count += 1;
    }

    /// Increment `failure_count`; a 403 also strikes and sets a cooldown.
    pub fn report_failure(&self, id: Id, kind: FailureKind) {
        let mut state = self.state.write().expect("proxy_pool lock poisoned");
        let entry = state.entry(id).or_default();
        entry.failure_count += 1;
        if kind == FailureKind::Http403 {
            entry.consecutive_403s += 1;
            entry.cooldown_until = Some(Instant::now() + self.cooldown);
        }
    }

    /// Equivalent to a 403 report (401/403/challenge block, spec.md §4.3).
    pub fn report_block(&self, id: Id) {
        self.report_failure(id, FailureKind::Http403);
    }

    /// Reload proxies from storage, preserving in-memory state for ids
    /// that still exist (spec.md §4.3).
    pub fn refresh(&self, fresh: Vec<Proxy>) {
        let mut state = self.state.write().expect("proxy_pool lock poisoned");
        state.retain(|id, _| fresh.iter().any(|p| &p.id == id));
        for p in &fresh {
            state.entry(p.id).or_default();
        }
        drop(state);
        *self.proxies.write().expect("proxy_pool lock poisoned") = fresh;
    }

    /// Current consecutive-403 strike count for a proxy (for metrics/tests).
    #[must_use]
    pub fn strikes(&self, id: Id) -> u32 {
        self.state
            .read()
            .expect("proxy_pool lock poisoned")
            .get(&id)
            .map_or(0, |s| s.consecutive_403s)
    }
}
