//! Named-policy admission control.
//!
//! Every guarded operation names a policy. The gate keeps one fixed-window
//! counter per (policy, caller) pair and fails fast with `RateLimited` once the
//! window's permit limit is used up. It never queues or delays a request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MeshError, Result};

/// Policy guarding realtime hub joins.
pub const HUB_JOIN_POLICY: &str = "hub-join";

/// Policy guarding planet routing lookups.
pub const PLANET_ROUTE_POLICY: &str = "planet-route";

/// A quota rule: at most `permit_limit` calls per `window_secs`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy name referenced by guarded operations.
    pub name: String,
    /// Calls admitted per window.
    pub permit_limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl Policy {
    /// Creates a policy.
    pub fn new(name: impl Into<String>, permit_limit: u32, window_secs: u64) -> Self {
        Self {
            name: name.into(),
            permit_limit,
            window_secs,
        }
    }

    fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }
}

/// Configuration for the admission gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Configured quota rules.
    pub policies: Vec<Policy>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policies: vec![
                Policy::new("login", 5, 60),
                Policy::new("register", 3, 600),
                Policy::new("password-reset", 3, 900),
                Policy::new("email-verify", 10, 300),
                Policy::new("mfa", 5, 300),
                Policy::new("password-change", 3, 600),
                Policy::new("oauth", 10, 300),
                Policy::new(HUB_JOIN_POLICY, 120, 60),
                Policy::new(PLANET_ROUTE_POLICY, 600, 60),
            ],
        }
    }
}

/// Source of quota rules, resolved at call time.
pub trait QuotaStore: Send + Sync {
    /// Looks up a policy by name.
    fn policy(&self, name: &str) -> Option<Policy>;

    /// Every known policy.
    fn policies(&self) -> Vec<Policy>;
}

/// Quota rules fixed at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticQuotaStore {
    policies: HashMap<String, Policy>,
}

impl StaticQuotaStore {
    /// Builds a store from configuration. Later duplicates replace earlier ones.
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            policies: config
                .policies
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
        }
    }
}

impl QuotaStore for StaticQuotaStore {
    fn policy(&self, name: &str) -> Option<Policy> {
        self.policies.get(name).cloned()
    }

    fn policies(&self) -> Vec<Policy> {
        let mut all: Vec<Policy> = self.policies.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

struct Window {
    started_ms: u64,
    length_ms: u64,
    used: u32,
}

impl Window {
    fn new(now_ms: u64, length_ms: u64) -> Self {
        Self {
            started_ms: now_ms,
            length_ms,
            used: 0,
        }
    }

    fn ends_ms(&self) -> u64 {
        self.started_ms.saturating_add(self.length_ms)
    }

    fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.ends_ms()
    }
}

/// Statistics about the admission gate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    /// (policy, caller) windows currently tracked.
    pub tracked_windows: usize,
    /// Calls admitted since startup.
    pub total_admitted: u64,
    /// Calls rejected with `RateLimited` since startup.
    pub total_limited: u64,
    /// Calls naming an unknown policy since startup.
    pub total_unknown_policy: u64,
}

/// Enforces per-(policy, caller) quotas.
pub struct AdmissionGate {
    store: Arc<dyn QuotaStore>,
    windows: DashMap<(String, String), Window>,
    total_admitted: AtomicU64,
    total_limited: AtomicU64,
    total_unknown: AtomicU64,
}

impl AdmissionGate {
    /// Creates a gate resolving policies from `store`.
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            windows: DashMap::new(),
            total_admitted: AtomicU64::new(0),
            total_limited: AtomicU64::new(0),
            total_unknown: AtomicU64::new(0),
        }
    }

    /// Creates a gate over a [`StaticQuotaStore`] built from `config`.
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(Arc::new(StaticQuotaStore::new(config)))
    }

    /// Consumes one permit of `policy` for `caller`.
    ///
    /// Fails with `UnknownPolicy` if no rule is configured for `policy` and
    /// with `RateLimited` once the window's permits are used up. A rejected
    /// call consumes nothing.
    pub fn check(&self, policy: &str, caller: &str, now_ms: u64) -> Result<()> {
        let Some(rule) = self.store.policy(policy) else {
            self.total_unknown.fetch_add(1, Ordering::Relaxed);
            warn!(policy, "guarded operation names an unknown policy");
            return Err(MeshError::UnknownPolicy(policy.to_string()));
        };

        let mut window = self
            .windows
            .entry((policy.to_string(), caller.to_string()))
            .or_insert_with(|| Window::new(now_ms, rule.window_ms()));
        if window.expired(now_ms) || window.length_ms != rule.window_ms() {
            *window = Window::new(now_ms, rule.window_ms());
        }

        if window.used < rule.permit_limit {
            window.used += 1;
            drop(window);
            self.total_admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let retry_after_ms = window.ends_ms().saturating_sub(now_ms);
        drop(window);
        self.total_limited.fetch_add(1, Ordering::Relaxed);
        debug!(policy, caller, retry_after_ms, "request rate limited");
        Err(MeshError::RateLimited {
            policy: policy.to_string(),
            caller: caller.to_string(),
            retry_after_ms,
        })
    }

    /// Runs `op` if `policy` admits `caller`; otherwise `op` is never invoked.
    pub fn guard<T, F>(&self, policy: &str, caller: &str, now_ms: u64, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.check(policy, caller, now_ms)?;
        op()
    }

    /// Permits left for `caller` under `policy` in the current window.
    pub fn remaining(&self, policy: &str, caller: &str, now_ms: u64) -> Result<u32> {
        let rule = self
            .store
            .policy(policy)
            .ok_or_else(|| MeshError::UnknownPolicy(policy.to_string()))?;
        let used = self
            .windows
            .get(&(policy.to_string(), caller.to_string()))
            .filter(|w| !w.expired(now_ms))
            .map_or(0, |w| w.used);
        Ok(rule.permit_limit.saturating_sub(used))
    }

    /// Drops every window that has elapsed. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.expired(now_ms));
        let purged = before.saturating_sub(self.windows.len());
        if purged > 0 {
            debug!(purged, "expired admission windows purged");
        }
        purged
    }

    /// Clears all windows. Counters are kept.
    pub fn reset(&self) {
        self.windows.clear();
    }

    /// Current gate statistics.
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            tracked_windows: self.windows.len(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_limited: self.total_limited.load(Ordering::Relaxed),
            total_unknown_policy: self.total_unknown.load(Ordering::Relaxed),
        }
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::from_config(&AdmissionConfig::default())
    }
}
