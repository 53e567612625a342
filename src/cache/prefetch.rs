//! Prefetch Advisor
//!
//! Tracks a rolling access window per key and recommends promoting hot L2
//! entries into L1. Recommendations are advisory: a skipped or wrong
//! promotion only costs latency.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Prefetch Configuration
// =============================================================================

/// Configuration for the prefetch advisor
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Promote once `accesses / window_size` reaches this ratio
    pub threshold: f64,
    /// Accesses counted per key
    pub window_size: usize,
    /// Sliding time window for counted accesses
    pub window: Duration,
    /// Upper bound on tracked keys
    pub max_tracked_keys: usize,
    /// Whether promotion recommendations are made at all
    pub enabled: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            window_size: 10,
            window: Duration::from_secs(60),
            max_tracked_keys: 10_000,
            enabled: true,
        }
    }
}

impl PrefetchConfig {
    /// Config with a custom threshold and default window
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            ..Default::default()
        }
    }
}

// =============================================================================
// Prefetch Stats
// =============================================================================

#[derive(Debug, Default)]
struct PrefetchCounters {
    recommendations: AtomicU64,
    promotions: AtomicU64,
    skipped: AtomicU64,
    pruned: AtomicU64,
}

/// Snapshot of prefetch statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefetchStats {
    /// Times the advisor said "promote"
    pub recommendations: u64,
    /// Promotions actually carried out
    pub promotions: u64,
    /// Recommendations that could not be honoured
    pub skipped: u64,
    /// Keys dropped from tracking to respect the cap
    pub pruned: u64,
    /// Keys currently tracked
    pub tracked_keys: u64,
}

// =============================================================================
// Prefetch Advisor
// =============================================================================

/// Rolling-window access tracker
#[derive(Debug)]
pub struct PrefetchAdvisor {
    config: PrefetchConfig,
    history: DashMap<String, VecDeque<i64>>,
    counters: PrefetchCounters,
}

impl PrefetchAdvisor {
    /// Create an advisor with default configuration
    pub fn new() -> Self {
        Self::with_config(PrefetchConfig::default())
    }

    /// Create an advisor with custom configuration
    pub fn with_config(config: PrefetchConfig) -> Self {
        Self {
            config,
            history: DashMap::new(),
            counters: PrefetchCounters::default(),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Record an access at `now_ms` and return the key's current ratio
    pub fn record_access(&self, key: &str, now_ms: i64) -> f64 {
        let window_size = self.config.window_size.max(1);
        let horizon = now_ms - self.config.window.as_millis() as i64;

        if !self.history.contains_key(key) && self.history.len() >= self.config.max_tracked_keys {
            self.prune(horizon);
        }

        let mut accesses = self.history.entry(key.to_string()).or_default();
        accesses.push_back(now_ms);
        while accesses.front().is_some_and(|t| *t < horizon) {
            accesses.pop_front();
        }
        while accesses.len() > window_size {
            accesses.pop_front();
        }

        accesses.len() as f64 / window_size as f64
    }

    /// Whether a ratio warrants promotion, counting the recommendation
    pub fn should_promote(&self, ratio: f64) -> bool {
        let promote = self.config.enabled && ratio >= self.config.threshold;
        if promote {
            self.counters.recommendations.fetch_add(1, Ordering::Relaxed);
        }
        promote
    }

    /// A recommended promotion was carried out
    pub fn record_promotion(&self) {
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
    }

    /// A recommended promotion was not possible
    pub fn record_skip(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Current ratio for a key without recording an access
    pub fn ratio(&self, key: &str) -> f64 {
        self.history
            .get(key)
            .map(|a| a.len() as f64 / self.config.window_size.max(1) as f64)
            .unwrap_or(0.0)
    }

    /// Stop tracking a key
    pub fn forget(&self, key: &str) {
        self.history.remove(key);
    }

    /// Stop tracking every key
    pub fn clear(&self) {
        self.history.clear();
    }

    /// Most active keys, highest ratio first
    pub fn hot_keys(&self, limit: usize) -> Vec<(String, f64)> {
        let window_size = self.config.window_size.max(1) as f64;
        let mut keys: Vec<(String, f64)> = self
            .history
            .iter()
            .map(|e| (e.key().clone(), e.value().len() as f64 / window_size))
            .collect();
        keys.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        keys.truncate(limit);
        keys
    }

    /// Snapshot of advisor statistics
    pub fn stats(&self) -> PrefetchStats {
        PrefetchStats {
            recommendations: self.counters.recommendations.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
            tracked_keys: self.history.len() as u64,
        }
    }

    fn prune(&self, horizon: i64) {
        let before = self.history.len();
        self.history
            .retain(|_, accesses| accesses.back().is_some_and(|t| *t >= horizon));

        // Still full: drop the key idle the longest
        if self.history.len() >= self.config.max_tracked_keys {
            let coldest = self
                .history
                .iter()
                .min_by_key(|e| e.value().back().copied().unwrap_or(i64::MIN))
                .map(|e| e.key().clone());
            if let Some(key) = coldest {
                self.history.remove(&key);
            }
        }

        let removed = before.saturating_sub(self.history.len());
        self.counters.pruned.fetch_add(removed as u64, Ordering::Relaxed);
        debug!(removed = removed, "Pruned prefetch tracking");
    }
}

impl Default for PrefetchAdvisor {
    fn default() -> Self {
        Self::new()
    }
}
