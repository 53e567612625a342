//! Cache Metrics
//!
//! Cache-line aligned counters shared by all partitions. Every update is a
//! single atomic operation, so no counter is ever split across an await.
//! Gauges (items, bytes) are adjusted by partition deltas and saturate at
//! zero instead of wrapping.

use crate::cache::compression::CompressionStats;
use crate::cache::partition::PartitionUsage;
use crate::cache::policy::EvictionPolicy;
use crate::cache::prefetch::PrefetchStats;
use crate::cache::remote::RemoteStats;
use crate::cache::tier::CacheTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

#[inline]
fn saturating_apply(counter: &AtomicU64, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        let down = delta.unsigned_abs();
        // fetch_update only fails when the closure returns None
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(down))
        });
    }
}

// =============================================================================
// Per-Tier Metrics (Cache-Line Aligned)
// =============================================================================

/// Metrics for a single cache tier, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct CacheTierMetrics {
    /// Lookups served by this tier
    pub hits: AtomicU64,
    /// Total bytes currently stored
    pub bytes_stored: AtomicU64,
    /// Number of entries currently stored
    pub entry_count: AtomicU64,
    /// Entries evicted from this tier
    pub evictions: AtomicU64,
    /// Entries moved up into this tier
    pub promotions: AtomicU64,
    /// Entries moved down out of this tier
    pub demotions: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
    _padding: [u8; 8],
}

// Verify size at compile time
const _: () = assert!(std::mem::size_of::<CacheTierMetrics>() <= CACHE_LINE_SIZE);

impl Default for CacheTierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheTierMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Adjust the resident gauges by a signed delta
    #[inline]
    pub fn apply_usage_delta(&self, items: i64, bytes: i64) {
        if items == 0 && bytes == 0 {
            return;
        }
        saturating_apply(&self.entry_count, items);
        saturating_apply(&self.bytes_stored, bytes);
        self.touch();
    }

    #[inline]
    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_demotions(&self, count: u64) {
        self.demotions.fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Snapshot with the tier's byte budget
    pub fn snapshot(&self, capacity_bytes: u64) -> TierStats {
        let memory_bytes = self.bytes_stored.load(Ordering::Relaxed);
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            items: self.entry_count.load(Ordering::Relaxed),
            memory_bytes,
            capacity_bytes,
            usage_ratio: if capacity_bytes == 0 {
                0.0
            } else {
                memory_bytes as f64 / capacity_bytes as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Snapshot Types
// =============================================================================

/// Point-in-time view of one tier across all partitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub hits: u64,
    pub items: u64,
    pub memory_bytes: u64,
    pub capacity_bytes: u64,
    pub usage_ratio: f64,
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
}

/// Eviction counts by the policy that chose the victim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionCounts {
    pub lru: u64,
    pub lfu: u64,
    pub fifo: u64,
    pub ttl: u64,
    pub hybrid: u64,
}

impl EvictionCounts {
    pub fn total(&self) -> u64 {
        self.lru + self.lfu + self.fifo + self.ttl + self.hybrid
    }

    pub fn get(&self, policy: EvictionPolicy) -> u64 {
        match policy {
            EvictionPolicy::Lru => self.lru,
            EvictionPolicy::Lfu => self.lfu,
            EvictionPolicy::Fifo => self.fifo,
            EvictionPolicy::Ttl => self.ttl,
            EvictionPolicy::Hybrid => self.hybrid,
        }
    }
}

/// Read-only snapshot returned by `CacheManager::get_stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub timestamp: DateTime<Utc>,
    pub policy: EvictionPolicy,
    pub partitions: usize,

    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub total_requests: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub expirations: u64,

    pub l1: TierStats,
    pub l2: TierStats,
    pub evictions: EvictionCounts,

    pub pattern_invalidations: u64,
    pub invalidated_entries: u64,
    pub flushes: u64,

    pub compression: CompressionStats,
    pub prefetch: PrefetchStats,
    pub remote: Option<RemoteStats>,

    pub avg_get_latency_ms: f64,
    pub avg_set_latency_ms: f64,
    /// Cumulative get latency (microseconds), for delta averages
    pub get_latency_us_total: u64,
    pub get_count: u64,
    /// Cumulative set latency (microseconds), for delta averages
    pub set_latency_us_total: u64,
    pub set_count: u64,
}

impl CacheStats {
    /// Resident entries across tiers (local only)
    pub fn current_items(&self) -> u64 {
        self.l1.items + self.l2.items
    }

    /// Resident bytes across tiers (local only)
    pub fn current_memory_bytes(&self) -> u64 {
        self.l1.memory_bytes + self.l2.memory_bytes
    }

    /// Fraction of the L1 budget in use
    pub fn l1_memory_usage_ratio(&self) -> f64 {
        self.l1.usage_ratio
    }

    /// Average latency over gets and sets, in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.get_count + self.set_count;
        if count == 0 {
            0.0
        } else {
            (self.get_latency_us_total + self.set_latency_us_total) as f64 / count as f64 / 1000.0
        }
    }

    /// Lifetime error rate over all operations
    pub fn error_rate(&self) -> f64 {
        let ops = self.total_requests + self.sets;
        if ops == 0 {
            0.0
        } else {
            self.errors as f64 / ops as f64
        }
    }

    pub fn tier(&self, tier: CacheTier) -> &TierStats {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
        }
    }
}

/// Inputs to a stats snapshot that the counters do not own
#[derive(Debug, Clone)]
pub struct StatsContext {
    pub policy: EvictionPolicy,
    pub partitions: usize,
    pub l1_capacity: u64,
    pub l2_capacity: u64,
    pub compression: CompressionStats,
    pub prefetch: PrefetchStats,
    pub remote: Option<RemoteStats>,
}

// =============================================================================
// Global Cache Metrics
// =============================================================================

/// Global cache metrics container
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub l1: CacheTierMetrics,
    pub l2: CacheTierMetrics,

    misses: AtomicU64,
    remote_hits: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    expirations: AtomicU64,
    evictions: [AtomicU64; 5],
    pattern_invalidations: AtomicU64,
    invalidated_entries: AtomicU64,
    flushes: AtomicU64,
    remote_errors: AtomicU64,
    remote_fallbacks: AtomicU64,

    get_latency_us: AtomicU64,
    get_count: AtomicU64,
    set_latency_us: AtomicU64,
    set_count: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get metrics for a specific tier
    pub fn tier(&self, tier: CacheTier) -> &CacheTierMetrics {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
        }
    }

    /// Mirror a partition's occupancy change into the tier gauges
    pub fn apply_usage(&self, before: &PartitionUsage, after: &PartitionUsage) {
        self.l1.apply_usage_delta(
            after.l1_items as i64 - before.l1_items as i64,
            after.l1_bytes as i64 - before.l1_bytes as i64,
        );
        self.l2.apply_usage_delta(
            after.l2_items as i64 - before.l2_items as i64,
            after.l2_bytes as i64 - before.l2_bytes as i64,
        );
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit served by the remote L2 tier
    #[inline]
    pub fn record_remote_hit(&self) {
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
        self.l2.record_hit();
    }

    #[inline]
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    /// Evictions chosen by `policy` out of `tier`
    #[inline]
    pub fn record_evictions(&self, policy: EvictionPolicy, tier: CacheTier, count: u64) {
        if count == 0 {
            return;
        }
        self.evictions[policy.index()].fetch_add(count, Ordering::Relaxed);
        self.tier(tier).record_evictions(count);
    }

    pub fn record_invalidation(&self, removed: u64) {
        self.pattern_invalidations.fetch_add(1, Ordering::Relaxed);
        self.invalidated_entries.fetch_add(removed, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remote_error(&self) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_remote_fallback(&self) {
        self.remote_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_counters(&self) -> (u64, u64, u64) {
        (
            self.remote_hits.load(Ordering::Relaxed),
            self.remote_errors.load(Ordering::Relaxed),
            self.remote_fallbacks.load(Ordering::Relaxed),
        )
    }

    #[inline]
    pub fn record_get_latency(&self, elapsed: Duration) {
        self.get_latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.get_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_set_latency(&self, elapsed: Duration) {
        self.set_latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.set_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self, ctx: StatsContext) -> CacheStats {
        let l1 = self.l1.snapshot(ctx.l1_capacity);
        let l2 = self.l2.snapshot(ctx.l2_capacity);
        let hits = l1.hits + l2.hits;
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;

        let get_latency_us_total = self.get_latency_us.load(Ordering::Relaxed);
        let get_count = self.get_count.load(Ordering::Relaxed);
        let set_latency_us_total = self.set_latency_us.load(Ordering::Relaxed);
        let set_count = self.set_count.load(Ordering::Relaxed);
        let avg_ms = |total: u64, count: u64| {
            if count == 0 {
                0.0
            } else {
                total as f64 / count as f64 / 1000.0
            }
        };

        let evicted = |p: EvictionPolicy| self.evictions[p.index()].load(Ordering::Relaxed);

        CacheStats {
            timestamp: Utc::now(),
            policy: ctx.policy,
            partitions: ctx.partitions,
            hits,
            misses,
            hit_ratio: if total_requests == 0 {
                0.0
            } else {
                hits as f64 / total_requests as f64
            },
            total_requests,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            l1,
            l2,
            evictions: EvictionCounts {
                lru: evicted(EvictionPolicy::Lru),
                lfu: evicted(EvictionPolicy::Lfu),
                fifo: evicted(EvictionPolicy::Fifo),
                ttl: evicted(EvictionPolicy::Ttl),
                hybrid: evicted(EvictionPolicy::Hybrid),
            },
            pattern_invalidations: self.pattern_invalidations.load(Ordering::Relaxed),
            invalidated_entries: self.invalidated_entries.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            compression: ctx.compression,
            prefetch: ctx.prefetch,
            remote: ctx.remote,
            avg_get_latency_ms: avg_ms(get_latency_us_total, get_count),
            avg_set_latency_ms: avg_ms(set_latency_us_total, set_count),
            get_latency_us_total,
            get_count,
            set_latency_us_total,
            set_count,
        }
    }
}
