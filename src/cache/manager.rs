//! Cache Manager
//!
//! Façade over the partitioned tier store. Coordinates key partitioning,
//! compression, placement and eviction, prefetch promotion, the optional
//! remote L2 tier, metrics, telemetry and the event stream.
//!
//! Every operation on a key runs under the owning partition's async mutex,
//! including any Redis round-trip for that key, so two operations on the
//! same key never interleave. Operations on different partitions proceed
//! concurrently.

use crate::cache::compression::{CompressionConfig, CompressionManager};
use crate::cache::entry::{CacheData, CacheEntry};
use crate::cache::events::CacheEvent;
use crate::cache::keys::{self, KeyCodec, KeyPattern};
use crate::cache::metrics::{CacheMetrics, CacheStats, StatsContext};
use crate::cache::partition::{
    L2Mode, Partition, PartitionLookup, PartitionUsage, Placement, StoreReport,
};
use crate::cache::policy::{EvictionEngine, EvictionPolicy, HybridWeights};
use crate::cache::prefetch::{PrefetchAdvisor, PrefetchConfig};
use crate::cache::remote::{RemoteEntry, RemoteStats, RemoteStore};
use crate::cache::telemetry::{SpanHandle, Telemetry};
use crate::cache::tier::{CacheTier, TierBudget};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// One megabyte
pub const MB: u64 = 1024 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the cache manager
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    /// Total byte budget across all partitions and both local tiers
    pub max_memory_bytes: u64,
    /// Number of independent partitions
    pub partitions: usize,
    /// Share of each partition's budget given to L1
    pub l1_ratio: f64,
    /// Eviction policy
    pub policy: EvictionPolicy,
    /// Weights for the hybrid policy
    pub hybrid_weights: HybridWeights,
    /// TTL applied when a set does not give one (None = never expires)
    pub default_ttl: Option<Duration>,
    /// Compression configuration
    pub compression: CompressionConfig,
    /// Prefetch configuration
    pub prefetch: PrefetchConfig,
    /// First re-probe delay after the remote tier fails
    pub remote_probe_initial: Duration,
    /// Ceiling for the re-probe delay
    pub remote_probe_max: Duration,
    /// Event channel capacity
    pub event_channel_capacity: usize,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 1024 * MB,
            partitions: 16,
            l1_ratio: 0.2,
            policy: EvictionPolicy::Hybrid,
            hybrid_weights: HybridWeights::default(),
            default_ttl: Some(Duration::from_secs(3600)),
            compression: CompressionConfig::default(),
            prefetch: PrefetchConfig::default(),
            remote_probe_initial: Duration::from_secs(1),
            remote_probe_max: Duration::from_secs(30),
            event_channel_capacity: 1024,
        }
    }
}

impl CacheManagerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::Configuration("partitions must be at least 1".into()));
        }
        if self.max_memory_bytes == 0 {
            return Err(Error::Configuration("max memory must be greater than 0".into()));
        }
        if !(0.0..=1.0).contains(&self.l1_ratio) {
            return Err(Error::Configuration(format!(
                "l1 ratio must be within [0, 1], got {}",
                self.l1_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.prefetch.threshold) {
            return Err(Error::Configuration(format!(
                "prefetch threshold must be within [0, 1], got {}",
                self.prefetch.threshold
            )));
        }
        self.compression.validate()
    }
}

// =============================================================================
// Remote Tier Health
// =============================================================================

struct RemoteTier {
    store: Arc<dyn RemoteStore>,
    healthy: AtomicBool,
    next_probe_ms: AtomicI64,
    backoff: SyncMutex<ExponentialBackoff>,
}

impl RemoteTier {
    fn new(store: Arc<dyn RemoteStore>, initial: Duration, max: Duration) -> Self {
        let backoff = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };
        Self {
            store,
            healthy: AtomicBool::new(true),
            next_probe_ms: AtomicI64::new(0),
            backoff: SyncMutex::new(backoff),
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn next_delay_ms(&self) -> i64 {
        let mut backoff = self.backoff.lock();
        backoff
            .next_backoff()
            .unwrap_or(backoff.max_interval)
            .as_millis() as i64
    }

    /// Returns true on the healthy -> down transition
    fn mark_down(&self, now_ms: i64) -> bool {
        let transitioned = self.healthy.swap(false, Ordering::AcqRel);
        if transitioned {
            self.backoff.lock().reset();
            self.next_probe_ms
                .store(now_ms + self.next_delay_ms(), Ordering::Release);
        }
        transitioned
    }

    /// Returns true on the down -> healthy transition
    fn mark_up(&self) -> bool {
        let transitioned = !self.healthy.swap(true, Ordering::AcqRel);
        if transitioned {
            self.backoff.lock().reset();
        }
        transitioned
    }

    /// Claim the next probe slot; only one caller wins per slot
    fn claim_probe(&self, now_ms: i64) -> bool {
        let due = self.next_probe_ms.load(Ordering::Acquire);
        if now_ms < due {
            return false;
        }
        let next = now_ms + self.next_delay_ms();
        self.next_probe_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Multi-tier, partitioned cache
pub struct CacheManager {
    config: CacheManagerConfig,
    partitions: Vec<Mutex<Partition>>,
    budget: TierBudget,
    engine: EvictionEngine,
    codec: KeyCodec,
    compression: CompressionManager,
    advisor: PrefetchAdvisor,
    metrics: CacheMetrics,
    remote: RwLock<Option<Arc<RemoteTier>>>,
    telemetry: Option<Arc<dyn Telemetry>>,
    event_tx: broadcast::Sender<CacheEvent>,
}

impl CacheManager {
    /// Create a cache with in-process tiers only
    pub fn new(config: CacheManagerConfig) -> Result<Self> {
        config.validate()?;

        let budget = TierBudget::split(config.max_memory_bytes, config.partitions, config.l1_ratio);
        let partitions = (0..config.partitions)
            .map(|id| Mutex::new(Partition::new(id, budget)))
            .collect();
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        info!(
            policy = %config.policy,
            partitions = config.partitions,
            l1_bytes_per_partition = budget.l1_bytes,
            l2_bytes_per_partition = budget.l2_bytes,
            "Cache manager initialized"
        );

        Ok(Self {
            engine: EvictionEngine::with_weights(config.policy, config.hybrid_weights),
            codec: KeyCodec::new(),
            compression: CompressionManager::with_config(config.compression.clone()),
            advisor: PrefetchAdvisor::with_config(config.prefetch.clone()),
            metrics: CacheMetrics::new(),
            remote: RwLock::new(None),
            telemetry: None,
            partitions,
            budget,
            config,
            event_tx,
        })
    }

    /// Create a cache whose L2 tier is delegated to a remote store
    pub fn with_remote(config: CacheManagerConfig, store: Arc<dyn RemoteStore>) -> Result<Self> {
        let manager = Self::new(config)?;
        info!(backend = store.name(), "Remote L2 tier enabled");
        *manager.remote.write() = Some(Arc::new(RemoteTier::new(
            store,
            manager.config.remote_probe_initial,
            manager.config.remote_probe_max,
        )));
        Ok(manager)
    }

    /// Attach a telemetry sink
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &CacheManagerConfig {
        &self.config
    }

    /// Key codec used by this cache
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Build a cache key for a payload
    pub fn key_for<T: Serialize + ?Sized>(
        &self,
        data: &T,
        operation: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<String> {
        self.codec.key(data, operation, namespace)
    }

    /// Partition owning a key
    pub fn partition_of(&self, key: &str) -> usize {
        keys::partition_of(key, self.partitions.len())
    }

    /// Per-tier byte budgets of one partition
    pub fn budget(&self) -> TierBudget {
        self.budget
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.event_tx.subscribe()
    }

    fn emit_event(&self, event: CacheEvent) {
        let _ = self.event_tx.send(event);
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look a key up. Absent, expired and unreadable entries all yield `None`.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let started = Instant::now();
        let span = self.span("cache.get");
        self.maybe_recover_remote().await;

        let now = Utc::now();
        let found = self.lookup(key, now).await;
        self.metrics.record_get_latency(started.elapsed());

        match found {
            Some((tier, bytes)) => {
                self.finish_span(span, "hit", Some(tier));
                Some(bytes)
            }
            None => {
                self.finish_span(span, "miss", None);
                None
            }
        }
    }

    /// Look a key up and deserialize it from JSON
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolve a key to its decompressed value. Entries that fail to
    /// decompress are removed from every tier and count as a miss.
    async fn lookup(&self, key: &str, now: DateTime<Utc>) -> Option<(CacheTier, Bytes)> {
        let pid = self.partition_of(key);
        let remote = self.active_remote();
        let mode = Self::mode(&remote);

        let mut partition = self.partitions[pid].lock().await;
        let before = partition.usage();
        let ratio = self.advisor.record_access(key, now.timestamp_millis());

        let mut expired = false;
        let found = match partition.lookup(key, now) {
            PartitionLookup::Hit { tier, data, .. } => 'hit: {
                let bytes = match self.compression.decompress(&data.bytes, data.algorithm) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.drop_unreadable(&mut partition, remote.as_ref(), key, &e)
                            .await;
                        break 'hit None;
                    }
                };
                let mut promoted = false;
                if tier == CacheTier::L2 && self.advisor.should_promote(ratio) {
                    match partition.promote(key, mode, &self.engine, now) {
                        Ok(report) => {
                            promoted = true;
                            self.record_promotion(key, data.stored_size());
                            self.settle(&mut partition, report, now).await;
                        }
                        Err(reason) => {
                            debug!(key = %key, reason = ?reason, "Promotion skipped");
                            self.advisor.record_skip();
                        }
                    }
                }
                self.metrics.tier(tier).record_hit();
                debug!(key = %key, tier = %tier, promoted = promoted, "Cache hit");
                self.emit_event(CacheEvent::hit(key, tier, promoted));
                Some((tier, bytes))
            }
            PartitionLookup::Expired(entry) => {
                debug!(key = %key, tier = %entry.tier, "Entry expired");
                self.metrics.record_expirations(1);
                self.advisor.forget(key);
                expired = true;
                None
            }
            PartitionLookup::Miss => match remote {
                Some(remote) => self.lookup_remote(&mut partition, &remote, key, ratio, now).await,
                None => None,
            },
        };

        if found.is_none() {
            self.metrics.record_miss();
            self.emit_event(CacheEvent::miss(key, expired));
        }
        self.metrics.apply_usage(&before, &partition.usage());
        found
    }

    async fn lookup_remote(
        &self,
        partition: &mut Partition,
        remote: &Arc<RemoteTier>,
        key: &str,
        ratio: f64,
        now: DateTime<Utc>,
    ) -> Option<(CacheTier, Bytes)> {
        let fetched = match remote.store.get(key).await {
            Ok(fetched) => fetched?,
            Err(e) => {
                self.remote_failed(remote, &e);
                return None;
            }
        };

        let data = fetched.data.clone();
        let bytes = match self.compression.decompress(&data.bytes, data.algorithm) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.drop_unreadable(partition, Some(remote), key, &e).await;
                return None;
            }
        };
        let mut promoted = false;
        if self.advisor.should_promote(ratio) {
            let seq = partition.tick();
            let entry = fetched.into_entry(key, partition.id(), seq);
            match partition.admit_remote(entry, &self.engine, now) {
                Some(report) => {
                    promoted = true;
                    self.record_promotion(key, data.stored_size());
                    self.settle(partition, report, now).await;
                }
                None => self.advisor.record_skip(),
            }
        }

        self.metrics.record_remote_hit();
        debug!(key = %key, backend = remote.store.name(), promoted = promoted, "Remote hit");
        self.emit_event(CacheEvent::hit(key, CacheTier::L2, promoted));
        Some((CacheTier::L2, bytes))
    }

    async fn drop_unreadable(
        &self,
        partition: &mut Partition,
        remote: Option<&Arc<RemoteTier>>,
        key: &str,
        error: &Error,
    ) {
        warn!(key = %key, error = %error, "Dropping unreadable cache entry");
        self.metrics.record_error();
        self.advisor.forget(key);
        partition.remove(key);
        if let Some(remote) = remote {
            if let Err(e) = remote.store.delete(key).await {
                self.remote_failed(remote, &e);
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store a value under the default TTL
    pub async fn set(&self, key: &str, value: impl AsRef<[u8]>) -> Result<()> {
        self.set_with_ttl(key, value, None).await
    }

    /// Store a value serialized as JSON
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set_with_ttl(key, bytes, ttl).await
    }

    /// Store a value. `ttl = None` applies the configured default TTL.
    ///
    /// Fails only when the value can never fit a tier budget.
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let started = Instant::now();
        let span = self.span("cache.set");
        let value = value.as_ref();

        let outcome = self.compression.compress_value(value);
        if let Some(error) = outcome.failure {
            self.emit_event(CacheEvent::CompressionFailed {
                key: key.to_string(),
                algorithm: self.compression.config().algorithm.to_string(),
                error,
            });
        }
        let data = CacheData::stored(outcome.bytes, value.len() as u64, outcome.algorithm);
        let ttl = ttl.or(self.config.default_ttl);

        self.maybe_recover_remote().await;
        let result = self.store(key, data, ttl).await;

        self.metrics.record_set_latency(started.elapsed());
        match &result {
            Ok(tier) => {
                self.metrics.record_set();
                self.finish_span(span, "set", Some(*tier));
            }
            Err(e) => {
                self.metrics.record_error();
                warn!(key = %key, error = %e, "Cache set failed");
                self.finish_span(span, "error", None);
            }
        }
        result.map(|_| ())
    }

    async fn store(&self, key: &str, data: CacheData, ttl: Option<Duration>) -> Result<CacheTier> {
        let pid = self.partition_of(key);
        let remote = self.active_remote();
        let mode = Self::mode(&remote);
        let size = data.stored_size();
        let compressed = data.compressed();

        if mode == L2Mode::Local && size > self.budget.l1_bytes.max(self.budget.l2_bytes) {
            return Err(Error::EntryTooLarge {
                key: key.to_string(),
                size,
                capacity: self.budget.l1_bytes.max(self.budget.l2_bytes),
            });
        }
        if mode == L2Mode::Local && self.remote_configured() {
            self.metrics.record_remote_fallback();
        }

        let now = Utc::now();
        let mut partition = self.partitions[pid].lock().await;
        let before = partition.usage();

        // Overwrite: drop every existing copy first
        partition.remove(key);
        let seq = partition.tick();
        let entry = CacheEntry::new(key, data, pid, ttl, seq);

        let result = match partition.place(entry, mode, &self.engine, now) {
            Ok(Placement::Stored(report)) => {
                let tier = report.tier.unwrap_or(CacheTier::L1);
                self.settle(&mut partition, report, now).await;
                if let Some(remote) = &remote {
                    // A stale copy may still live remotely
                    if let Err(e) = remote.store.delete(key).await {
                        self.remote_failed(remote, &e);
                    }
                }
                Ok((tier, false))
            }
            Ok(Placement::Remote(entry)) => {
                self.store_remote(&mut partition, remote.as_ref(), entry, now)
                    .await
            }
            Err(e) => Err(e),
        };

        self.metrics.apply_usage(&before, &partition.usage());
        drop(partition);

        let (tier, on_remote) = result?;
        debug!(key = %key, tier = %tier, remote = on_remote, size = size, "Cache set");
        self.emit_event(CacheEvent::Set {
            key: key.to_string(),
            tier,
            remote: on_remote,
            size_bytes: size,
            compressed,
        });
        Ok(tier)
    }

    async fn store_remote(
        &self,
        partition: &mut Partition,
        remote: Option<&Arc<RemoteTier>>,
        entry: CacheEntry,
        now: DateTime<Utc>,
    ) -> Result<(CacheTier, bool)> {
        if let Some(remote) = remote {
            match remote
                .store
                .put(&entry.key, &RemoteEntry::from_entry(&entry, now))
                .await
            {
                Ok(()) => return Ok((CacheTier::L2, true)),
                Err(e) => self.remote_failed(remote, &e),
            }
        }

        // Remote refused the write: keep the value in process
        self.metrics.record_remote_fallback();
        match partition.place(entry, L2Mode::Local, &self.engine, now)? {
            Placement::Stored(report) => {
                let tier = report.tier.unwrap_or(CacheTier::L2);
                self.settle(partition, report, now).await;
                Ok((tier, false))
            }
            Placement::Remote(entry) => Err(Error::Internal(format!(
                "local placement handed {} back to the remote tier",
                entry.key
            ))),
        }
    }

    /// Account for evictions and demotions, and push spilled L1 entries to
    /// the remote tier (falling back to local L2).
    async fn settle(&self, partition: &mut Partition, report: StoreReport, now: DateTime<Utc>) {
        self.record_report(&report, false);

        for entry in report.spilled {
            if let Some(remote) = self.active_remote() {
                match remote
                    .store
                    .put(&entry.key, &RemoteEntry::from_entry(&entry, now))
                    .await
                {
                    Ok(()) => {
                        self.metrics.l1.record_demotions(1);
                        self.emit_event(CacheEvent::Demote {
                            key: entry.key.clone(),
                            size_bytes: entry.size_bytes(),
                            remote: true,
                        });
                        continue;
                    }
                    Err(e) => self.remote_failed(&remote, &e),
                }
            }
            let fallback = partition.accept_demoted(entry, &self.engine, now);
            self.record_report(&fallback, true);
        }
    }

    fn record_report(&self, report: &StoreReport, fallback: bool) {
        let policy = self.engine.policy();
        for victim in &report.evicted {
            self.metrics.record_evictions(policy, victim.tier, 1);
            self.advisor.forget(&victim.key);
            debug!(key = %victim.key, tier = %victim.tier, policy = %policy, "Evicted cache entry");
            self.emit_event(CacheEvent::evict(&victim.key, victim.tier, victim.size_bytes(), policy));
        }
        if !report.demoted.is_empty() {
            self.metrics.l1.record_demotions(report.demoted.len() as u64);
            if fallback {
                self.metrics.record_remote_fallback();
            }
        }
        for (key, size) in &report.demoted {
            self.emit_event(CacheEvent::Demote {
                key: key.clone(),
                size_bytes: *size,
                remote: false,
            });
        }
    }

    fn record_promotion(&self, key: &str, size: u64) {
        self.metrics.l1.record_promotion();
        self.advisor.record_promotion();
        debug!(key = %key, size = size, "Promoted entry to L1");
        self.emit_event(CacheEvent::Promote {
            key: key.to_string(),
            size_bytes: size,
        });
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove one key from every tier, returning whether it existed
    pub async fn delete(&self, key: &str) -> bool {
        let pid = self.partition_of(key);
        let remote = self.active_remote();

        let mut partition = self.partitions[pid].lock().await;
        let before = partition.usage();
        let mut existed = !partition.remove(key).is_empty();
        if let Some(remote) = &remote {
            match remote.store.delete(key).await {
                Ok(removed) => existed |= removed,
                Err(e) => self.remote_failed(remote, &e),
            }
        }
        self.metrics.apply_usage(&before, &partition.usage());
        drop(partition);

        self.advisor.forget(key);
        if existed {
            self.metrics.record_delete();
            self.emit_event(CacheEvent::Delete {
                key: key.to_string(),
            });
        }
        existed
    }

    /// Delete every key matching a glob pattern across all partitions, both
    /// tiers and the remote tier. Returns the number of distinct keys removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let compiled = KeyPattern::new(pattern)?;
        let mut removed: HashSet<String> = HashSet::new();

        for slot in &self.partitions {
            let mut partition = slot.lock().await;
            let before = partition.usage();
            for entry in partition.remove_matching(&compiled) {
                self.advisor.forget(&entry.key);
                removed.insert(entry.key);
            }
            self.metrics.apply_usage(&before, &partition.usage());
        }

        if let Some(remote) = self.active_remote() {
            match remote.store.delete_matching(&compiled).await {
                Ok(keys) => removed.extend(keys),
                Err(e) => self.remote_failed(&remote, &e),
            }
        }

        let count = removed.len();
        self.metrics.record_invalidation(count as u64);
        info!(pattern = %pattern, removed = count, "Invalidated cache pattern");
        self.emit_event(CacheEvent::Invalidate {
            pattern: pattern.to_string(),
            removed: count,
        });
        Ok(count)
    }

    /// Drop every entry. Lifetime counters are kept.
    pub async fn flush(&self) {
        let removed = self.clear_local().await;

        if let Some(remote) = self.active_remote() {
            if let Err(e) = remote.store.clear().await {
                self.remote_failed(&remote, &e);
            }
        }

        self.metrics.record_flush();
        info!(entries_removed = removed, "Cache flushed");
        self.emit_event(CacheEvent::Flush {
            entries_removed: removed,
        });
    }

    async fn clear_local(&self) -> usize {
        let mut removed = 0;
        for slot in &self.partitions {
            let mut partition = slot.lock().await;
            let before = partition.usage();
            removed += partition.clear();
            self.metrics.apply_usage(&before, &partition.usage());
        }
        self.advisor.clear();
        removed
    }

    /// Remove every expired entry now, returning how many were dropped
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = 0;
        for slot in &self.partitions {
            let mut partition = slot.lock().await;
            let before = partition.usage();
            for entry in partition.purge_expired(now) {
                self.advisor.forget(&entry.key);
                purged += 1;
            }
            self.metrics.apply_usage(&before, &partition.usage());
        }
        if purged > 0 {
            self.metrics.record_expirations(purged as u64);
            debug!(purged = purged, "Purged expired entries");
        }
        purged
    }

    /// Promote the listed keys into L1 now. Returns how many were promoted.
    pub async fn prefetch<S: AsRef<str>>(&self, keys: &[S]) -> usize {
        let now = Utc::now();
        let mut promoted = 0;

        for key in keys.iter().map(AsRef::as_ref) {
            let pid = self.partition_of(key);
            let remote = self.active_remote();
            let mode = Self::mode(&remote);

            let mut partition = self.partitions[pid].lock().await;
            let before = partition.usage();

            let report = match partition.tier_of(key) {
                Some(CacheTier::L2) => partition.promote(key, mode, &self.engine, now).ok(),
                Some(CacheTier::L1) => None,
                None => match &remote {
                    Some(remote) => match remote.store.get(key).await {
                        Ok(Some(fetched)) => {
                            let seq = partition.tick();
                            let entry = fetched.into_entry(key, pid, seq);
                            partition.admit_remote(entry, &self.engine, now)
                        }
                        Ok(None) => None,
                        Err(e) => {
                            self.remote_failed(remote, &e);
                            None
                        }
                    },
                    None => None,
                },
            };

            if let Some(report) = report {
                let size = partition
                    .store(CacheTier::L1)
                    .get(key)
                    .map(|e| e.size_bytes())
                    .unwrap_or(0);
                self.record_promotion(key, size);
                self.settle(&mut partition, report, now).await;
                promoted += 1;
            }
            self.metrics.apply_usage(&before, &partition.usage());
        }

        promoted
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of all counters
    pub fn get_stats(&self) -> CacheStats {
        let partitions = self.partitions.len() as u64;
        let stats = self.metrics.snapshot(StatsContext {
            policy: self.engine.policy(),
            partitions: self.partitions.len(),
            l1_capacity: self.budget.l1_bytes * partitions,
            l2_capacity: self.budget.l2_bytes * partitions,
            compression: self.compression.stats(),
            prefetch: self.advisor.stats(),
            remote: self.remote_stats(),
        });

        if let Some(telemetry) = &self.telemetry {
            if let Err(e) = telemetry.publish_stats(&stats) {
                debug!(error = %e, "Telemetry stats export failed");
            }
        }
        stats
    }

    /// Occupancy of every partition
    pub async fn partition_usage(&self) -> Vec<PartitionUsage> {
        let mut usage = Vec::with_capacity(self.partitions.len());
        for slot in &self.partitions {
            usage.push(slot.lock().await.usage());
        }
        usage
    }

    /// Whether the remote tier is serving (None when none is configured)
    pub fn remote_healthy(&self) -> Option<bool> {
        self.remote().map(|r| r.is_healthy())
    }

    fn remote_stats(&self) -> Option<RemoteStats> {
        let remote = self.remote()?;
        let (hits, errors, fallbacks) = self.metrics.remote_counters();
        Some(RemoteStats {
            backend: remote.store.name().to_string(),
            healthy: remote.is_healthy(),
            hits,
            errors,
            fallbacks,
        })
    }

    /// Drop in-process state and detach the remote tier
    pub async fn close(&self) {
        let removed = self.clear_local().await;
        if self.remote.write().take().is_some() {
            info!("Remote L2 tier detached");
        }
        info!(entries_removed = removed, "Cache manager closed");
    }

    // =========================================================================
    // Remote Tier
    // =========================================================================

    fn remote(&self) -> Option<Arc<RemoteTier>> {
        self.remote.read().clone()
    }

    fn remote_configured(&self) -> bool {
        self.remote.read().is_some()
    }

    fn active_remote(&self) -> Option<Arc<RemoteTier>> {
        self.remote().filter(|r| r.is_healthy())
    }

    fn mode(remote: &Option<Arc<RemoteTier>>) -> L2Mode {
        if remote.is_some() {
            L2Mode::Remote
        } else {
            L2Mode::Local
        }
    }

    fn remote_failed(&self, remote: &RemoteTier, error: &Error) {
        self.metrics.record_remote_error();
        if remote.mark_down(Utc::now().timestamp_millis()) {
            warn!(
                backend = remote.store.name(),
                error = %error,
                "Remote L2 tier unavailable, serving from in-process L2"
            );
            self.emit_event(CacheEvent::RemoteUnavailable {
                backend: remote.store.name().to_string(),
                reason: error.to_string(),
            });
        }
    }

    async fn maybe_recover_remote(&self) {
        let Some(remote) = self.remote() else {
            return;
        };
        if remote.is_healthy() || !remote.claim_probe(Utc::now().timestamp_millis()) {
            return;
        }

        match remote.store.health_check().await {
            Ok(()) => {
                if remote.mark_up() {
                    info!(backend = remote.store.name(), "Remote L2 tier recovered");
                    self.emit_event(CacheEvent::RemoteRecovered {
                        backend: remote.store.name().to_string(),
                    });
                }
            }
            Err(e) => {
                self.metrics.record_remote_error();
                debug!(backend = remote.store.name(), error = %e, "Remote L2 probe failed");
            }
        }
    }

    // =========================================================================
    // Telemetry
    // =========================================================================

    fn span(&self, name: &str) -> Option<SpanHandle> {
        let telemetry = self.telemetry.as_ref()?;
        match telemetry.start_span(name) {
            Ok(span) => Some(span),
            Err(e) => {
                debug!(span = name, error = %e, "Telemetry span start failed");
                None
            }
        }
    }

    fn finish_span(&self, span: Option<SpanHandle>, outcome: &str, tier: Option<CacheTier>) {
        let (Some(telemetry), Some(mut span)) = (self.telemetry.as_ref(), span) else {
            return;
        };
        let tier_label = tier.map(|t| t.to_string().to_lowercase()).unwrap_or_default();
        let metric = format!("cache.{}", outcome);

        let result = telemetry
            .set_span_attribute(&mut span, "outcome", outcome)
            .and_then(|_| telemetry.record_metric(&metric, 1.0, &[("tier", tier_label.as_str())]))
            .and_then(|_| telemetry.end_span(span));
        if let Err(e) = result {
            debug!(outcome = outcome, error = %e, "Telemetry export failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CompressionAlgorithm;
    use crate::cache::remote::InMemoryRemote;
    use crate::cache::telemetry::NoopTelemetry;
    use assert_matches::assert_matches;

    fn small_config(policy: EvictionPolicy) -> CacheManagerConfig {
        CacheManagerConfig {
            max_memory_bytes: 4096,
            partitions: 1,
            l1_ratio: 0.25,
            policy,
            default_ttl: None,
            compression: CompressionConfig {
                threshold_bytes: u64::MAX,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheManagerConfig::default().validate().is_ok());
        let bad = CacheManagerConfig {
            partitions: 0,
            ..Default::default()
        };
        assert_matches!(bad.validate(), Err(Error::Configuration(_)));
        let bad = CacheManagerConfig {
            l1_ratio: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_roundtrip_and_overwrite() {
        let cache = CacheManager::new(small_config(EvictionPolicy::Lru)).unwrap();
        cache.set("k", b"one").await.unwrap();
        cache.set("k", b"two!").await.unwrap();
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"two!")));

        let stats = cache.get_stats();
        assert_eq!(stats.current_items(), 1);
        assert_eq!(stats.current_memory_bytes(), 4);
        assert_eq!(stats.sets, 2);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let config = CacheManagerConfig {
            compression: CompressionConfig {
                threshold_bytes: 16,
                ..Default::default()
            },
            ..small_config(EvictionPolicy::Lru)
        };
        let cache = CacheManager::new(config).unwrap();
        let value = "abcdefgh".repeat(64);
        cache.set("big", value.as_bytes()).await.unwrap();

        assert_eq!(cache.get("big").await.unwrap(), Bytes::from(value.clone()));
        let stats = cache.get_stats();
        assert_eq!(stats.compression.compressed_values, 1);
        assert!(stats.current_memory_bytes() < value.len() as u64);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Reply {
            text: String,
            tokens: u32,
        }

        let cache = CacheManager::new(small_config(EvictionPolicy::Lru)).unwrap();
        let reply = Reply {
            text: "hi".into(),
            tokens: 3,
        };
        cache.set_json("r", &reply, None).await.unwrap();
        assert_eq!(cache.get_json::<Reply>("r").await.unwrap(), Some(reply));
        assert_eq!(cache.get_json::<Reply>("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entry_too_large() {
        let cache = CacheManager::new(small_config(EvictionPolicy::Lru)).unwrap();
        let huge = vec![0u8; 5000];
        assert_matches!(
            cache.set("huge", &huge).await,
            Err(Error::EntryTooLarge { size: 5000, .. })
        );
        assert_eq!(cache.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_l2_hits_promote_to_l1() {
        let config = CacheManagerConfig {
            prefetch: PrefetchConfig {
                threshold: 0.25,
                ..Default::default()
            },
            ..small_config(EvictionPolicy::Lru)
        };
        let cache = CacheManager::new(config).unwrap();
        let l1_budget = cache.budget().l1_bytes as usize;

        cache.set("fill", vec![1u8; l1_budget]).await.unwrap();
        cache.set("warm", vec![2u8; 100]).await.unwrap();

        let mut events = cache.subscribe();
        for _ in 0..3 {
            assert!(cache.get("warm").await.is_some());
        }

        let usage = &cache.partition_usage().await[0];
        assert_eq!(usage.l1_items, 1);
        assert_eq!(usage.l2_items, 1);
        assert!(usage.within_budget());

        let stats = cache.get_stats();
        assert_eq!(stats.l1.promotions, 1);
        assert_eq!(stats.l1.demotions, 1);
        assert_eq!(stats.prefetch.promotions, 1);

        let mut promoted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CacheEvent::Promote { ref key, .. } if key == "warm") {
                promoted = true;
            }
        }
        assert!(promoted);
    }

    #[tokio::test]
    async fn test_explicit_prefetch() {
        let cache = CacheManager::new(small_config(EvictionPolicy::Lru)).unwrap();
        let l1_budget = cache.budget().l1_bytes as usize;
        cache.set("fill", vec![1u8; l1_budget]).await.unwrap();
        cache.set("cold", vec![2u8; 10]).await.unwrap();

        assert_eq!(cache.prefetch(&["cold", "missing"]).await, 1);
        let usage = &cache.partition_usage().await[0];
        assert_eq!(usage.l1_items, 1);
        assert_eq!(usage.l1_bytes, 10);
        assert_eq!(usage.l2_items, 1);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let cache = CacheManager::new(small_config(EvictionPolicy::Lru)).unwrap();
        cache.set("a", b"1").await.unwrap();
        cache
            .set_with_ttl("short", b"2", Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.get_stats().current_items(), 0);
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let cache = CacheManager::new(small_config(EvictionPolicy::Lru)).unwrap();
        let err = cache.invalidate_pattern("ns:[oops").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
        assert_eq!(cache.invalidate_pattern("nothing:*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_tier_roundtrip_and_fallback() {
        let remote = Arc::new(InMemoryRemote::new());
        let config = CacheManagerConfig {
            remote_probe_initial: Duration::from_millis(10),
            remote_probe_max: Duration::from_millis(20),
            ..small_config(EvictionPolicy::Lru)
        };
        let cache = CacheManager::with_remote(config, remote.clone()).unwrap();
        let l1_budget = cache.budget().l1_bytes as usize;

        cache.set("local", vec![1u8; l1_budget]).await.unwrap();
        cache.set("shared", b"remote value").await.unwrap();
        assert!(remote.contains("shared"));
        assert_eq!(cache.get("shared").await, Some(Bytes::from_static(b"remote value")));

        let mut events = cache.subscribe();
        remote.set_available(false);
        cache.set("during-outage", b"x").await.unwrap();
        assert_eq!(cache.remote_healthy(), Some(false));
        assert_eq!(cache.get("during-outage").await, Some(Bytes::from_static(b"x")));
        assert_matches!(events.try_recv(), Ok(CacheEvent::RemoteUnavailable { .. }));

        remote.set_available(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get("local").await;
        assert_eq!(cache.remote_healthy(), Some(true));

        let stats = cache.get_stats();
        let remote_stats = stats.remote.unwrap();
        assert_eq!(remote_stats.backend, "memory");
        assert!(remote_stats.errors >= 1);
        assert!(remote_stats.fallbacks >= 1);
    }

    fn corrupt_deflate() -> CacheData {
        CacheData::stored(Bytes::from_static(&[0xff; 16]), 64, CompressionAlgorithm::Deflate)
    }

    #[tokio::test]
    async fn test_unreadable_remote_entry_is_a_miss_and_removed() {
        let remote = Arc::new(InMemoryRemote::new());
        remote
            .put(
                "bad",
                &RemoteEntry {
                    data: corrupt_deflate(),
                    created_at: Utc::now(),
                    ttl_remaining: None,
                },
            )
            .await
            .unwrap();
        let cache = CacheManager::with_remote(small_config(EvictionPolicy::Lru), remote.clone())
            .unwrap();

        assert_eq!(cache.get("bad").await, None);
        assert!(!remote.contains("bad"));
        assert_eq!(cache.get("bad").await, None);

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hit_ratio, 0.0);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.remote.unwrap().hits, 0);
    }

    #[tokio::test]
    async fn test_unreadable_local_entry_is_dropped() {
        let cache = CacheManager::new(small_config(EvictionPolicy::Lru)).unwrap();
        cache.set("good", b"fine").await.unwrap();
        {
            let mut partition = cache.partitions[0].lock().await;
            let before = partition.usage();
            let seq = partition.tick();
            let entry = CacheEntry::new("bad", corrupt_deflate(), 0, None, seq);
            partition
                .place(entry, L2Mode::Local, &cache.engine, Utc::now())
                .unwrap();
            cache.metrics.apply_usage(&before, &partition.usage());
        }
        assert_eq!(cache.get_stats().current_items(), 2);

        assert_eq!(cache.get("bad").await, None);
        assert_eq!(cache.get("good").await, Some(Bytes::from_static(b"fine")));

        let stats = cache.get_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_ratio - 0.5).abs() < 1e-9);
        assert_eq!(stats.current_items(), 1);
        assert_eq!(stats.current_memory_bytes(), 4);
    }

    #[tokio::test]
    async fn test_telemetry_is_optional() {
        let cache = CacheManager::new(small_config(EvictionPolicy::Lru))
            .unwrap()
            .with_telemetry(Arc::new(NoopTelemetry::default()));
        cache.set("k", b"v").await.unwrap();
        assert!(cache.get("k").await.is_some());
    }

    #[tokio::test]
    async fn test_close_clears_local_state() {
        let cache = CacheManager::with_remote(
            small_config(EvictionPolicy::Lru),
            Arc::new(InMemoryRemote::new()),
        )
        .unwrap();
        cache.set("k", b"v").await.unwrap();
        cache.close().await;
        assert_eq!(cache.remote_healthy(), None);
        assert!(cache.get("k").await.is_none());
    }
}
