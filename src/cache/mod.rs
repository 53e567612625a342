//! Multi-Tier Response Cache
//!
//! A partitioned two-tier cache for generated model responses:
//! - **L1**: small, hot, in-process tier
//! - **L2**: larger warm tier, in-process or delegated to Redis
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Cache Manager                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │   KeyCodec ──► partition_of(key) ──► Partition[i] (async mutex)          │
//! │                                       ┌──────────┐   ┌────────────────┐  │
//! │   CompressionManager                  │    L1    │◄─►│  L2 (local or  │  │
//! │   PrefetchAdvisor                     │ IndexMap │   │  RemoteStore)  │  │
//! │   EvictionEngine                      └──────────┘   └────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  CacheMetrics (atomics) ──► CacheStats ──► Telemetry / Monitor / API     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ngx_cache::cache::{CacheManager, CacheManagerConfig};
//!
//! let cache = CacheManager::new(CacheManagerConfig::default())?;
//! let key = cache.key_for(&serde_json::json!({"prompt": "hi"}), Some("user_1"), Some("generate_content"))?;
//!
//! cache.set(&key, b"hello").await?;
//! assert_eq!(cache.get(&key).await.as_deref(), Some(&b"hello"[..]));
//!
//! cache.invalidate_pattern("vertex:generate_content:user_1:*").await?;
//! println!("hit ratio {:.2}", cache.get_stats().hit_ratio);
//! ```

pub mod compression;
pub mod entry;
pub mod events;
pub mod keys;
pub mod manager;
pub mod metrics;
pub mod partition;
pub mod policy;
pub mod prefetch;
pub mod remote;
pub mod telemetry;
pub mod tier;

// Re-export main types
pub use compression::{CompressionConfig, CompressionManager, Compressor};
pub use entry::{CacheData, CacheEntry, CompressionAlgorithm};
pub use events::CacheEvent;
pub use keys::{KeyCodec, KeyPattern};
pub use manager::{CacheManager, CacheManagerConfig};
pub use metrics::{CacheMetrics, CacheStats, TierStats};
pub use partition::PartitionUsage;
pub use policy::{EvictionEngine, EvictionPolicy, HybridWeights};
pub use prefetch::{PrefetchAdvisor, PrefetchConfig};
pub use remote::{InMemoryRemote, RedisConfig, RedisStore, RemoteStore};
pub use telemetry::{NoopTelemetry, PrometheusTelemetry, Telemetry};
pub use tier::{CacheTier, TierBudget};

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// =============================================================================
// CacheStore Trait (Port)
// =============================================================================

/// Port for cache consumers.
///
/// The generation layer and the API depend on this trait rather than on
/// [`CacheManager`] so either side can be tested against a stub.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a key; absent, expired and unreadable entries are `None`
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Store a value; `None` applies the default TTL
    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Remove one key
    async fn delete(&self, key: &str) -> bool;

    /// Remove every key matching a glob pattern
    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize>;

    /// Drop every entry
    async fn flush(&self);

    /// Current statistics
    fn stats(&self) -> CacheStats;

    /// Key codec shared with producers of cache keys
    fn codec(&self) -> &KeyCodec;
}

/// Type alias for Arc'd CacheStore
pub type CacheStoreRef = Arc<dyn CacheStore>;

#[async_trait]
impl CacheStore for CacheManager {
    async fn get(&self, key: &str) -> Option<Bytes> {
        CacheManager::get(self, key).await
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        CacheManager::set_with_ttl(self, key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> bool {
        CacheManager::delete(self, key).await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        CacheManager::invalidate_pattern(self, pattern).await
    }

    async fn flush(&self) {
        CacheManager::flush(self).await
    }

    fn stats(&self) -> CacheStats {
        self.get_stats()
    }

    fn codec(&self) -> &KeyCodec {
        CacheManager::codec(self)
    }
}

// =============================================================================
// Construction
// =============================================================================

impl CacheManager {
    /// Build a cache, attaching Redis as the L2 tier when configured.
    ///
    /// An unreachable Redis at startup is not fatal: the cache runs with
    /// in-process tiers only. A malformed Redis URL is.
    pub async fn connect(config: CacheManagerConfig, redis: Option<RedisConfig>) -> Result<Self> {
        let Some(redis) = redis else {
            return Self::new(config);
        };

        match RedisStore::connect(redis).await {
            Ok(store) => Self::with_remote(config, Arc::new(store)),
            Err(e @ Error::Configuration(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Redis unavailable at startup, continuing with in-process L2");
                Self::new(config)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
