//! Remote L2 Tier
//!
//! When Redis is enabled the L2 tier of every partition is delegated to a
//! shared `RemoteStore`, so several processes see the same entries. Keys
//! keep the local cache key format behind a configurable prefix, which lets
//! `clear` touch only this cache's keys.
//!
//! Entry layout in Redis:
//!
//! ```text
//!   HSET <prefix><key> data <bytes> algo <name> orig <size> created <ms>
//!   PEXPIRE <prefix><key> <ttl ms>
//! ```

use crate::cache::entry::{CacheData, CacheEntry, CompressionAlgorithm};
use crate::cache::keys::KeyPattern;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Remote Entry
// =============================================================================

/// Entry as held by a remote store
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Stored bytes with compression info
    pub data: CacheData,
    /// Original creation time
    pub created_at: DateTime<Utc>,
    /// TTL left at read time (None = never expires)
    pub ttl_remaining: Option<Duration>,
}

impl RemoteEntry {
    /// Snapshot a local entry for writing
    pub fn from_entry(entry: &CacheEntry, now: DateTime<Utc>) -> Self {
        Self {
            data: entry.data.clone(),
            created_at: entry.created_at,
            ttl_remaining: entry.remaining_ttl(now),
        }
    }

    /// Turn a remote entry back into a local one, restarting its TTL clock
    pub fn into_entry(self, key: &str, partition_id: usize, seq: u64) -> CacheEntry {
        CacheEntry::new(key, self.data, partition_id, self.ttl_remaining, seq)
    }
}

// =============================================================================
// RemoteStore Trait
// =============================================================================

/// Shared L2 backend
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Backend name for logs and stats
    fn name(&self) -> &str;

    /// Fetch an entry
    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>>;

    /// Store an entry; an entry whose TTL already ran out is not written
    async fn put(&self, key: &str, entry: &RemoteEntry) -> Result<()>;

    /// Delete one key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key matching the pattern, returning the cache keys removed
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>>;

    /// Delete every key owned by this cache
    async fn clear(&self) -> Result<usize>;

    /// Liveness probe
    async fn health_check(&self) -> Result<()>;
}

/// Remote tier status reported in cache stats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteStats {
    /// Backend name
    pub backend: String,
    /// Whether the manager is currently routing L2 traffic to it
    pub healthy: bool,
    /// Reads served by the remote tier
    pub hits: u64,
    /// Failed remote operations
    pub errors: u64,
    /// Operations served by in-process L2 because the remote was down
    pub fallbacks: u64,
}

// =============================================================================
// Redis Store
// =============================================================================

/// Redis connection settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL
    pub url: String,
    /// Prefix for every key written by this cache
    pub key_prefix: String,
    /// Deadline for establishing the connection
    pub connect_timeout: Duration,
    /// Deadline for a single command round-trip
    pub command_timeout: Duration,
    /// SCAN batch size for pattern deletes
    pub scan_count: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "ngx-cache:".to_string(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(500),
            scan_count: 500,
        }
    }
}

impl RedisConfig {
    /// Config for a URL with default timeouts
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Redis-backed L2 tier
pub struct RedisStore {
    config: RedisConfig,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            Error::Configuration(format!("invalid redis url {:?}: {}", config.url, e))
        })?;
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout {
                operation: "redis.connect".into(),
                duration: config.connect_timeout,
            })??;

        info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis L2 tier");
        Ok(Self { config, conn })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    #[inline]
    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout {
                operation: format!("redis.{}", operation),
                duration: self.config.command_timeout,
            }),
        }
    }

    async fn delete_scanned(&self, match_pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut deleted = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "scan",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(match_pattern)
                        .arg("COUNT")
                        .arg(self.config.scan_count)
                        .query_async(&mut conn),
                )
                .await?;

            if !batch.is_empty() {
                let _: usize = self
                    .run("del", redis::cmd("DEL").arg(&batch).query_async(&mut conn))
                    .await?;
                deleted.extend(batch.into_iter().map(|k| {
                    k.strip_prefix(self.config.key_prefix.as_str())
                        .map(str::to_string)
                        .unwrap_or(k)
                }));
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }
}

/// TTL left according to a PTTL reply. The outer `None` means the key is
/// gone or expires now; `Some(None)` means it never expires.
fn ttl_from_pttl(pttl: i64) -> Option<Option<Duration>> {
    match pttl {
        ms if ms > 0 => Some(Some(Duration::from_millis(ms as u64))),
        -1 => Some(None),
        // 0: expiring this millisecond. -2: vanished between commands.
        _ => None,
    }
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<T> {
    fields
        .get(name)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.parse().ok())
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>> {
        let storage_key = self.storage_key(key);
        let mut conn = self.conn.clone();

        let (fields, pttl): (HashMap<String, Vec<u8>>, i64) = self
            .run(
                "get",
                redis::pipe()
                    .cmd("HGETALL")
                    .arg(&storage_key)
                    .cmd("PTTL")
                    .arg(&storage_key)
                    .query_async(&mut conn),
            )
            .await?;

        let Some(data) = fields.get("data") else {
            return Ok(None);
        };

        let algorithm: CompressionAlgorithm = match parse_field::<String>(&fields, "algo") {
            Some(name) => match name.parse() {
                Ok(algorithm) => algorithm,
                Err(_) => {
                    warn!(key = %key, algo = %name, "Unknown compression in Redis entry, treating as miss");
                    return Ok(None);
                }
            },
            None => CompressionAlgorithm::None,
        };
        let original_size = parse_field(&fields, "orig").unwrap_or(data.len() as u64);
        let created_at = parse_field::<i64>(&fields, "created")
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let Some(ttl_remaining) = ttl_from_pttl(pttl) else {
            return Ok(None);
        };

        Ok(Some(RemoteEntry {
            data: CacheData::stored(Bytes::copy_from_slice(data), original_size, algorithm),
            created_at,
            ttl_remaining,
        }))
    }

    async fn put(&self, key: &str, entry: &RemoteEntry) -> Result<()> {
        if entry.ttl_remaining.is_some_and(|t| t.is_zero()) {
            return Ok(());
        }

        let storage_key = self.storage_key(key);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(&storage_key)
            .ignore()
            .cmd("HSET")
            .arg(&storage_key)
            .arg("data")
            .arg(entry.data.bytes.as_ref())
            .arg("algo")
            .arg(entry.data.algorithm.to_string())
            .arg("orig")
            .arg(entry.data.original_size)
            .arg("created")
            .arg(entry.created_at.timestamp_millis())
            .ignore();
        if let Some(ttl) = entry.ttl_remaining {
            pipe.cmd("PEXPIRE")
                .arg(&storage_key)
                .arg(ttl.as_millis() as u64)
                .ignore();
        }

        let _: () = self.run("put", pipe.query_async(&mut conn)).await?;
        debug!(key = %key, size = entry.data.stored_size(), "Stored entry in Redis");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = self
            .run(
                "delete",
                redis::cmd("DEL").arg(self.storage_key(key)).query_async(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        self.delete_scanned(&self.storage_key(pattern.as_str())).await
    }

    async fn clear(&self) -> Result<usize> {
        Ok(self.delete_scanned(&self.storage_key("*")).await?.len())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .run("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

// =============================================================================
// In-Memory Remote Store
// =============================================================================

/// Process-local `RemoteStore` for tests and single-node runs.
///
/// Availability can be switched off to exercise the degraded path.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    entries: RwLock<HashMap<String, (RemoteEntry, Option<DateTime<Utc>>)>>,
    unavailable: AtomicBool,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of live keys held
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .values()
            .filter(|(_, expires)| expires.map_or(true, |t| t > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::RemoteUnavailable {
                reason: "in-memory remote switched off".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>> {
        self.check()?;
        let now = Utc::now();
        let entries = self.entries.read();
        Ok(entries.get(key).and_then(|(entry, expires)| match expires {
            Some(at) if *at <= now => None,
            Some(at) => {
                let left = at.signed_duration_since(now).to_std().unwrap_or_default();
                Some(RemoteEntry {
                    ttl_remaining: Some(left),
                    ..entry.clone()
                })
            }
            None => Some(entry.clone()),
        }))
    }

    async fn put(&self, key: &str, entry: &RemoteEntry) -> Result<()> {
        self.check()?;
        if entry.ttl_remaining.is_some_and(|t| t.is_zero()) {
            return Ok(());
        }
        let expires = entry
            .ttl_remaining
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| Utc::now() + t);
        self.entries
            .write()
            .insert(key.to_string(), (entry.clone(), expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        self.check()?;
        let mut entries = self.entries.write();
        let keys: Vec<String> = entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<usize> {
        self.check()?;
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        self.check()
    }
}
