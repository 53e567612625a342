//! Cache Entry Types
//!
//! Defines stored data, entries and their expiry/recency bookkeeping.

use crate::cache::tier::CacheTier;
use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Cache Data
// =============================================================================

/// Wrapper for cached data with compression info
#[derive(Debug, Clone)]
pub struct CacheData {
    /// The stored bytes (compressed when `algorithm` is not `None`)
    pub bytes: Bytes,
    /// Original size before compression
    pub original_size: u64,
    /// Algorithm the bytes are compressed with
    pub algorithm: CompressionAlgorithm,
}

impl CacheData {
    /// Create uncompressed cache data
    pub fn uncompressed(bytes: Bytes) -> Self {
        let size = bytes.len() as u64;
        Self {
            bytes,
            original_size: size,
            algorithm: CompressionAlgorithm::None,
        }
    }

    /// Create cache data from a compression result
    pub fn stored(bytes: Bytes, original_size: u64, algorithm: CompressionAlgorithm) -> Self {
        Self {
            bytes,
            original_size,
            algorithm,
        }
    }

    /// Whether the bytes are compressed
    pub fn compressed(&self) -> bool {
        self.algorithm != CompressionAlgorithm::None
    }

    /// Get the stored size (compressed size if compressed)
    pub fn stored_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Get compression ratio (stored_size / original_size)
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.stored_size() as f64 / self.original_size as f64
        }
    }
}

/// Compression algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Deflate,
    Lz4,
    Zstd,
    Snappy,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Deflate => write!(f, "deflate"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::Snappy => write!(f, "snappy"),
        }
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(CompressionAlgorithm::None),
            "deflate" | "zlib" => Ok(CompressionAlgorithm::Deflate),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "snappy" => Ok(CompressionAlgorithm::Snappy),
            other => Err(Error::Configuration(format!(
                "unknown compression algorithm: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached entry with metadata.
///
/// Owned by exactly one partition and only mutated under that partition's
/// lock. `created_seq`/`access_seq` come from the partition's logical clock
/// and order entries that share a millisecond timestamp.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Full cache key
    pub key: String,
    /// The cached data
    pub data: CacheData,
    /// Tier where this entry is stored
    pub tier: CacheTier,
    /// Owning partition
    pub partition_id: usize,
    /// Time when entry was created
    pub created_at: DateTime<Utc>,
    /// Time when entry was last accessed
    pub last_accessed: DateTime<Utc>,
    /// Number of times this entry has been read
    pub access_count: u64,
    /// Time-to-live (None = never expires)
    pub ttl: Option<Duration>,
    /// Logical insertion time
    pub created_seq: u64,
    /// Logical time of last access
    pub access_seq: u64,
}

impl CacheEntry {
    /// Create a new cache entry
    pub fn new(
        key: impl Into<String>,
        data: CacheData,
        partition_id: usize,
        ttl: Option<Duration>,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            data,
            tier: CacheTier::L1,
            partition_id,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl,
            created_seq: seq,
            access_seq: seq,
        }
    }

    /// Record an access to this entry at `now`
    pub fn record_access(&mut self, seq: u64, now: DateTime<Utc>) {
        self.last_accessed = now;
        self.access_count = self.access_count.saturating_add(1);
        self.access_seq = seq;
    }

    /// Check if the entry has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age_ms = now.signed_duration_since(self.created_at).num_milliseconds();
                age_ms >= 0 && age_ms as u128 >= ttl.as_millis()
            }
            None => false,
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Fraction of TTL still remaining at `now` (1.0 for entries without TTL)
    pub fn ttl_remaining_fraction(&self, now: DateTime<Utc>) -> f64 {
        match self.ttl {
            Some(ttl) if !ttl.is_zero() => {
                let age_ms = now
                    .signed_duration_since(self.created_at)
                    .num_milliseconds()
                    .max(0) as f64;
                (1.0 - age_ms / ttl.as_millis() as f64).clamp(0.0, 1.0)
            }
            Some(_) => 0.0,
            None => 1.0,
        }
    }

    /// Remaining time to live at `now`
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.ttl.map(|ttl| {
            let age_ms = now
                .signed_duration_since(self.created_at)
                .num_milliseconds()
                .max(0) as u64;
            ttl.saturating_sub(Duration::from_millis(age_ms))
        })
    }

    /// TTL in whole seconds
    pub fn ttl_seconds(&self) -> Option<u64> {
        self.ttl.map(|t| t.as_secs())
    }

    /// Stored size in bytes (what the tier budgets account)
    pub fn size_bytes(&self) -> u64 {
        self.data.stored_size()
    }

    /// Whether the stored bytes are compressed
    pub fn compressed(&self) -> bool {
        self.data.compressed()
    }
}
