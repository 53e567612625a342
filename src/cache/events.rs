//! Cache Events
//!
//! Events emitted by the cache for monitoring and observability.

use crate::cache::policy::EvictionPolicy;
use crate::cache::tier::CacheTier;
use serde::{Deserialize, Serialize};

/// Events emitted by the cache system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Entry was stored
    Set {
        key: String,
        tier: CacheTier,
        remote: bool,
        size_bytes: u64,
        compressed: bool,
    },

    /// Cache hit
    Hit {
        key: String,
        tier: CacheTier,
        promoted: bool,
    },

    /// Cache miss (absent or expired)
    Miss { key: String, expired: bool },

    /// Entry was evicted to make room
    Evict {
        key: String,
        tier: CacheTier,
        size_bytes: u64,
        policy: EvictionPolicy,
    },

    /// Entry moved from L2 to L1
    Promote { key: String, size_bytes: u64 },

    /// Entry moved from L1 to L2
    Demote {
        key: String,
        size_bytes: u64,
        remote: bool,
    },

    /// Entry was deleted by key
    Delete { key: String },

    /// Pattern invalidation completed
    Invalidate { pattern: String, removed: usize },

    /// Every entry was dropped
    Flush { entries_removed: usize },

    /// Remote L2 stopped answering; in-process L2 serves instead
    RemoteUnavailable { backend: String, reason: String },

    /// Remote L2 answered again
    RemoteRecovered { backend: String },

    /// Compression error (fell back to uncompressed)
    CompressionFailed {
        key: String,
        algorithm: String,
        error: String,
    },
}

impl CacheEvent {
    /// Create an Evict event
    pub fn evict(key: &str, tier: CacheTier, size_bytes: u64, policy: EvictionPolicy) -> Self {
        CacheEvent::Evict {
            key: key.to_string(),
            tier,
            size_bytes,
            policy,
        }
    }

    /// Create a Hit event
    pub fn hit(key: &str, tier: CacheTier, promoted: bool) -> Self {
        CacheEvent::Hit {
            key: key.to_string(),
            tier,
            promoted,
        }
    }

    /// Create a Miss event
    pub fn miss(key: &str, expired: bool) -> Self {
        CacheEvent::Miss {
            key: key.to_string(),
            expired,
        }
    }

    /// Get the key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Set { key, .. }
            | CacheEvent::Hit { key, .. }
            | CacheEvent::Miss { key, .. }
            | CacheEvent::Evict { key, .. }
            | CacheEvent::Promote { key, .. }
            | CacheEvent::Demote { key, .. }
            | CacheEvent::Delete { key }
            | CacheEvent::CompressionFailed { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Get the tier associated with this event (if any)
    pub fn tier(&self) -> Option<CacheTier> {
        match self {
            CacheEvent::Set { tier, .. }
            | CacheEvent::Hit { tier, .. }
            | CacheEvent::Evict { tier, .. } => Some(*tier),
            CacheEvent::Promote { .. } => Some(CacheTier::L1),
            CacheEvent::Demote { .. } => Some(CacheTier::L2),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::RemoteUnavailable { .. } | CacheEvent::CompressionFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let hit = CacheEvent::hit("vertex:ns:op:1", CacheTier::L1, false);
        assert_eq!(hit.key(), Some("vertex:ns:op:1"));
        assert_eq!(hit.tier(), Some(CacheTier::L1));
        assert!(!hit.is_error());

        let unavailable = CacheEvent::RemoteUnavailable {
            backend: "redis".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(unavailable.is_error());
        assert_eq!(unavailable.key(), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = CacheEvent::evict("k", CacheTier::L2, 128, EvictionPolicy::Lru);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "evict");
        assert_eq!(json["tier"], "l2");
        assert_eq!(json["policy"], "lru");
    }
}
