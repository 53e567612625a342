//! Eviction Policy Engine
//!
//! Ranks the entries of one partition tier and picks victims until enough
//! bytes are freed. Every policy evicts already-expired entries first; the
//! policy decides the order among the live ones:
//!
//! | Policy   | Victim order                                             |
//! |----------|----------------------------------------------------------|
//! | `Lru`    | oldest access first                                      |
//! | `Lfu`    | lowest access count, ties by oldest access               |
//! | `Fifo`   | oldest insertion, access pattern ignored                 |
//! | `Ttl`    | expired first, then LRU                                  |
//! | `Hybrid` | lowest `w1*recency + w2*frequency + w3*ttl_remaining`    |

use crate::cache::entry::CacheEntry;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Eviction Policy
// =============================================================================

/// Policy for selecting eviction victims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least Recently Used
    Lru,
    /// Least Frequently Used
    Lfu,
    /// First In, First Out
    Fifo,
    /// Expired first, then least recently used
    Ttl,
    /// Weighted blend of recency, frequency and TTL headroom
    #[default]
    Hybrid,
}

impl EvictionPolicy {
    /// All policies, in metric-table order
    pub const ALL: [EvictionPolicy; 5] = [
        EvictionPolicy::Lru,
        EvictionPolicy::Lfu,
        EvictionPolicy::Fifo,
        EvictionPolicy::Ttl,
        EvictionPolicy::Hybrid,
    ];

    /// Index into per-policy counter tables
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            EvictionPolicy::Lru => 0,
            EvictionPolicy::Lfu => 1,
            EvictionPolicy::Fifo => 2,
            EvictionPolicy::Ttl => 3,
            EvictionPolicy::Hybrid => 4,
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Fifo => write!(f, "fifo"),
            EvictionPolicy::Ttl => write!(f, "ttl"),
            EvictionPolicy::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            "ttl" => Ok(EvictionPolicy::Ttl),
            "hybrid" => Ok(EvictionPolicy::Hybrid),
            other => Err(Error::Configuration(format!(
                "unknown cache policy '{}', expected one of lru, lfu, fifo, ttl, hybrid",
                other
            ))),
        }
    }
}

// =============================================================================
// Hybrid Weights
// =============================================================================

/// Weights of the HYBRID score terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub recency: f64,
    pub frequency: f64,
    pub ttl: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            recency: 0.5,
            frequency: 0.3,
            ttl: 0.2,
        }
    }
}

// =============================================================================
// Eviction Candidate
// =============================================================================

/// Candidate for eviction with relevant metadata
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    /// The cache key
    pub key: String,
    /// Stored size in bytes
    pub size_bytes: u64,
    /// Whether the entry had already expired
    pub expired: bool,
    /// Policy score (lower = evicted sooner)
    pub score: f64,
}

struct Ranked<'a> {
    entry: &'a CacheEntry,
    expired: bool,
    score: f64,
}

// =============================================================================
// Eviction Engine
// =============================================================================

/// Chooses victims inside a single partition tier
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionEngine {
    policy: EvictionPolicy,
    weights: HybridWeights,
}

impl EvictionEngine {
    /// Create an engine for a policy with default hybrid weights
    pub fn new(policy: EvictionPolicy) -> Self {
        Self::with_weights(policy, HybridWeights::default())
    }

    /// Create an engine with custom hybrid weights
    pub fn with_weights(policy: EvictionPolicy, weights: HybridWeights) -> Self {
        Self { policy, weights }
    }

    /// Configured policy
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Rank all entries, first element = first victim
    pub fn rank<'a, I>(&self, entries: I, now: DateTime<Utc>) -> Vec<EvictionCandidate>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
    {
        let entries: Vec<&CacheEntry> = entries.into_iter().collect();
        let hybrid_scores = match self.policy {
            EvictionPolicy::Hybrid => self.hybrid_scores(&entries, now),
            _ => Vec::new(),
        };

        let mut ranked: Vec<Ranked<'_>> = entries
            .iter()
            .enumerate()
            .map(|(i, &entry)| Ranked {
                entry,
                expired: entry.is_expired_at(now),
                score: match self.policy {
                    EvictionPolicy::Lru | EvictionPolicy::Ttl => entry.access_seq as f64,
                    EvictionPolicy::Lfu => entry.access_count as f64,
                    EvictionPolicy::Fifo => entry.created_seq as f64,
                    EvictionPolicy::Hybrid => hybrid_scores[i],
                },
            })
            .collect();

        ranked.sort_by(|a, b| self.compare(a, b));

        ranked
            .into_iter()
            .map(|r| EvictionCandidate {
                key: r.entry.key.clone(),
                size_bytes: r.entry.size_bytes(),
                expired: r.expired,
                score: r.score,
            })
            .collect()
    }

    /// Pick victims, in order, until at least `bytes_needed` would be freed.
    ///
    /// Returns fewer bytes than requested only when the tier holds less
    /// than `bytes_needed` in total.
    pub fn select_victims<'a, I>(
        &self,
        entries: I,
        bytes_needed: u64,
        now: DateTime<Utc>,
    ) -> Vec<EvictionCandidate>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
    {
        if bytes_needed == 0 {
            return Vec::new();
        }

        let mut freed = 0u64;
        let mut selected = Vec::new();
        for candidate in self.rank(entries, now) {
            freed += candidate.size_bytes;
            selected.push(candidate);
            if freed >= bytes_needed {
                break;
            }
        }
        selected
    }

    /// Single best victim
    pub fn select_victim<'a, I>(&self, entries: I, now: DateTime<Utc>) -> Option<EvictionCandidate>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
    {
        self.rank(entries, now).into_iter().next()
    }

    fn compare(&self, a: &Ranked<'_>, b: &Ranked<'_>) -> Ordering {
        // expired entries (true) sort before live ones
        b.expired
            .cmp(&a.expired)
            .then_with(|| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
            .then_with(|| a.entry.access_seq.cmp(&b.entry.access_seq))
            .then_with(|| a.entry.created_seq.cmp(&b.entry.created_seq))
    }

    /// `w1*recency_rank + w2*frequency_rank + w3*ttl_remaining`, each in [0, 1]
    fn hybrid_scores(&self, entries: &[&CacheEntry], now: DateTime<Utc>) -> Vec<f64> {
        let n = entries.len();
        if n == 0 {
            return Vec::new();
        }

        let recency = normalized_ranks(n, |i, j| {
            entries[i].access_seq.cmp(&entries[j].access_seq)
        });
        let frequency = normalized_ranks(n, |i, j| {
            entries[i]
                .access_count
                .cmp(&entries[j].access_count)
                .then_with(|| entries[i].access_seq.cmp(&entries[j].access_seq))
        });

        (0..n)
            .map(|i| {
                self.weights.recency * recency[i]
                    + self.weights.frequency * frequency[i]
                    + self.weights.ttl * entries[i].ttl_remaining_fraction(now)
            })
            .collect()
    }
}

/// Rank positions scaled to [0, 1] (0 = smallest under `cmp`)
fn normalized_ranks<F>(n: usize, cmp: F) -> Vec<f64>
where
    F: Fn(usize, usize) -> Ordering,
{
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| cmp(i, j));

    let mut ranks = vec![0.0; n];
    if n == 1 {
        return ranks;
    }
    let denom = (n - 1) as f64;
    for (position, &idx) in order.iter().enumerate() {
        ranks[idx] = position as f64 / denom;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheData;
    use bytes::Bytes;
    use std::time::Duration;

    fn entry(key: &str, size: usize, created_seq: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            CacheData::uncompressed(Bytes::from(vec![0u8; size])),
            0,
            None,
            created_seq,
        )
    }

    fn victim(policy: EvictionPolicy, entries: &[CacheEntry]) -> String {
        EvictionEngine::new(policy)
            .select_victim(entries.iter(), Utc::now())
            .unwrap()
            .key
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let mut entries = vec![entry("a", 10, 1), entry("b", 10, 2), entry("c", 10, 3)];
        entries[0].record_access(4, Utc::now());
        assert_eq!(victim(EvictionPolicy::Lru, &entries), "b");
    }

    #[test]
    fn test_lfu_breaks_ties_by_recency() {
        let mut entries = vec![entry("a", 10, 1), entry("b", 10, 2), entry("c", 10, 3)];
        entries[0].record_access(4, Utc::now());
        entries[0].record_access(5, Utc::now());
        entries[2].record_access(6, Utc::now());
        assert_eq!(victim(EvictionPolicy::Lfu, &entries), "b");

        entries[1].record_access(7, Utc::now());
        // b and c both have one access; c's access is older
        assert_eq!(victim(EvictionPolicy::Lfu, &entries), "c");
    }

    #[test]
    fn test_fifo_ignores_access() {
        let mut entries = vec![entry("a", 10, 1), entry("b", 10, 2)];
        entries[0].record_access(10, Utc::now());
        entries[0].record_access(11, Utc::now());
        assert_eq!(victim(EvictionPolicy::Fifo, &entries), "a");
    }

    #[test]
    fn test_ttl_prefers_expired_then_lru() {
        let mut entries = vec![entry("a", 10, 1), entry("b", 10, 2), entry("c", 10, 3)];
        entries[2].ttl = Some(Duration::from_secs(5));
        entries[2].created_at = Utc::now() - chrono::Duration::seconds(10);
        assert_eq!(victim(EvictionPolicy::Ttl, &entries), "c");

        entries[2].ttl = None;
        assert_eq!(victim(EvictionPolicy::Ttl, &entries), "a");
    }

    #[test]
    fn test_hybrid_keeps_hot_entries() {
        let mut entries = vec![entry("hot", 10, 1), entry("cold", 10, 2), entry("warm", 10, 3)];
        entries[2].record_access(4, Utc::now());
        for seq in 5..=10 {
            entries[0].record_access(seq, Utc::now());
        }

        let ranked = EvictionEngine::new(EvictionPolicy::Hybrid).rank(entries.iter(), Utc::now());
        assert_eq!(ranked[0].key, "cold");
        assert_eq!(ranked.last().unwrap().key, "hot");
        assert!(ranked.windows(2).all(|w| w[0].score <= w[1].score));
    }

    #[test]
    fn test_hybrid_ttl_term() {
        let now = Utc::now();
        let mut entries = vec![entry("long", 10, 1), entry("short", 10, 1)];
        entries[0].ttl = Some(Duration::from_secs(3600));
        entries[1].ttl = Some(Duration::from_secs(3600));
        entries[1].created_at = now - chrono::Duration::seconds(3500);

        let weights = HybridWeights {
            recency: 0.0,
            frequency: 0.0,
            ttl: 1.0,
        };
        let engine = EvictionEngine::with_weights(EvictionPolicy::Hybrid, weights);
        assert_eq!(engine.select_victim(entries.iter(), now).unwrap().key, "short");
    }

    #[test]
    fn test_select_victims_covers_bytes() {
        let entries: Vec<CacheEntry> = (0..10)
            .map(|i| entry(&format!("k{}", i), 100, i as u64))
            .collect();
        let engine = EvictionEngine::new(EvictionPolicy::Lru);

        let victims = engine.select_victims(entries.iter(), 250, Utc::now());
        assert_eq!(victims.len(), 3);
        assert_eq!(victims[0].key, "k0");
        assert!(victims.iter().map(|v| v.size_bytes).sum::<u64>() >= 250);

        assert!(engine.select_victims(entries.iter(), 0, Utc::now()).is_empty());
        assert_eq!(engine.select_victims(entries.iter(), 10_000, Utc::now()).len(), 10);
    }

    #[test]
    fn test_policy_parse_and_display() {
        for policy in EvictionPolicy::ALL {
            assert_eq!(policy.to_string().parse::<EvictionPolicy>().unwrap(), policy);
        }
        assert_eq!("HYBRID".parse::<EvictionPolicy>().unwrap(), EvictionPolicy::Hybrid);
        assert!("random".parse::<EvictionPolicy>().is_err());
        assert_eq!(EvictionPolicy::default(), EvictionPolicy::Hybrid);
    }
}
