//! Partitioned Tier Store
//!
//! One `Partition` owns a slice of the keyspace and holds an L1 and an
//! in-process L2 `TierStore`, each with its own byte budget. Partitions are
//! wrapped in an async mutex by the manager, so everything here is plain
//! `&mut self` code with no interior locking.
//!
//! Placement for a new entry:
//!
//! ```text
//!   L1 has free room ──────────────► L1
//!          │ no
//!   remote L2 active ──────────────► Redis (caller writes it)
//!          │ no
//!   fits L2 budget ────────────────► L2   (evict L2 victims by policy)
//!          │ no
//!   fits L1 budget ────────────────► L1   (evict L1 victims, demote them to L2)
//!          │ no
//!   EntryTooLarge
//! ```

use crate::cache::entry::{CacheData, CacheEntry};
use crate::cache::keys::KeyPattern;
use crate::cache::policy::EvictionEngine;
use crate::cache::tier::{CacheTier, TierBudget};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// =============================================================================
// Tier Store
// =============================================================================

/// Entries of one tier inside one partition
#[derive(Debug)]
pub struct TierStore {
    tier: CacheTier,
    entries: IndexMap<String, CacheEntry>,
    bytes: u64,
    capacity: u64,
}

impl TierStore {
    /// Create an empty store with a byte budget
    pub fn new(tier: CacheTier, capacity: u64) -> Self {
        Self {
            tier,
            entries: IndexMap::new(),
            bytes: 0,
            capacity,
        }
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether `size` more bytes fit without evicting
    pub fn has_room(&self, size: u64) -> bool {
        self.bytes.saturating_add(size) <= self.capacity
    }

    /// Insert (or replace) an entry, returning the replaced one
    pub fn insert(&mut self, mut entry: CacheEntry) -> Option<CacheEntry> {
        entry.tier = self.tier;
        self.bytes += entry.size_bytes();
        let previous = self.entries.insert(entry.key.clone(), entry);
        if let Some(old) = &previous {
            self.bytes = self.bytes.saturating_sub(old.size_bytes());
        }
        previous
    }

    /// Remove an entry by key
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.swap_remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes());
        Some(entry)
    }

    /// Evict policy-chosen victims until `size` more bytes fit.
    ///
    /// The caller guarantees `size <= capacity`.
    pub fn evict_for(
        &mut self,
        size: u64,
        engine: &EvictionEngine,
        now: DateTime<Utc>,
    ) -> Vec<CacheEntry> {
        let needed = self.bytes.saturating_add(size).saturating_sub(self.capacity);
        if needed == 0 {
            return Vec::new();
        }

        let victims = engine.select_victims(self.entries.values(), needed, now);
        victims
            .into_iter()
            .filter_map(|candidate| self.remove(&candidate.key))
            .collect()
    }

    /// Remove every entry whose key matches `pattern`
    pub fn remove_matching(&mut self, pattern: &KeyPattern) -> Vec<CacheEntry> {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    /// Remove every entry expired at `now`
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let keys: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.key.clone())
            .collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    /// Drop everything, returning (entries, bytes) removed
    pub fn clear(&mut self) -> (usize, u64) {
        let removed = (self.entries.len(), self.bytes);
        self.entries.clear();
        self.bytes = 0;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

// =============================================================================
// Partition Types
// =============================================================================

/// Where the L2 tier of this cache lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Mode {
    /// In-process L2 stores
    Local,
    /// L2 delegated to a remote store; spilled entries go to the caller
    Remote,
}

/// Outcome of a partition lookup
#[derive(Debug, Clone)]
pub enum PartitionLookup {
    /// Live entry found (access already recorded)
    Hit {
        tier: CacheTier,
        data: CacheData,
        access_count: u64,
    },
    /// Entry was present but expired; it has been removed
    Expired(CacheEntry),
    /// Not held by this partition
    Miss,
}

/// What a store operation did to the partition
#[derive(Debug, Default)]
pub struct StoreReport {
    /// Tier the entry landed in (None when handed to the remote tier)
    pub tier: Option<CacheTier>,
    /// Entries dropped by the eviction policy
    pub evicted: Vec<CacheEntry>,
    /// L1 entries (key, size) moved down into local L2
    pub demoted: Vec<(String, u64)>,
    /// L1 entries pushed out that the caller must write to the remote tier
    pub spilled: Vec<CacheEntry>,
}

/// Result of placing a new entry
#[derive(Debug)]
pub enum Placement {
    /// Stored locally
    Stored(StoreReport),
    /// Belongs in the remote L2 tier; the caller owns the write
    Remote(CacheEntry),
}

/// Why a promotion did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionSkip {
    /// Key is not held in local L2
    NotInL2,
    /// Entry is larger than the whole L1 budget
    TooLarge,
}

/// Per-partition occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionUsage {
    pub partition_id: usize,
    pub l1_items: usize,
    pub l1_bytes: u64,
    pub l1_capacity: u64,
    pub l2_items: usize,
    pub l2_bytes: u64,
    pub l2_capacity: u64,
}

impl PartitionUsage {
    pub fn items(&self) -> usize {
        self.l1_items + self.l2_items
    }

    pub fn bytes(&self) -> u64 {
        self.l1_bytes + self.l2_bytes
    }

    /// Check the capacity invariant for both tiers
    pub fn within_budget(&self) -> bool {
        self.l1_bytes <= self.l1_capacity && self.l2_bytes <= self.l2_capacity
    }
}

// =============================================================================
// Partition
// =============================================================================

/// Independent shard of the keyspace
#[derive(Debug)]
pub struct Partition {
    id: usize,
    l1: TierStore,
    l2: TierStore,
    clock: u64,
}

impl Partition {
    /// Create a partition with per-tier budgets
    pub fn new(id: usize, budget: TierBudget) -> Self {
        Self {
            id,
            l1: TierStore::new(CacheTier::L1, budget.l1_bytes),
            l2: TierStore::new(CacheTier::L2, budget.l2_bytes),
            clock: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Advance the logical clock
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn store(&self, tier: CacheTier) -> &TierStore {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
        }
    }

    fn store_mut(&mut self, tier: CacheTier) -> &mut TierStore {
        match tier {
            CacheTier::L1 => &mut self.l1,
            CacheTier::L2 => &mut self.l2,
        }
    }

    /// Tier currently holding `key`
    pub fn tier_of(&self, key: &str) -> Option<CacheTier> {
        CacheTier::lookup_order()
            .iter()
            .copied()
            .find(|tier| self.store(*tier).contains(key))
    }

    /// Current occupancy
    pub fn usage(&self) -> PartitionUsage {
        PartitionUsage {
            partition_id: self.id,
            l1_items: self.l1.len(),
            l1_bytes: self.l1.bytes(),
            l1_capacity: self.l1.capacity(),
            l2_items: self.l2.len(),
            l2_bytes: self.l2.bytes(),
            l2_capacity: self.l2.capacity(),
        }
    }

    /// Look a key up in L1 then L2, recording the access on a hit
    pub fn lookup(&mut self, key: &str, now: DateTime<Utc>) -> PartitionLookup {
        let tier = match self.tier_of(key) {
            Some(tier) => tier,
            None => return PartitionLookup::Miss,
        };

        let expired = self
            .store(tier)
            .get(key)
            .map(|e| e.is_expired_at(now))
            .unwrap_or(false);
        if expired {
            return match self.store_mut(tier).remove(key) {
                Some(entry) => PartitionLookup::Expired(entry),
                None => PartitionLookup::Miss,
            };
        }

        let seq = self.tick();
        match self.store_mut(tier).entries.get_mut(key) {
            Some(entry) => {
                entry.record_access(seq, now);
                PartitionLookup::Hit {
                    tier,
                    data: entry.data.clone(),
                    access_count: entry.access_count,
                }
            }
            None => PartitionLookup::Miss,
        }
    }

    /// Remove a key from both tiers
    pub fn remove(&mut self, key: &str) -> Vec<CacheEntry> {
        [CacheTier::L1, CacheTier::L2]
            .into_iter()
            .filter_map(|tier| self.store_mut(tier).remove(key))
            .collect()
    }

    /// Place a new entry. Any existing copy of the key must already be gone.
    pub fn place(
        &mut self,
        mut entry: CacheEntry,
        mode: L2Mode,
        engine: &EvictionEngine,
        now: DateTime<Utc>,
    ) -> Result<Placement> {
        let size = entry.size_bytes();
        entry.partition_id = self.id;

        if self.l1.has_room(size) {
            self.l1.insert(entry);
            return Ok(Placement::Stored(StoreReport {
                tier: Some(CacheTier::L1),
                ..Default::default()
            }));
        }

        if mode == L2Mode::Remote {
            entry.tier = CacheTier::L2;
            return Ok(Placement::Remote(entry));
        }

        if size <= self.l2.capacity() {
            let evicted = self.l2.evict_for(size, engine, now);
            self.l2.insert(entry);
            return Ok(Placement::Stored(StoreReport {
                tier: Some(CacheTier::L2),
                evicted,
                ..Default::default()
            }));
        }

        if size <= self.l1.capacity() {
            let mut report = StoreReport {
                tier: Some(CacheTier::L1),
                ..Default::default()
            };
            let victims = self.l1.evict_for(size, engine, now);
            self.demote(victims, mode, engine, now, &mut report);
            self.l1.insert(entry);
            return Ok(Placement::Stored(report));
        }

        Err(Error::EntryTooLarge {
            key: entry.key,
            size,
            capacity: self.l1.capacity().max(self.l2.capacity()),
        })
    }

    /// Move a local L2 entry up into L1, evicting (and demoting) L1 victims
    pub fn promote(
        &mut self,
        key: &str,
        mode: L2Mode,
        engine: &EvictionEngine,
        now: DateTime<Utc>,
    ) -> std::result::Result<StoreReport, PromotionSkip> {
        let size = match self.l2.get(key) {
            Some(entry) => entry.size_bytes(),
            None => return Err(PromotionSkip::NotInL2),
        };
        if size > self.l1.capacity() {
            return Err(PromotionSkip::TooLarge);
        }

        let entry = self.l2.remove(key).ok_or(PromotionSkip::NotInL2)?;
        Ok(self.admit_to_l1(entry, mode, engine, now))
    }

    /// Insert an entry fetched from the remote tier into L1.
    ///
    /// Returns `None` when the entry cannot fit L1 at all.
    pub fn admit_remote(
        &mut self,
        entry: CacheEntry,
        engine: &EvictionEngine,
        now: DateTime<Utc>,
    ) -> Option<StoreReport> {
        if entry.size_bytes() > self.l1.capacity() || self.tier_of(&entry.key).is_some() {
            return None;
        }
        Some(self.admit_to_l1(entry, L2Mode::Remote, engine, now))
    }

    fn admit_to_l1(
        &mut self,
        mut entry: CacheEntry,
        mode: L2Mode,
        engine: &EvictionEngine,
        now: DateTime<Utc>,
    ) -> StoreReport {
        let mut report = StoreReport {
            tier: Some(CacheTier::L1),
            ..Default::default()
        };
        entry.partition_id = self.id;
        let victims = self.l1.evict_for(entry.size_bytes(), engine, now);
        self.demote(victims, mode, engine, now, &mut report);
        self.l1.insert(entry);
        report
    }

    fn demote(
        &mut self,
        victims: Vec<CacheEntry>,
        mode: L2Mode,
        engine: &EvictionEngine,
        now: DateTime<Utc>,
        report: &mut StoreReport,
    ) {
        for mut victim in victims {
            if victim.is_expired_at(now) {
                report.evicted.push(victim);
                continue;
            }
            match mode {
                L2Mode::Remote => {
                    victim.tier = CacheTier::L2;
                    report.spilled.push(victim);
                }
                L2Mode::Local if victim.size_bytes() <= self.l2.capacity() => {
                    let evicted = self.l2.evict_for(victim.size_bytes(), engine, now);
                    report.evicted.extend(evicted);
                    report.demoted.push((victim.key.clone(), victim.size_bytes()));
                    self.l2.insert(victim);
                }
                L2Mode::Local => report.evicted.push(victim),
            }
        }
    }

    /// Take back an entry pushed out of L1 that the remote tier refused
    pub fn accept_demoted(
        &mut self,
        entry: CacheEntry,
        engine: &EvictionEngine,
        now: DateTime<Utc>,
    ) -> StoreReport {
        let mut report = StoreReport {
            tier: Some(CacheTier::L2),
            ..Default::default()
        };
        self.demote(vec![entry], L2Mode::Local, engine, now, &mut report);
        report
    }

    /// Remove every entry in both tiers matching `pattern`
    pub fn remove_matching(&mut self, pattern: &KeyPattern) -> Vec<CacheEntry> {
        let mut removed = self.l1.remove_matching(pattern);
        removed.extend(self.l2.remove_matching(pattern));
        removed
    }

    /// Remove every expired entry in both tiers
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let mut removed = self.l1.remove_expired(now);
        removed.extend(self.l2.remove_expired(now));
        removed
    }

    /// Drop every entry, returning the number removed
    pub fn clear(&mut self) -> usize {
        let (l1, _) = self.l1.clear();
        let (l2, _) = self.l2.clear();
        l1 + l2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::EvictionPolicy;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::time::Duration;

    fn new_entry(partition: &mut Partition, key: &str, size: usize) -> CacheEntry {
        let seq = partition.tick();
        CacheEntry::new(
            key,
            CacheData::uncompressed(Bytes::from(vec![7u8; size])),
            partition.id(),
            None,
            seq,
        )
    }

    fn put(partition: &mut Partition, key: &str, size: usize, engine: &EvictionEngine) -> StoreReport {
        let entry = new_entry(partition, key, size);
        match partition.place(entry, L2Mode::Local, engine, Utc::now()).unwrap() {
            Placement::Stored(report) => report,
            Placement::Remote(_) => panic!("local mode never hands off"),
        }
    }

    #[test]
    fn test_tier_store_accounting() {
        let mut store = TierStore::new(CacheTier::L1, 100);
        let e = CacheEntry::new("a", CacheData::uncompressed(Bytes::from(vec![0u8; 40])), 0, None, 1);
        assert!(store.has_room(40));
        store.insert(e.clone());
        assert_eq!(store.bytes(), 40);

        let bigger = CacheEntry::new("a", CacheData::uncompressed(Bytes::from(vec![0u8; 60])), 0, None, 2);
        assert!(store.insert(bigger).is_some());
        assert_eq!(store.bytes(), 60);
        assert_eq!(store.len(), 1);

        assert!(!store.has_room(41));
        store.remove("a");
        assert_eq!(store.bytes(), 0);
        assert!(store.remove("a").is_none());
    }

    #[test]
    fn test_lookup_stamps_caller_clock() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 100, l2_bytes: 100 });
        put(&mut p, "a", 10, &engine);

        let at = Utc::now() + chrono::Duration::minutes(5);
        assert_matches!(p.lookup("a", at), PartitionLookup::Hit { access_count: 1, .. });
        let entry = p.store(CacheTier::L1).get("a").unwrap();
        assert_eq!(entry.last_accessed, at);
    }

    #[test]
    fn test_l1_first_then_l2() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 100, l2_bytes: 300 });

        assert_eq!(put(&mut p, "a", 60, &engine).tier, Some(CacheTier::L1));
        assert_eq!(put(&mut p, "b", 60, &engine).tier, Some(CacheTier::L2));
        assert_eq!(p.tier_of("a"), Some(CacheTier::L1));
        assert_eq!(p.tier_of("b"), Some(CacheTier::L2));
    }

    #[test]
    fn test_l2_eviction_keeps_budget() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 0, l2_bytes: 1024 });

        for i in 0..8 {
            put(&mut p, &format!("k{}", i), 256, &engine);
            assert!(p.usage().within_budget());
        }
        let usage = p.usage();
        assert_eq!(usage.l2_items, 4);
        assert_eq!(usage.l2_bytes, 1024);
        assert!(p.tier_of("k0").is_none());
        assert!(p.tier_of("k7").is_some());
    }

    #[test]
    fn test_lookup_records_access_and_expires() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 1000, l2_bytes: 1000 });
        put(&mut p, "live", 10, &engine);

        assert_matches!(p.lookup("live", Utc::now()), PartitionLookup::Hit { tier: CacheTier::L1, access_count: 1, .. });
        assert_matches!(p.lookup("missing", Utc::now()), PartitionLookup::Miss);

        let seq = p.tick();
        let mut expiring = CacheEntry::new("short", CacheData::uncompressed(Bytes::from("x")), 0, Some(Duration::from_secs(1)), seq);
        expiring.created_at = Utc::now() - chrono::Duration::seconds(5);
        p.place(expiring, L2Mode::Local, &engine, Utc::now()).unwrap();

        assert_matches!(p.lookup("short", Utc::now()), PartitionLookup::Expired(_));
        assert!(p.tier_of("short").is_none());
    }

    #[test]
    fn test_promotion_demotes_l1_victims() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 100, l2_bytes: 200 });

        put(&mut p, "l1", 100, &engine);
        put(&mut p, "hot", 80, &engine);
        assert_eq!(p.tier_of("hot"), Some(CacheTier::L2));

        let report = p.promote("hot", L2Mode::Local, &engine, Utc::now()).unwrap();
        assert_eq!(report.demoted, vec![("l1".to_string(), 100)]);
        assert_eq!(p.tier_of("hot"), Some(CacheTier::L1));
        assert_eq!(p.tier_of("l1"), Some(CacheTier::L2));
        assert!(p.usage().within_budget());

        assert_eq!(
            p.promote("absent", L2Mode::Local, &engine, Utc::now()).unwrap_err(),
            PromotionSkip::NotInL2
        );
    }

    #[test]
    fn test_remote_mode_spills_instead_of_demoting() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 100, l2_bytes: 100 });

        put(&mut p, "resident", 100, &engine);
        let seq = p.tick();
        let incoming = CacheEntry::new("remote", CacheData::uncompressed(Bytes::from(vec![1u8; 50])), 0, None, seq);
        assert_matches!(p.place(incoming.clone(), L2Mode::Remote, &engine, Utc::now()).unwrap(), Placement::Remote(_));

        let report = p.admit_remote(incoming, &engine, Utc::now()).unwrap();
        assert_eq!(report.spilled.len(), 1);
        assert_eq!(report.spilled[0].key, "resident");
        assert_eq!(p.tier_of("remote"), Some(CacheTier::L1));
    }

    #[test]
    fn test_entry_too_large() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 10, l2_bytes: 20 });
        let entry = new_entry(&mut p, "huge", 21);
        assert_matches!(
            p.place(entry, L2Mode::Local, &engine, Utc::now()),
            Err(Error::EntryTooLarge { size: 21, capacity: 20, .. })
        );
    }

    #[test]
    fn test_remove_matching_both_tiers() {
        let engine = EvictionEngine::new(EvictionPolicy::Lru);
        let mut p = Partition::new(0, TierBudget { l1_bytes: 10, l2_bytes: 100 });
        put(&mut p, "ns1:op:a", 10, &engine);
        put(&mut p, "ns1:op:b", 10, &engine);
        put(&mut p, "ns2:op:c", 10, &engine);

        let pattern = KeyPattern::new("ns1:op:*").unwrap();
        let removed = p.remove_matching(&pattern);
        assert_eq!(removed.len(), 2);
        assert_eq!(p.usage().items(), 1);
        assert_eq!(p.clear(), 1);
        assert_eq!(p.usage(), PartitionUsage { partition_id: 0, l1_capacity: 10, l2_capacity: 100, ..Default::default() });
    }
}
