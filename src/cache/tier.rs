//! Cache Tier Definitions
//!
//! Two-level hierarchy: a small in-process L1 and a larger L2 that is either
//! in-process memory or delegated to Redis. Budgets are carved per partition.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Cache Tier
// =============================================================================

/// Cache tier representing the storage hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// L1: In-process memory (fastest, smallest)
    #[default]
    L1,
    /// L2: Larger memory tier or Redis
    L2,
}

impl CacheTier {
    /// Get the demotion target tier (where entries go when evicted)
    pub fn demotion_target(&self) -> Option<CacheTier> {
        match self {
            CacheTier::L1 => Some(CacheTier::L2),
            CacheTier::L2 => None,
        }
    }

    /// Get the promotion target tier
    pub fn promotion_target(&self) -> Option<CacheTier> {
        match self {
            CacheTier::L1 => None,
            CacheTier::L2 => Some(CacheTier::L1),
        }
    }

    /// Get all tiers in lookup order (L1 -> L2)
    pub fn lookup_order() -> &'static [CacheTier] {
        &[CacheTier::L1, CacheTier::L2]
    }

    /// Array index used by per-tier metric tables
    #[inline]
    pub fn index(&self) -> usize {
        match self {
            CacheTier::L1 => 0,
            CacheTier::L2 => 1,
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1"),
            CacheTier::L2 => write!(f, "L2"),
        }
    }
}

// =============================================================================
// Tier Budget
// =============================================================================

/// Byte budgets for one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudget {
    /// L1 capacity in bytes
    pub l1_bytes: u64,
    /// L2 capacity in bytes
    pub l2_bytes: u64,
}

impl TierBudget {
    /// Split a total memory budget across partitions and tiers.
    ///
    /// Each partition gets `total / partitions`; L1 takes `l1_ratio` of that
    /// and L2 the remainder, so the two budgets always sum to the partition
    /// budget.
    pub fn split(total_bytes: u64, partitions: usize, l1_ratio: f64) -> Self {
        let partitions = partitions.max(1) as u64;
        let per_partition = total_bytes / partitions;
        let ratio = l1_ratio.clamp(0.0, 1.0);
        let l1_bytes = (per_partition as f64 * ratio).floor() as u64;
        Self {
            l1_bytes,
            l2_bytes: per_partition - l1_bytes.min(per_partition),
        }
    }

    /// Capacity for a tier
    pub fn for_tier(&self, tier: CacheTier) -> u64 {
        match tier {
            CacheTier::L1 => self.l1_bytes,
            CacheTier::L2 => self.l2_bytes,
        }
    }

    /// Total partition budget
    pub fn total(&self) -> u64 {
        self.l1_bytes + self.l2_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_transitions() {
        assert_eq!(CacheTier::L1.demotion_target(), Some(CacheTier::L2));
        assert_eq!(CacheTier::L2.demotion_target(), None);
        assert_eq!(CacheTier::L2.promotion_target(), Some(CacheTier::L1));
        assert_eq!(CacheTier::L1.promotion_target(), None);
    }

    #[test]
    fn test_lookup_order() {
        let order = CacheTier::lookup_order();
        assert_eq!(order, &[CacheTier::L1, CacheTier::L2]);
    }

    #[test]
    fn test_budget_split() {
        let budget = TierBudget::split(1000 * 4, 4, 0.25);
        assert_eq!(budget.l1_bytes, 250);
        assert_eq!(budget.l2_bytes, 750);
        assert_eq!(budget.total(), 1000);

        let all_l2 = TierBudget::split(1024, 1, 0.0);
        assert_eq!(all_l2.l1_bytes, 0);
        assert_eq!(all_l2.l2_bytes, 1024);

        let clamped = TierBudget::split(100, 1, 1.7);
        assert_eq!(clamped.l1_bytes, 100);
        assert_eq!(clamped.l2_bytes, 0);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(CacheTier::L1.to_string(), "L1");
        assert_eq!(CacheTier::L2.to_string(), "L2");
    }
}
