//! Eviction Policy Module
//!
//! Decides which cache files to delete. Selection is a pure function over a
//! snapshot of the entries so it can run without holding any lock while the
//! manager does the actual deletions.
//!
//! Order: retired entries (invalidated, or superseded by a newer entry) are
//! always taken first, regardless of recency. Remaining zero-reader entries
//! are then taken least-recently-used first until the total is back within
//! budget.

use crate::cache_entry::EntryStatus;
use serde::Serialize;
use std::time::Instant;

/// One deletable unit as seen by the policy
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub id: u64,
    pub status: EntryStatus,
    pub reader_count: usize,
    pub last_access: Instant,
    /// Bytes the backing file currently occupies
    pub size: u64,
    /// No longer reachable through the index
    pub retired: bool,
}

impl EvictionCandidate {
    fn is_evictable(&self) -> bool {
        self.reader_count == 0 && self.status != EntryStatus::Evicting
    }

    fn is_forced(&self) -> bool {
        self.retired || self.status == EntryStatus::Invalidated
    }
}

/// Victims chosen by [`select_victims`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub victims: Vec<u64>,
    pub bytes_to_free: u64,
    /// Total the cache is expected to reach once every victim is gone
    pub projected_total: u64,
}

/// Result of one eviction pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub evicted: usize,
    pub bytes_freed: u64,
    pub total_after: u64,
    /// Still above budget because every remaining entry has readers
    pub over_budget: bool,
}

/// Choose the entries to delete so that the total drops to `budget` or below
pub fn select_victims(candidates: &[EvictionCandidate], budget: u64) -> EvictionPlan {
    let total: u64 = candidates.iter().map(|c| c.size).sum();
    let mut plan = EvictionPlan {
        projected_total: total,
        ..EvictionPlan::default()
    };

    for candidate in candidates
        .iter()
        .filter(|c| c.is_evictable() && c.is_forced())
    {
        take(&mut plan, candidate);
    }

    if plan.projected_total <= budget {
        return plan;
    }

    let mut lru: Vec<&EvictionCandidate> = candidates
        .iter()
        .filter(|c| c.is_evictable() && !c.is_forced())
        .collect();
    lru.sort_by_key(|c| (c.last_access, c.id));

    for candidate in lru {
        if plan.projected_total <= budget {
            break;
        }
        take(&mut plan, candidate);
    }

    plan
}

fn take(plan: &mut EvictionPlan, candidate: &EvictionCandidate) {
    plan.victims.push(candidate.id);
    plan.bytes_to_free += candidate.size;
    plan.projected_total = plan.projected_total.saturating_sub(candidate.size);
}

/// Format bytes in human-readable units (KiB, MiB, GiB, TiB)
pub(crate) fn format_bytes_human(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
