//! Capacity accounting.
//!
//! Turns per-pool demand and active counts into the number of instances each
//! pool may start this cycle, honoring per-pool caps and a global cap shared
//! by all pools. Pools are visited in configuration order and earlier pools
//! consume the global budget first. This never plans a shrink: stopping
//! capacity is the reclaimer's job.

use std::collections::HashMap;

use crate::pool::Pool;

/// Planned starts for one cycle, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartPlan {
    starts: Vec<(String, u32)>,
}

impl StartPlan {
    /// Starts planned for a pool.
    pub fn get(&self, pool: &str) -> u32 {
        self.starts
            .iter()
            .find(|(name, _)| name == pool)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /// Total starts across all pools.
    pub fn total(&self) -> u32 {
        self.starts.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Pools with a nonzero planned start count, in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.starts
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(name, n)| (name.as_str(), *n))
    }
}

/// Compute how many instances each pool may start.
///
/// `global_cap` of 0 means unbounded. Missing map entries count as 0.
pub fn plan(
    pools: &[Pool],
    active: &HashMap<String, u32>,
    needed: &HashMap<String, u32>,
    global_cap: u32,
) -> StartPlan {
    let active_of = |name: &str| active.get(name).copied().unwrap_or(0);

    let mut remaining_global = (global_cap > 0).then(|| {
        let total_active: u32 = pools.iter().map(|p| active_of(p.name())).sum();
        global_cap.saturating_sub(total_active)
    });

    let mut starts = Vec::with_capacity(pools.len());
    for pool in pools {
        if remaining_global == Some(0) {
            starts.push((pool.name().to_string(), 0));
            continue;
        }

        let active_here = active_of(pool.name());
        let mut deficit = needed
            .get(pool.name())
            .copied()
            .unwrap_or(0)
            .saturating_sub(active_here);

        if let Some(max) = pool.max_runners() {
            deficit = deficit.min(max.saturating_sub(active_here));
        }

        if let Some(remaining) = remaining_global.as_mut() {
            deficit = deficit.min(*remaining);
            *remaining -= deficit;
        }

        starts.push((pool.name().to_string(), deficit));
    }

    StartPlan { starts }
}
