//! Job-to-pool matching.
//!
//! A pool is capable of a job when the job's labels are a subset of the
//! pool's match labels. Among capable pools the one with the fewest declared
//! labels wins, so a generic job lands on the most specialized cheap pool
//! rather than on a bigger one that merely also qualifies. Ties go to the
//! pool configured first.

use std::collections::HashMap;

use crate::labels::{label_set, LabelSet};
use crate::pool::Pool;

/// Choose the pool a job should run on, if any pool can run it.
pub fn choose<'a>(pools: &'a [Pool], job_labels: &LabelSet) -> Option<&'a Pool> {
    pools
        .iter()
        .filter(|pool| pool.is_capable(job_labels))
        .min_by_key(|pool| pool.labels().len())
}

/// Queued demand per pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demand {
    by_pool: HashMap<String, u32>,
    unmatched: usize,
}

impl Demand {
    /// Queued jobs assigned to a pool.
    pub fn needed(&self, pool: &str) -> u32 {
        self.by_pool.get(pool).copied().unwrap_or(0)
    }

    /// Per-pool counts.
    pub fn by_pool(&self) -> &HashMap<String, u32> {
        &self.by_pool
    }

    /// Jobs no configured pool can run.
    pub fn unmatched(&self) -> usize {
        self.unmatched
    }

    /// Total jobs assigned to some pool.
    pub fn total(&self) -> u32 {
        self.by_pool.values().sum()
    }
}

/// Assign every queued job to a pool and count demand per pool.
///
/// Job label sets are normalized before matching.
pub fn assign_demand<I, J, S>(pools: &[Pool], jobs: I) -> Demand
where
    I: IntoIterator<Item = J>,
    J: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut demand = Demand::default();
    for job in jobs {
        let labels = label_set(job);
        match choose(pools, &labels) {
            Some(pool) => *demand.by_pool.entry(pool.name().to_string()).or_insert(0) += 1,
            None => demand.unmatched += 1,
        }
    }
    demand
}
