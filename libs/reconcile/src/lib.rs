//! Runner fleet reconciliation primitives.
//!
//! Pure, deterministic building blocks for sizing a pool of CI runner VMs
//! against queued work. Nothing here performs IO; the dispatcher service
//! feeds these functions a snapshot of hypervisor inventory and queued jobs
//! and acts on what they return.
//!
//! - [`pool`]: pool model, validation and name-based instance ownership
//! - [`labels`]: label parsing and normalization
//! - [`matcher`]: choosing the cheapest capable pool for a job
//! - [`capacity`]: per-pool and global admission control
//! - [`vmid`]: lowest-free VMID allocation
//!
//! # Invariants
//!
//! - A pool's match labels are a superset of its declared labels
//! - Planned starts never push a pool above its cap or the fleet above the
//!   global cap
//! - VMIDs reserved against the same set are never handed out twice

use std::time::Duration;

pub mod capacity;
pub mod labels;
pub mod matcher;
pub mod pool;
pub mod vmid;

pub use capacity::{plan, StartPlan};
pub use labels::{LabelSet, SELF_HOSTED};
pub use matcher::{assign_demand, choose, Demand};
pub use pool::{validate_pools, Pool, PoolError, PoolSpec, Vmid, VmidRange};

/// Default interval between reconciliation cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default interval between hypervisor task status polls.
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
