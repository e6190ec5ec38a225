//! Runner pool model.
//!
//! A pool is one class of runner capacity: the labels it advertises, the node
//! and template it clones from, and the VMID range its instances live in.
//! Pools are built once from configuration and never change during a run.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::labels::{match_label_set, normalize_labels, LabelSet};

/// Pool definition errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No pools were defined.
    #[error("no runner pools defined")]
    NoPools,

    /// A pool has an empty name.
    #[error("pool name must not be empty")]
    EmptyName,

    /// A pool has an empty name prefix.
    #[error("pool {0}: runner name prefix must not be empty")]
    EmptyPrefix(String),

    /// The VMID range is empty.
    #[error("pool {pool}: vmid range {start}..={end} is empty")]
    InvalidRange { pool: String, start: u32, end: u32 },

    /// Two pools share a name.
    #[error("duplicate pool name: {0}")]
    DuplicateName(String),

    /// Two pools have prefixes that would make instance ownership ambiguous.
    #[error("pools {first} and {second} have overlapping runner name prefixes")]
    AmbiguousPrefix { first: String, second: String },
}

/// Hypervisor instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vmid(u32);

impl Vmid {
    /// Wrap a raw VMID.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw numeric VMID.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for Vmid {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Vmid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive VMID range a pool allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmidRange {
    start: u32,
    end: u32,
}

impl VmidRange {
    /// Create a range; `None` if it would be empty.
    pub fn new(start: u32, end: u32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> Vmid {
        Vmid(self.start)
    }

    pub fn end(&self) -> Vmid {
        Vmid(self.end)
    }

    /// Whether the range contains `vmid`.
    pub fn contains(&self, vmid: Vmid) -> bool {
        (self.start..=self.end).contains(&vmid.0)
    }

    /// Iterate the range in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Vmid> {
        (self.start..=self.end).map(Vmid)
    }

    /// Number of VMIDs in the range.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Always false; empty ranges cannot be constructed.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for VmidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Fully resolved pool definition, before validation.
///
/// Every field is concrete here; inheritance from global defaults happens in
/// the configuration layer.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    pub name: String,
    pub node: String,
    pub template: String,
    pub labels: Vec<String>,
    pub prefix: String,
    pub vmid_start: u32,
    pub vmid_end: u32,
    /// Maximum concurrently active instances, 0 for unbounded.
    pub max_runners: u32,
    pub user_data_template: PathBuf,
    pub storage: String,
    pub runner_user: String,
}

/// A validated runner pool.
#[derive(Debug, Clone)]
pub struct Pool {
    name: String,
    node: String,
    template: String,
    labels: Vec<String>,
    match_labels: LabelSet,
    prefix: String,
    vmid_range: VmidRange,
    max_runners: u32,
    user_data_template: PathBuf,
    storage: String,
    runner_user: String,
}

impl Pool {
    /// Validate and normalize a pool definition.
    pub fn new(spec: PoolSpec) -> Result<Self, PoolError> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(PoolError::EmptyName);
        }
        let prefix = spec.prefix.trim().to_string();
        if prefix.is_empty() {
            return Err(PoolError::EmptyPrefix(name));
        }
        let vmid_range =
            VmidRange::new(spec.vmid_start, spec.vmid_end).ok_or_else(|| {
                PoolError::InvalidRange {
                    pool: name.clone(),
                    start: spec.vmid_start,
                    end: spec.vmid_end,
                }
            })?;

        let labels = normalize_labels(&spec.labels);
        let match_labels = match_label_set(&labels);

        Ok(Self {
            name,
            node: spec.node,
            template: spec.template,
            labels,
            match_labels,
            prefix,
            vmid_range,
            max_runners: spec.max_runners,
            user_data_template: spec.user_data_template,
            storage: spec.storage,
            runner_user: spec.runner_user,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hypervisor node the pool's instances run on.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Name of the template instance clones are made from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Declared labels in configuration order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Declared labels plus the implicit self-hosted marker.
    pub fn match_labels(&self) -> &LabelSet {
        &self.match_labels
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn vmid_range(&self) -> VmidRange {
        self.vmid_range
    }

    /// Per-pool cap, `None` when unbounded.
    pub fn max_runners(&self) -> Option<u32> {
        (self.max_runners > 0).then_some(self.max_runners)
    }

    pub fn user_data_template(&self) -> &PathBuf {
        &self.user_data_template
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub fn runner_user(&self) -> &str {
        &self.runner_user
    }

    /// Labels joined the way the runner's `--labels` flag expects them.
    pub fn labels_csv(&self) -> String {
        self.labels.join(",")
    }

    /// Whether a job requiring `job_labels` can run on this pool.
    pub fn is_capable(&self, job_labels: &LabelSet) -> bool {
        job_labels.is_subset(&self.match_labels)
    }

    /// Instance name for a VMID in this pool: `<prefix>-<vmid>`.
    pub fn instance_name(&self, vmid: Vmid) -> String {
        format!("{}-{}", self.prefix, vmid)
    }

    /// Whether an instance name belongs to this pool.
    ///
    /// The name must be exactly `<prefix>-<digits>`.
    pub fn owns(&self, instance_name: &str) -> bool {
        instance_name
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
    }
}

/// Validate a pool registry as a whole.
///
/// Rejects an empty registry, duplicate names, and prefixes where one pool's
/// `<prefix>-` is a prefix of another's.
pub fn validate_pools(pools: &[Pool]) -> Result<(), PoolError> {
    if pools.is_empty() {
        return Err(PoolError::NoPools);
    }

    let mut names = HashSet::new();
    for pool in pools {
        if !names.insert(pool.name.as_str()) {
            return Err(PoolError::DuplicateName(pool.name.clone()));
        }
    }

    for (i, a) in pools.iter().enumerate() {
        for b in &pools[i + 1..] {
            let pa = format!("{}-", a.prefix);
            let pb = format!("{}-", b.prefix);
            if pa.starts_with(&pb) || pb.starts_with(&pa) {
                return Err(PoolError::AmbiguousPrefix {
                    first: a.name.clone(),
                    second: b.name.clone(),
                });
            }
        }
    }

    Ok(())
}
