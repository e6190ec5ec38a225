//! Instance inventory.
//!
//! A snapshot of every instance on the nodes the configured pools use, taken
//! once at the start of a cycle. Pool ownership is derived from instance
//! names; the hypervisor stores nothing about pools.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use fleet_reconcile::{Pool, Vmid};
use tracing::debug;

use crate::error::DispatchResult;
use crate::hypervisor::{Hypervisor, InstanceRecord};

/// Lifecycle status of an instance, as far as the dispatcher cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Being created from a template.
    Cloning,
    /// Locked by some other hypervisor operation.
    Configuring,
    Starting,
    Running,
    /// Powered off: the runner finished its job, or provisioning never booted it.
    Stopped,
    Other(String),
}

impl InstanceStatus {
    /// Derive status from the hypervisor's power status and config lock.
    ///
    /// A held lock wins over the power status.
    pub fn from_record(status: &str, lock: Option<&str>) -> Self {
        match lock {
            Some("clone") | Some("create") => return Self::Cloning,
            Some(_) => return Self::Configuring,
            None => {}
        }
        match status {
            "running" => Self::Running,
            "starting" => Self::Starting,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    /// Counts against capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cloning => f.write_str("cloning"),
            Self::Configuring => f.write_str("configuring"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Other(s) => write!(f, "other({s})"),
        }
    }
}

/// One instance on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub node: String,
    pub vmid: Vmid,
    pub name: String,
    pub status: InstanceStatus,
    pub template: bool,
}

impl Instance {
    fn from_record(node: &str, record: InstanceRecord) -> Self {
        Self {
            node: node.to_string(),
            status: InstanceStatus::from_record(&record.status, record.lock.as_deref()),
            vmid: record.vmid,
            name: record.name,
            template: record.template,
        }
    }
}

/// Read all instances on a node straight from the hypervisor.
pub async fn list_by_node(
    hypervisor: &dyn Hypervisor,
    node: &str,
) -> DispatchResult<Vec<Instance>> {
    let records = hypervisor.list_instances(node).await?;
    Ok(records
        .into_iter()
        .map(|r| Instance::from_record(node, r))
        .collect())
}

/// Active instances of `pool` among `instances`.
pub fn active_count(pool: &Pool, instances: &[Instance]) -> u32 {
    instances
        .iter()
        .filter(|i| i.node == pool.node() && !i.template && pool.owns(&i.name))
        .filter(|i| i.status.is_active())
        .count() as u32
}

/// Per-cycle inventory snapshot, keyed by node.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    nodes: BTreeMap<String, Vec<Instance>>,
}

impl Inventory {
    /// Snapshot every node used by `pools`. Any node failing fails the gather.
    pub async fn gather(hypervisor: &dyn Hypervisor, pools: &[Pool]) -> DispatchResult<Self> {
        let mut nodes = BTreeMap::new();
        for pool in pools {
            if nodes.contains_key(pool.node()) {
                continue;
            }
            let instances = list_by_node(hypervisor, pool.node()).await?;
            debug!(node = pool.node(), count = instances.len(), "Listed instances");
            nodes.insert(pool.node().to_string(), instances);
        }
        Ok(Self { nodes })
    }

    /// Build an inventory from already-listed instances.
    #[cfg(test)]
    pub(crate) fn from_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        let mut nodes: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        for instance in instances {
            nodes.entry(instance.node.clone()).or_default().push(instance);
        }
        Self { nodes }
    }

    /// Instances on `node`.
    pub fn list_by_node(&self, node: &str) -> &[Instance] {
        self.nodes.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Instances owned by `pool`.
    pub fn pool_instances<'a>(
        &'a self,
        pool: &'a Pool,
    ) -> impl Iterator<Item = &'a Instance> + 'a {
        self.list_by_node(pool.node())
            .iter()
            .filter(move |i| !i.template && pool.owns(&i.name))
    }

    /// Active count for a single pool.
    pub fn active_count(&self, pool: &Pool) -> u32 {
        active_count(pool, self.list_by_node(pool.node()))
    }

    /// Active counts for every pool.
    pub fn active_by_pool(&self, pools: &[Pool]) -> HashMap<String, u32> {
        pools
            .iter()
            .map(|p| (p.name().to_string(), self.active_count(p)))
            .collect()
    }

    /// Stopped instances owned by `pool`.
    pub fn stopped<'a>(&'a self, pool: &'a Pool) -> impl Iterator<Item = &'a Instance> + 'a {
        self.pool_instances(pool)
            .filter(|i| i.status == InstanceStatus::Stopped)
    }

    /// Pool-owned instances that are neither active nor stopped.
    pub fn unsettled<'a>(&'a self, pool: &'a Pool) -> impl Iterator<Item = &'a Instance> + 'a {
        self.pool_instances(pool)
            .filter(|i| !i.status.is_active() && i.status != InstanceStatus::Stopped)
    }

    /// The pool's template: exact name match carrying the template flag.
    pub fn find_template(&self, pool: &Pool) -> Option<&Instance> {
        self.list_by_node(pool.node())
            .iter()
            .find(|i| i.template && i.name == pool.template())
    }

    /// Every VMID in use on `node`.
    pub fn vmids(&self, node: &str) -> BTreeSet<Vmid> {
        self.list_by_node(node).iter().map(|i| i.vmid).collect()
    }

    /// Forget an instance, e.g. after deleting it.
    pub fn remove(&mut self, node: &str, vmid: Vmid) {
        if let Some(instances) = self.nodes.get_mut(node) {
            instances.retain(|i| i.vmid != vmid);
        }
    }

    /// Record a newly created instance.
    pub fn insert(&mut self, instance: Instance) {
        self.nodes
            .entry(instance.node.clone())
            .or_default()
            .push(instance);
    }

    /// Total instances across all nodes.
    pub fn instance_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }
}
