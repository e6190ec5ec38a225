//! Reclaiming finished runners.
//!
//! A runner powers its VM off after its single job; the reclaimer deletes
//! every stopped instance a pool owns. Running and starting instances are
//! never touched, so shrinking the fleet only ever means removing VMs that
//! already stopped themselves.

use std::sync::Arc;

use fleet_reconcile::{Pool, Vmid};
use tracing::{error, info, instrument, warn};

use crate::error::DispatchResult;
use crate::hypervisor::Hypervisor;
use crate::inventory::Inventory;
use crate::task::TaskWaiter;

/// Outcome of one reclaim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// `(node, vmid)` of deleted instances.
    pub reclaimed: Vec<(String, Vmid)>,
    /// Deletions that failed and will be retried next cycle.
    pub failed: usize,
}

/// Deletes stopped pool instances.
pub struct Reclaimer {
    hypervisor: Arc<dyn Hypervisor>,
    waiter: TaskWaiter,
}

impl Reclaimer {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, waiter: TaskWaiter) -> Self {
        Self { hypervisor, waiter }
    }

    /// Delete every stopped instance owned by `pools`.
    ///
    /// Deleted instances are removed from `inventory` so their VMIDs are free
    /// for the rest of the cycle. A failed deletion is logged and skipped.
    pub async fn reclaim_stopped(
        &self,
        pools: &[Pool],
        inventory: &mut Inventory,
    ) -> ReclaimReport {
        let snapshot = &*inventory;
        let targets: Vec<(String, String, Vmid, String)> = pools
            .iter()
            .flat_map(move |pool| {
                snapshot.stopped(pool).map(move |i| {
                    (pool.name().to_string(), i.node.clone(), i.vmid, i.name.clone())
                })
            })
            .collect();

        let mut report = ReclaimReport::default();
        for (pool, node, vmid, name) in targets {
            match self.delete(&node, vmid).await {
                Ok(()) => {
                    info!(
                        pool = %pool,
                        node = %node,
                        vmid = %vmid,
                        name = %name,
                        "Reclaimed stopped runner"
                    );
                    inventory.remove(&node, vmid);
                    report.reclaimed.push((node, vmid));
                }
                Err(e) => {
                    error!(
                        pool = %pool,
                        node = %node,
                        vmid = %vmid,
                        reason = e.reason_code(),
                        error = %e,
                        "Failed to reclaim runner"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Stop (best effort) then delete one instance.
    #[instrument(skip(self))]
    pub async fn delete(&self, node: &str, vmid: Vmid) -> DispatchResult<()> {
        let stopped = match self.hypervisor.stop_instance(node, vmid).await {
            Ok(task) => self.waiter.wait(node, task).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stopped {
            // Usually the instance is already off.
            warn!(error = %e, "Stop before delete failed, continuing");
        }

        let task = self.hypervisor.delete_instance(node, vmid).await?;
        self.waiter.wait(node, task).await.inspect_err(|e| {
            warn!(error = %e, "Delete task failed");
        })
    }
}
