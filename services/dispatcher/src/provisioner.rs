//! Runner provisioning pipeline.
//!
//! Creating one runner is a strict sequence, each hypervisor step awaited
//! before the next:
//!
//! ```text
//! resolve template -> allocate VMID -> registration token -> render user-data
//!   -> publish snippet -> clone -> attach snippet -> regenerate cloud-init
//!   -> start
//! ```
//!
//! Only an "unsupported" answer to the regeneration step is tolerated; any
//! other failure aborts the pipeline without rollback. Whatever was created is
//! picked up by the next cycle's inventory like any other instance.

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_reconcile::{vmid, Pool, Vmid};
use tracing::{info, instrument, warn};

use crate::bootconfig::{render_file, snippet_file_name, BootConfigValues, SnippetPublisher};
use crate::error::{DispatchError, DispatchResult};
use crate::hypervisor::{CloneRequest, Hypervisor};
use crate::inventory::Inventory;
use crate::queue::JobQueue;
use crate::task::TaskWaiter;

/// Drives the clone -> configure -> boot pipeline for new runners.
pub struct Provisioner {
    hypervisor: Arc<dyn Hypervisor>,
    queue: Arc<dyn JobQueue>,
    waiter: TaskWaiter,
    publisher: SnippetPublisher,
    repo_url: String,
}

impl Provisioner {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        queue: Arc<dyn JobQueue>,
        waiter: TaskWaiter,
        publisher: SnippetPublisher,
        repo_url: String,
    ) -> Self {
        Self {
            hypervisor,
            queue,
            waiter,
            publisher,
            repo_url,
        }
    }

    /// Create and boot one runner for `pool`; returns its VMID.
    ///
    /// The template is looked up in `inventory`. The new VMID is reserved in
    /// `existing_vmids` as soon as it is allocated, whether or not the rest
    /// of the pipeline succeeds.
    #[instrument(
        skip(self, inventory, existing_vmids),
        fields(pool = pool.name(), node = pool.node())
    )]
    pub async fn start(
        &self,
        pool: &Pool,
        inventory: &Inventory,
        existing_vmids: &mut BTreeSet<Vmid>,
    ) -> DispatchResult<Vmid> {
        let node = pool.node();

        let template = inventory.find_template(pool).ok_or_else(|| {
            DispatchError::NotFound(format!("template {} on node {node}", pool.template()))
        })?;
        let template_vmid = template.vmid;

        let vmid = vmid::reserve(pool.vmid_range(), existing_vmids).ok_or_else(|| {
            DispatchError::ExhaustedRange {
                pool: pool.name().to_string(),
                range: pool.vmid_range(),
            }
        })?;
        let name = pool.instance_name(vmid);

        let token = self.queue.registration_token(&name).await?;

        let values = BootConfigValues {
            repo_url: self.repo_url.clone(),
            registration_token: token.token,
            runner_labels: pool.labels_csv(),
            runner_name: name.clone(),
            runner_user: pool.runner_user().to_string(),
        };
        let user_data = render_file(pool.user_data_template(), &values).await?;

        let file_name = snippet_file_name(&name);
        let cicustom = self.publisher.publish(pool, &file_name, user_data).await?;

        let request = CloneRequest {
            new_vmid: vmid,
            name: name.clone(),
            target: node.to_string(),
            full: false,
        };
        let task = self
            .hypervisor
            .clone_instance(node, template_vmid, &request)
            .await?;
        self.waiter.wait(node, task).await?;

        let task = self.hypervisor.set_boot_config(node, vmid, &cicustom).await?;
        self.waiter.wait(node, task).await?;

        match self.regenerate_boot_config(node, vmid).await {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => {
                warn!(vmid = %vmid, "Cloud-init regeneration not supported, continuing");
            }
            Err(e) => return Err(e),
        }

        let task = self.hypervisor.start_instance(node, vmid).await?;
        self.waiter.wait(node, task).await?;

        info!(vmid = %vmid, name = %name, "Started runner");
        Ok(vmid)
    }

    async fn regenerate_boot_config(&self, node: &str, vmid: Vmid) -> DispatchResult<()> {
        let task = self.hypervisor.regenerate_boot_config(node, vmid).await?;
        self.waiter.wait(node, task).await
    }
}
