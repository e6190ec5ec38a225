//! Hypervisor interface.
//!
//! The dispatcher drives the hypervisor only through the [`Hypervisor`]
//! trait. Mutating calls hand back an optional [`TaskHandle`]: the
//! hypervisor runs most operations asynchronously and the caller must await
//! the task (see [`crate::task::TaskWaiter`]) before depending on its effect.
//!
//! - [`ProxmoxClient`]: Proxmox VE REST API over HTTPS
//! - [`MockHypervisor`]: in-memory implementation for tests and development

use std::fmt;

use async_trait::async_trait;
use fleet_reconcile::Vmid;

use crate::error::DispatchResult;

mod mock;
mod proxmox;

pub use mock::{HypervisorCall, MockHypervisor, Operation};
pub use proxmox::{ProxmoxClient, ProxmoxConfig};

/// Opaque reference to an in-progress hypervisor task (a Proxmox UPID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exit status the hypervisor reports for a successful task.
pub const TASK_OK: &str = "OK";

/// State of a hypervisor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Still running.
    Running,

    /// Finished. `exit_status` is absent or [`TASK_OK`] on success.
    Stopped { exit_status: Option<String> },
}

/// One instance as listed by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub vmid: Vmid,
    pub name: String,
    /// Raw power status (`running`, `stopped`, ...).
    pub status: String,
    /// Operation currently holding the instance's config lock, if any.
    pub lock: Option<String>,
    /// Whether the instance is a template.
    pub template: bool,
}

/// Parameters for cloning a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub new_vmid: Vmid,
    pub name: String,
    /// Node the clone is created on.
    pub target: String,
    /// Full copy instead of a linked clone.
    pub full: bool,
}

/// Hypervisor operations the dispatcher depends on.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// List every instance on a node.
    async fn list_instances(&self, node: &str) -> DispatchResult<Vec<InstanceRecord>>;

    /// Current state of a task.
    async fn task_status(&self, node: &str, task: &TaskHandle) -> DispatchResult<TaskState>;

    /// Clone template `template` into a new instance.
    async fn clone_instance(
        &self,
        node: &str,
        template: Vmid,
        request: &CloneRequest,
    ) -> DispatchResult<Option<TaskHandle>>;

    /// Attach a boot-config artifact (a `cicustom` volume spec) to an instance.
    async fn set_boot_config(
        &self,
        node: &str,
        vmid: Vmid,
        cicustom: &str,
    ) -> DispatchResult<Option<TaskHandle>>;

    /// Regenerate the instance's boot-time configuration drive.
    ///
    /// May fail with [`crate::DispatchError::Unsupported`].
    async fn regenerate_boot_config(
        &self,
        node: &str,
        vmid: Vmid,
    ) -> DispatchResult<Option<TaskHandle>>;

    async fn start_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>>;

    async fn stop_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>>;

    async fn delete_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>>;

    /// Upload a snippet file to hypervisor-managed storage.
    async fn upload_snippet(
        &self,
        node: &str,
        storage: &str,
        file_name: &str,
        contents: String,
    ) -> DispatchResult<Option<TaskHandle>>;
}
