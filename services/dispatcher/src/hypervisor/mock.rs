//! In-memory hypervisor for testing and development.
//!
//! Behaves like a single Proxmox cluster: clones are created stopped, start
//! flips them to running, stopping an already stopped instance is an error,
//! and deleting removes the instance. Every call is recorded in order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fleet_reconcile::Vmid;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CloneRequest, Hypervisor, InstanceRecord, TaskHandle, TaskState, TASK_OK};
use crate::error::{DispatchError, DispatchResult};

/// Hypervisor operations, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Clone,
    SetBootConfig,
    RegenerateBootConfig,
    Start,
    Stop,
    Delete,
    Upload,
}

/// A recorded call against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    List { node: String },
    Clone { template: Vmid, new_vmid: Vmid, name: String },
    SetBootConfig { vmid: Vmid, cicustom: String },
    RegenerateBootConfig { vmid: Vmid },
    Start { vmid: Vmid },
    Stop { vmid: Vmid },
    Delete { vmid: Vmid },
    Upload { storage: String, file_name: String },
}

struct MockTask {
    polls_remaining: u32,
    exit_status: String,
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, BTreeMap<Vmid, InstanceRecord>>,
    calls: Vec<HypervisorCall>,
    tasks: HashMap<String, MockTask>,
    failing_requests: HashSet<Operation>,
    failing_tasks: HashSet<Operation>,
    snippets: HashMap<String, String>,
    boot_configs: HashMap<Vmid, String>,
    task_polls: u32,
    task_status_queries: u64,
}

/// In-memory [`Hypervisor`].
#[derive(Default)]
pub struct MockHypervisor {
    state: Mutex<State>,
    task_counter: AtomicU64,
}

impl MockHypervisor {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every task as running for `polls` status queries before it stops.
    pub async fn set_task_polls(&self, polls: u32) {
        self.state.lock().await.task_polls = polls;
    }

    /// Add a template instance.
    pub async fn add_template(&self, node: &str, vmid: u32, name: &str) {
        self.insert(node, vmid, name, "stopped", true).await;
    }

    /// Add an ordinary instance with the given power status.
    pub async fn add_instance(&self, node: &str, vmid: u32, name: &str, status: &str) {
        self.insert(node, vmid, name, status, false).await;
    }

    /// Put a config lock on an instance.
    pub async fn set_lock(&self, node: &str, vmid: u32, lock: &str) {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .nodes
            .get_mut(node)
            .and_then(|n| n.get_mut(&Vmid::new(vmid)))
        {
            record.lock = Some(lock.to_string());
        }
    }

    /// Make requests for `op` fail with an API error.
    pub async fn fail_requests(&self, op: Operation) {
        self.state.lock().await.failing_requests.insert(op);
    }

    /// Make tasks created by `op` finish with a failure exit status.
    pub async fn fail_tasks(&self, op: Operation) {
        self.state.lock().await.failing_tasks.insert(op);
    }

    /// Report boot-config regeneration as not implemented.
    pub async fn set_regenerate_unsupported(&self) {
        self.state
            .lock()
            .await
            .failing_requests
            .insert(Operation::RegenerateBootConfig);
    }

    /// Current instances on a node, ordered by VMID.
    pub async fn instances(&self, node: &str) -> Vec<InstanceRecord> {
        self.state
            .lock()
            .await
            .nodes
            .get(node)
            .map(|n| n.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Recorded calls in order.
    pub async fn calls(&self) -> Vec<HypervisorCall> {
        self.state.lock().await.calls.clone()
    }

    /// Snippets uploaded to storage, keyed by `<storage>:<file name>`.
    pub async fn snippets(&self) -> HashMap<String, String> {
        self.state.lock().await.snippets.clone()
    }

    /// `cicustom` value attached to an instance.
    pub async fn boot_config(&self, vmid: u32) -> Option<String> {
        self.state
            .lock()
            .await
            .boot_configs
            .get(&Vmid::new(vmid))
            .cloned()
    }

    /// Number of task status queries served.
    pub async fn task_status_queries(&self) -> u64 {
        self.state.lock().await.task_status_queries
    }

    async fn insert(&self, node: &str, vmid: u32, name: &str, status: &str, template: bool) {
        let vmid = Vmid::new(vmid);
        self.state.lock().await.nodes.entry(node.to_string()).or_default().insert(
            vmid,
            InstanceRecord {
                vmid,
                name: name.to_string(),
                status: status.to_string(),
                lock: None,
                template,
            },
        );
    }

    fn check_request(state: &State, op: Operation) -> DispatchResult<()> {
        if !state.failing_requests.contains(&op) {
            return Ok(());
        }
        if op == Operation::RegenerateBootConfig {
            return Err(DispatchError::Unsupported(
                "regenerate boot config not implemented".to_string(),
            ));
        }
        Err(DispatchError::Api {
            status: 500,
            message: format!("mock failure for {op:?}"),
        })
    }

    fn new_task(&self, state: &mut State, op: Operation) -> Option<TaskHandle> {
        let n = self.task_counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("UPID:mock:{n:08X}:{op:?}:");
        let exit_status = if state.failing_tasks.contains(&op) {
            "command failed".to_string()
        } else {
            TASK_OK.to_string()
        };
        state.tasks.insert(
            id.clone(),
            MockTask {
                polls_remaining: state.task_polls,
                exit_status,
            },
        );
        Some(TaskHandle::new(id))
    }

    fn instance_mut<'a>(
        state: &'a mut State,
        node: &str,
        vmid: Vmid,
    ) -> DispatchResult<&'a mut InstanceRecord> {
        state
            .nodes
            .get_mut(node)
            .and_then(|n| n.get_mut(&vmid))
            .ok_or_else(|| DispatchError::Api {
                status: 500,
                message: format!(
                    "Configuration file 'nodes/{node}/qemu-server/{vmid}.conf' does not exist"
                ),
            })
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn list_instances(&self, node: &str) -> DispatchResult<Vec<InstanceRecord>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::List {
            node: node.to_string(),
        });
        Self::check_request(&state, Operation::List)
            .map_err(|e| DispatchError::query(format!("list instances on {node}"), e))?;
        Ok(state
            .nodes
            .get(node)
            .map(|n| n.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn task_status(&self, _node: &str, task: &TaskHandle) -> DispatchResult<TaskState> {
        let mut state = self.state.lock().await;
        state.task_status_queries += 1;
        let entry = state
            .tasks
            .get_mut(task.as_str())
            .ok_or_else(|| DispatchError::NotFound(format!("task {task}")))?;

        if entry.polls_remaining > 0 {
            entry.polls_remaining -= 1;
            return Ok(TaskState::Running);
        }
        Ok(TaskState::Stopped {
            exit_status: Some(entry.exit_status.clone()),
        })
    }

    async fn clone_instance(
        &self,
        node: &str,
        template: Vmid,
        request: &CloneRequest,
    ) -> DispatchResult<Option<TaskHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::Clone {
            template,
            new_vmid: request.new_vmid,
            name: request.name.clone(),
        });
        Self::check_request(&state, Operation::Clone)?;

        let nodes = &state.nodes;
        let is_template = nodes
            .get(node)
            .and_then(|n| n.get(&template))
            .is_some_and(|r| r.template);
        if !is_template {
            return Err(DispatchError::Api {
                status: 500,
                message: format!("{template} is not a template"),
            });
        }
        if nodes
            .get(&request.target)
            .is_some_and(|n| n.contains_key(&request.new_vmid))
        {
            return Err(DispatchError::Api {
                status: 500,
                message: format!("VM {} already exists", request.new_vmid),
            });
        }

        debug!(vmid = %request.new_vmid, name = %request.name, "[MOCK] Cloning template");
        state.nodes.entry(request.target.clone()).or_default().insert(
            request.new_vmid,
            InstanceRecord {
                vmid: request.new_vmid,
                name: request.name.clone(),
                status: "stopped".to_string(),
                lock: None,
                template: false,
            },
        );
        Ok(self.new_task(&mut state, Operation::Clone))
    }

    async fn set_boot_config(
        &self,
        node: &str,
        vmid: Vmid,
        cicustom: &str,
    ) -> DispatchResult<Option<TaskHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::SetBootConfig {
            vmid,
            cicustom: cicustom.to_string(),
        });
        Self::check_request(&state, Operation::SetBootConfig)?;
        Self::instance_mut(&mut state, node, vmid)?;
        state.boot_configs.insert(vmid, cicustom.to_string());
        Ok(self.new_task(&mut state, Operation::SetBootConfig))
    }

    async fn regenerate_boot_config(
        &self,
        node: &str,
        vmid: Vmid,
    ) -> DispatchResult<Option<TaskHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::RegenerateBootConfig { vmid });
        Self::check_request(&state, Operation::RegenerateBootConfig)?;
        Self::instance_mut(&mut state, node, vmid)?;
        Ok(self.new_task(&mut state, Operation::RegenerateBootConfig))
    }

    async fn start_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::Start { vmid });
        Self::check_request(&state, Operation::Start)?;
        let fails = state.failing_tasks.contains(&Operation::Start);
        let record = Self::instance_mut(&mut state, node, vmid)?;
        if !fails {
            record.status = "running".to_string();
        }
        Ok(self.new_task(&mut state, Operation::Start))
    }

    async fn stop_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::Stop { vmid });
        Self::check_request(&state, Operation::Stop)?;
        let record = Self::instance_mut(&mut state, node, vmid)?;
        if record.status == "stopped" {
            return Err(DispatchError::Api {
                status: 500,
                message: format!("VM {vmid} not running"),
            });
        }
        record.status = "stopped".to_string();
        Ok(self.new_task(&mut state, Operation::Stop))
    }

    async fn delete_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::Delete { vmid });
        Self::check_request(&state, Operation::Delete)?;
        Self::instance_mut(&mut state, node, vmid)?;
        if !state.failing_tasks.contains(&Operation::Delete) {
            if let Some(n) = state.nodes.get_mut(node) {
                n.remove(&vmid);
            }
            state.boot_configs.remove(&vmid);
        }
        Ok(self.new_task(&mut state, Operation::Delete))
    }

    async fn upload_snippet(
        &self,
        _node: &str,
        storage: &str,
        file_name: &str,
        contents: String,
    ) -> DispatchResult<Option<TaskHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(HypervisorCall::Upload {
            storage: storage.to_string(),
            file_name: file_name.to_string(),
        });
        Self::check_request(&state, Operation::Upload)?;
        state
            .snippets
            .insert(format!("{storage}:{file_name}"), contents);
        Ok(self.new_task(&mut state, Operation::Upload))
    }
}
