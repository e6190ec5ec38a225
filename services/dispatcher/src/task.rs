//! Waiting for asynchronous hypervisor tasks.
//!
//! Every mutating hypervisor call returns a task handle; the dependent step
//! may only run once that task has stopped successfully. Polling has no
//! overall deadline: a stuck task stalls the cycle that issued it.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use crate::hypervisor::{Hypervisor, TaskHandle, TaskState, TASK_OK};

/// Polls a hypervisor task until it stops.
#[derive(Clone)]
pub struct TaskWaiter {
    hypervisor: Arc<dyn Hypervisor>,
    interval: Duration,
}

impl TaskWaiter {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, interval: Duration) -> Self {
        Self {
            hypervisor,
            interval,
        }
    }

    /// Wait for `task` on `node` to finish.
    ///
    /// `None` means the hypervisor completed the operation synchronously.
    /// Fails with [`DispatchError::TaskFailed`] when the task stops with an
    /// exit status other than `OK`.
    pub async fn wait(&self, node: &str, task: Option<TaskHandle>) -> DispatchResult<()> {
        let Some(task) = task else {
            return Ok(());
        };

        loop {
            match self.hypervisor.task_status(node, &task).await? {
                TaskState::Stopped { exit_status } => {
                    return match exit_status {
                        Some(status) if status != TASK_OK => Err(DispatchError::TaskFailed {
                            task: task.to_string(),
                            exit_status: status,
                        }),
                        _ => {
                            debug!(node = node, task = %task, "Task finished");
                            Ok(())
                        }
                    };
                }
                TaskState::Running => {
                    debug!(node = node, task = %task, "Task still running");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}
