//! Proxmox VE API client.
//!
//! Talks to `/api2/json` with an API token. Every response is wrapped in a
//! `{"data": ...}` envelope; mutating endpoints return a task UPID in `data`
//! (or `null` when the operation completed synchronously).
//!
//! Reference: https://pve.proxmox.com/pve-docs/api-viewer/

use std::time::Duration;

use async_trait::async_trait;
use fleet_reconcile::Vmid;
use reqwest::{multipart, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use super::{CloneRequest, Hypervisor, InstanceRecord, TaskHandle, TaskState};
use crate::error::{DispatchError, DispatchResult};

/// Connection settings for a Proxmox cluster.
#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// API base URL, e.g. `https://pve.example:8006/api2/json`.
    pub url: String,

    /// API token id (`user@realm!token`).
    pub token_id: String,

    pub token_secret: String,

    /// Verify the server's TLS certificate.
    pub verify_ssl: bool,

    /// Per-request timeout.
    pub timeout: Duration,
}

/// Proxmox REST API client.
pub struct ProxmoxClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct VmEntry {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    lock: Option<String>,
    #[serde(default)]
    template: Option<u8>,
}

#[derive(Deserialize)]
struct TaskStatusEntry {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

impl ProxmoxClient {
    /// Create a new client.
    pub fn new(config: &ProxmoxConfig) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_header: format!("PVEAPIToken={}={}", config.token_id, config.token_secret),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, path = path, "Proxmox API request");
        self.client
            .request(method, url)
            .header("Authorization", &self.auth_header)
    }

    /// Send a request and unwrap the `data` envelope.
    async fn send<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        path: &str,
    ) -> DispatchResult<T> {
        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::NOT_IMPLEMENTED {
                return Err(DispatchError::Unsupported(format!("{path}: {body}")));
            }
            error!(status = %status, path = path, body = %body, "Proxmox API request failed");
            return Err(DispatchError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> DispatchResult<T> {
        self.send(self.request(Method::GET, path), path).await
    }

    async fn post_task(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> DispatchResult<Option<TaskHandle>> {
        let upid: Option<String> = self
            .send(self.request(Method::POST, path).form(form), path)
            .await?;
        Ok(upid.map(TaskHandle::new))
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn list_instances(&self, node: &str) -> DispatchResult<Vec<InstanceRecord>> {
        let path = format!("/nodes/{node}/qemu");
        let entries: Vec<VmEntry> = self
            .get(&path)
            .await
            .map_err(|e| DispatchError::query(format!("list instances on {node}"), e))?;

        Ok(entries
            .into_iter()
            .map(|vm| InstanceRecord {
                vmid: Vmid::new(vm.vmid),
                name: vm.name.unwrap_or_default(),
                status: vm.status.unwrap_or_default(),
                lock: vm.lock.filter(|l| !l.is_empty()),
                template: vm.template == Some(1),
            })
            .collect())
    }

    async fn task_status(&self, node: &str, task: &TaskHandle) -> DispatchResult<TaskState> {
        let path = format!("/nodes/{node}/tasks/{task}/status");
        let entry: TaskStatusEntry = self.get(&path).await?;

        Ok(if entry.status == "stopped" {
            TaskState::Stopped {
                exit_status: entry.exitstatus,
            }
        } else {
            TaskState::Running
        })
    }

    async fn clone_instance(
        &self,
        node: &str,
        template: Vmid,
        request: &CloneRequest,
    ) -> DispatchResult<Option<TaskHandle>> {
        let path = format!("/nodes/{node}/qemu/{template}/clone");
        let form = [
            ("newid", request.new_vmid.to_string()),
            ("name", request.name.clone()),
            ("full", u8::from(request.full).to_string()),
            ("target", request.target.clone()),
        ];
        self.post_task(&path, &form).await
    }

    async fn set_boot_config(
        &self,
        node: &str,
        vmid: Vmid,
        cicustom: &str,
    ) -> DispatchResult<Option<TaskHandle>> {
        let path = format!("/nodes/{node}/qemu/{vmid}/config");
        self.post_task(&path, &[("cicustom", cicustom.to_string())]).await
    }

    async fn regenerate_boot_config(
        &self,
        node: &str,
        vmid: Vmid,
    ) -> DispatchResult<Option<TaskHandle>> {
        let path = format!("/nodes/{node}/qemu/{vmid}/cloudinit");
        self.post_task(&path, &[]).await
    }

    async fn start_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/start");
        self.post_task(&path, &[]).await
    }

    async fn stop_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>> {
        let path = format!("/nodes/{node}/qemu/{vmid}/status/stop");
        self.post_task(&path, &[]).await
    }

    async fn delete_instance(&self, node: &str, vmid: Vmid) -> DispatchResult<Option<TaskHandle>> {
        let path = format!("/nodes/{node}/qemu/{vmid}");
        let upid: Option<String> = self.send(self.request(Method::DELETE, &path), &path).await?;
        Ok(upid.map(TaskHandle::new))
    }

    async fn upload_snippet(
        &self,
        node: &str,
        storage: &str,
        file_name: &str,
        contents: String,
    ) -> DispatchResult<Option<TaskHandle>> {
        let path = format!("/nodes/{node}/storage/{storage}/upload");
        let part = multipart::Part::text(contents)
            .file_name(file_name.to_string())
            .mime_str("text/plain")?;
        let form = multipart::Form::new()
            .text("content", "snippets")
            .part("filename", part);

        let upid: Option<String> = self
            .send(self.request(Method::POST, &path).multipart(form), &path)
            .await?;
        Ok(upid.map(TaskHandle::new))
    }
}
