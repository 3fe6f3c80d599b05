//! Proxmox VE REST client
//!
//! Only the handful of endpoints a bring-up needs: clone, configure, resize,
//! power, delete, and task polling. Requests authenticate with an API token.

mod lifecycle;

pub use lifecycle::{Hypervisor, cleanup, provision, required_restarts};

use crate::config::ProxmoxConnection;
use crate::error::{Result, SetupError};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_PORT: u16 = 8006;

/// Default limits for waiting on a hypervisor task
pub const TASK_TIMEOUT: Duration = Duration::from_secs(300);
pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// `GET /nodes/{node}/tasks/{upid}/status`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Succeeded,
    Failed(String),
}

impl TaskStatus {
    pub fn state(&self) -> TaskState {
        if self.status != "stopped" {
            return TaskState::Running;
        }
        match self.exitstatus.as_deref() {
            Some("OK") => TaskState::Succeeded,
            Some(other) => TaskState::Failed(other.to_string()),
            None => TaskState::Failed("no exit status".to_string()),
        }
    }
}

/// Poll until the task stops, failing on a non-OK exit or after `timeout`
pub fn wait_for_task<F>(upid: &str, timeout: Duration, interval: Duration, mut poll: F) -> Result<()>
where
    F: FnMut() -> Result<TaskStatus>,
{
    let started = Instant::now();
    info!(task = upid, "waiting for task");
    while started.elapsed() < timeout {
        match poll()?.state() {
            TaskState::Succeeded => {
                info!(task = upid, "task finished OK");
                return Ok(());
            }
            TaskState::Failed(exit) => {
                return Err(SetupError::hypervisor_task(format!(
                    "task {} failed with exit status: {}",
                    upid, exit
                )));
            }
            TaskState::Running => {
                debug!(task = upid, "task in progress");
                std::thread::sleep(interval);
            }
        }
    }
    Err(SetupError::hypervisor_task(format!(
        "task {} did not complete in {} seconds",
        upid,
        timeout.as_secs()
    )))
}

/// `https://host:8006/api2/json` from whatever form the config file used
pub fn api_base(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let with_scheme = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    };
    let authority = with_scheme
        .split("://")
        .nth(1)
        .unwrap_or_default()
        .split('/')
        .next()
        .unwrap_or_default();
    let with_port = if authority.contains(':') {
        with_scheme
    } else {
        with_scheme.replacen(authority, &format!("{}:{}", authority, DEFAULT_PORT), 1)
    };
    if with_port.ends_with("/api2/json") {
        with_port
    } else {
        format!("{}/api2/json", with_port)
    }
}

pub fn auth_header(conn: &ProxmoxConnection) -> String {
    format!(
        "PVEAPIToken={}!{}={}",
        conn.proxmox_user, conn.token_name, conn.token
    )
}

pub struct ProxmoxClient {
    client: Client,
    base: String,
    auth: String,
    template_id: u32,
    task_timeout: Duration,
    task_interval: Duration,
}

impl ProxmoxClient {
    pub fn new(conn: &ProxmoxConnection) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!conn.ssl_verify)
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            base: api_base(&conn.url),
            auth: auth_header(conn),
            template_id: conn.template_id,
            task_timeout: TASK_TIMEOUT,
            task_interval: TASK_POLL_INTERVAL,
        })
    }

    pub fn template_id(&self) -> u32 {
        self.template_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response: Response = request.header("Authorization", &self.auth).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SetupError::hypervisor_task(format!(
                "{} rejected: HTTP {} - {}",
                what,
                status,
                body.trim()
            )));
        }
        let envelope: Envelope<T> = response.json()?;
        Ok(envelope.data)
    }

    /// Wait on the task an async endpoint returned, if it returned one
    fn follow(&self, node: &str, upid: Option<String>) -> Result<()> {
        match upid {
            Some(upid) if upid.starts_with("UPID:") => self.wait(node, &upid),
            _ => Ok(()),
        }
    }

    pub fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus> {
        let url = self.url(&format!("nodes/{}/tasks/{}/status", node, upid));
        self.send(self.client.get(url), "task status")
    }

    pub fn wait(&self, node: &str, upid: &str) -> Result<()> {
        // Freshly created tasks are not always queryable right away
        std::thread::sleep(Duration::from_secs(2));
        wait_for_task(upid, self.task_timeout, self.task_interval, || {
            self.task_status(node, upid)
        })
    }

    /// Clone the template into `vm_id` and wait for the copy to finish
    pub fn clone_template(&self, node: &str, vm_id: u32, name: &str, full: bool) -> Result<()> {
        let url = self.url(&format!("nodes/{}/qemu/{}/clone", node, self.template_id));
        let form = [
            ("newid", vm_id.to_string()),
            ("name", name.to_string()),
            ("target", node.to_string()),
            ("full", u8::from(full).to_string()),
        ];
        let upid: Option<String> = self.send(self.client.post(url).form(&form), "clone")?;
        self.follow(node, upid)
    }

    /// Set config keys on a VM (`PUT` applies them synchronously)
    pub fn set_config(&self, node: &str, vm_id: u32, params: &[(&str, String)]) -> Result<()> {
        let url = self.url(&format!("nodes/{}/qemu/{}/config", node, vm_id));
        let upid: Option<String> = self.send(self.client.put(url).form(params), "config")?;
        self.follow(node, upid)
    }

    /// Grow the boot disk by `gigabytes`
    pub fn grow_disk(&self, node: &str, vm_id: u32, gigabytes: u32) -> Result<()> {
        let url = self.url(&format!("nodes/{}/qemu/{}/resize", node, vm_id));
        let form = [("disk", "scsi0".to_string()), ("size", format!("+{}G", gigabytes))];
        let upid: Option<String> = self.send(self.client.put(url).form(&form), "resize")?;
        self.follow(node, upid)
    }

    fn power(&self, node: &str, vm_id: u32, action: &str) -> Result<()> {
        let url = self.url(&format!("nodes/{}/qemu/{}/status/{}", node, vm_id, action));
        let upid: Option<String> = self.send(self.client.post(url), action)?;
        self.follow(node, upid)
    }

    pub fn start(&self, node: &str, vm_id: u32) -> Result<()> {
        self.power(node, vm_id, "start")
    }

    pub fn shutdown(&self, node: &str, vm_id: u32) -> Result<()> {
        self.power(node, vm_id, "shutdown")
    }

    pub fn delete(&self, node: &str, vm_id: u32) -> Result<()> {
        let url = self.url(&format!("nodes/{}/qemu/{}", node, vm_id));
        let upid: Option<String> = self.send(self.client.delete(url), "delete")?;
        self.follow(node, upid)
    }
}
