//! Configuration input
//!
//! Three files drive a run: the inventory (JSON list of hosts), the Proxmox
//! connection (JSON), and optional cluster settings (TOML). Everything is
//! validated here, before any host or hypervisor is contacted.

mod settings;

pub use settings::{ClusterSettings, Delays, KeepalivedSettings};

use crate::error::{Result, SetupError};
use crate::inventory::{HostDescriptor, Inventory};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Environment variable that overrides the API token from the connection file
pub const PROXMOX_TOKEN_ENV: &str = "PROXMOX_TOKEN";

/// How to reach the Proxmox API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxmoxConnection {
    pub proxmox_user: String,
    /// Host or URL of the API, e.g. `pve.lab:8006` or `https://pve.lab:8006`
    pub url: String,
    pub token_name: String,
    pub token: String,
    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: bool,
    /// VM id of the template every host is cloned from
    pub template_id: u32,
}

fn default_ssl_verify() -> bool {
    true
}

fn require_json(path: &Path) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(()),
        _ => Err(SetupError::configuration(format!(
            "{} must be a JSON file",
            path.display()
        ))),
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        SetupError::configuration(format!("failed to read {}: {}", path.display(), e))
    })
}

/// Parse and validate an inventory file
pub fn load_inventory(path: &Path) -> Result<Inventory> {
    require_json(path)?;
    parse_inventory(&read(path)?).map_err(|e| match e {
        SetupError::Configuration(msg) => {
            SetupError::configuration(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

pub fn parse_inventory(content: &str) -> Result<Inventory> {
    let hosts: Vec<HostDescriptor> = serde_json::from_str(content)
        .map_err(|e| SetupError::configuration(format!("invalid inventory: {}", e)))?;
    if hosts.len() < 2 {
        return Err(SetupError::configuration(
            "the inventory must define at least two hosts",
        ));
    }
    Inventory::new(hosts)
}

/// Parse the connection file; `PROXMOX_TOKEN` wins over the file's token
pub fn load_proxmox_connection(path: &Path) -> Result<ProxmoxConnection> {
    require_json(path)?;
    let conn: ProxmoxConnection = serde_json::from_str(&read(path)?).map_err(|e| {
        SetupError::configuration(format!("invalid proxmox config {}: {}", path.display(), e))
    })?;

    with_token_override(conn, std::env::var(PROXMOX_TOKEN_ENV).ok(), path)
}

/// A non-blank `override_token` replaces the file's token; some token must remain
fn with_token_override(
    mut conn: ProxmoxConnection,
    override_token: Option<String>,
    path: &Path,
) -> Result<ProxmoxConnection> {
    if let Some(token) = override_token.filter(|t| !t.trim().is_empty()) {
        conn.token = token.trim().to_string();
    }
    if conn.token.trim().is_empty() {
        return Err(SetupError::configuration(format!(
            "no Proxmox API token: set `token` in {} or {}",
            path.display(),
            PROXMOX_TOKEN_ENV
        )));
    }
    Ok(conn)
}

/// Cluster settings from TOML, or defaults when no file is given
pub fn load_settings(path: Option<&Path>) -> Result<ClusterSettings> {
    let Some(path) = path else {
        return Ok(ClusterSettings::default());
    };
    toml::from_str(&read(path)?).map_err(|e| {
        SetupError::configuration(format!("invalid settings {}: {}", path.display(), e))
    })
}
