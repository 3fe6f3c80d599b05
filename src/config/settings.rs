use crate::inventory::HaRole;
use crate::runner::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs for one bring-up. Every field has a default, so a settings file only
/// needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Kubernetes minor version used for the apt repository, e.g. `1.30`
    pub kube_version: String,
    /// Release of the Calico operator applied before the overlay manifest
    pub calico_version: String,
    pub pod_subnet: String,
    pub service_subnet: String,
    /// Run `apt-get upgrade` during preparation
    pub upgrade: bool,
    pub failure_policy: FailurePolicy,
    pub delays: Delays,
    pub keepalived: KeepalivedSettings,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            kube_version: "1.30".to_string(),
            calico_version: "3.28.0".to_string(),
            pod_subnet: "10.244.0.0".to_string(),
            service_subnet: "10.96.0.0".to_string(),
            upgrade: true,
            failure_policy: FailurePolicy::BestEffort,
            delays: Delays::default(),
            keepalived: KeepalivedSettings::default(),
        }
    }
}

/// Fixed waits, in seconds. Nothing on the remote side is polled for readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delays {
    pub command_secs: u64,
    pub package_settle_secs: u64,
    pub runtime_settle_secs: u64,
    pub repo_settle_secs: u64,
    pub overlay_settle_secs: u64,
    pub join_settle_secs: u64,
    /// Between a finished clone and its first config change
    pub clone_settle_secs: u64,
    /// First boot of fresh clones (cloud-init, package locks)
    pub first_boot_secs: u64,
    pub shutdown_settle_secs: u64,
    /// After the restart cycle, before the first SSH session
    pub restart_settle_secs: u64,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            command_secs: 1,
            package_settle_secs: 5,
            runtime_settle_secs: 15,
            repo_settle_secs: 10,
            overlay_settle_secs: 30,
            join_settle_secs: 15,
            clone_settle_secs: 10,
            first_boot_secs: 125,
            shutdown_settle_secs: 25,
            restart_settle_secs: 150,
        }
    }
}

impl Delays {
    pub fn none() -> Self {
        Self {
            command_secs: 0,
            package_settle_secs: 0,
            runtime_settle_secs: 0,
            repo_settle_secs: 0,
            overlay_settle_secs: 0,
            join_settle_secs: 0,
            clone_settle_secs: 0,
            first_boot_secs: 0,
            shutdown_settle_secs: 0,
            restart_settle_secs: 0,
        }
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn package_settle(&self) -> Duration {
        Duration::from_secs(self.package_settle_secs)
    }

    pub fn runtime_settle(&self) -> Duration {
        Duration::from_secs(self.runtime_settle_secs)
    }

    pub fn repo_settle(&self) -> Duration {
        Duration::from_secs(self.repo_settle_secs)
    }

    pub fn overlay_settle(&self) -> Duration {
        Duration::from_secs(self.overlay_settle_secs)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_secs(self.join_settle_secs)
    }

    pub fn clone_settle(&self) -> Duration {
        Duration::from_secs(self.clone_settle_secs)
    }

    pub fn first_boot(&self) -> Duration {
        Duration::from_secs(self.first_boot_secs)
    }

    pub fn shutdown_settle(&self) -> Duration {
        Duration::from_secs(self.shutdown_settle_secs)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_secs(self.restart_settle_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepalivedSettings {
    pub interface: String,
    pub virtual_router_id: u8,
    /// VRRP PASS auth; keepalived only uses the first 8 characters
    pub auth_pass: String,
    pub primary_priority: u8,
    pub backup_priority: u8,
}

impl KeepalivedSettings {
    pub fn priority_for(&self, role: HaRole) -> u8 {
        match role {
            HaRole::Primary => self.primary_priority,
            HaRole::Backup => self.backup_priority,
        }
    }
}

impl Default for KeepalivedSettings {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            virtual_router_id: 51,
            auth_pass: "k8svip42".to_string(),
            primary_priority: HaRole::Primary.default_priority(),
            backup_priority: HaRole::Backup.default_priority(),
        }
    }
}
