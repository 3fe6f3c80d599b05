//! Host inventory and role grouping
//!
//! The inventory is built once from validated configuration and never changes
//! during a run. Every "which hosts play which part" question is answered here
//! so the services never compare roles themselves.

use crate::error::{Result, SetupError};
use crate::utils::exec::Credentials;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

/// Functional role of a host in the cluster
///
/// Variant order matches the lexical order of [`Role::name`], so the derived
/// `Ord` sorts groups by role name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(
        rename = "MASTER",
        alias = "master",
        alias = "CONTROL_PLANE",
        alias = "control_plane"
    )]
    ControlPlane,
    #[serde(
        rename = "LOADBALANCER",
        alias = "loadbalancer",
        alias = "LOAD_BALANCER",
        alias = "load_balancer"
    )]
    LoadBalancer,
    #[serde(rename = "WORKER", alias = "worker")]
    Worker,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::ControlPlane => "CONTROL_PLANE",
            Role::LoadBalancer => "LOAD_BALANCER",
            Role::Worker => "WORKER",
        }
    }

    /// Load balancers run the edge stack only; everything else gets the node pipeline
    pub fn needs_preparation(&self) -> bool {
        !matches!(self, Role::LoadBalancer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failover state hint for the keepalived pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaRole {
    #[serde(rename = "MASTER", alias = "master", alias = "PRIMARY", alias = "primary")]
    Primary,
    #[serde(rename = "BACKUP", alias = "backup")]
    Backup,
}

impl HaRole {
    /// keepalived `state` keyword
    pub fn keepalived_state(&self) -> &'static str {
        match self {
            HaRole::Primary => "MASTER",
            HaRole::Backup => "BACKUP",
        }
    }

    /// Default VRRP priority; the primary must win elections
    pub fn default_priority(&self) -> u8 {
        match self {
            HaRole::Primary => 101,
            HaRole::Backup => 100,
        }
    }
}

/// One machine of the cluster as described in the inventory file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDescriptor {
    #[serde(rename = "vm_name")]
    pub name: String,
    pub vm_id: u32,
    /// Hypervisor node the VM lives on
    #[serde(rename = "target_name")]
    pub node: String,
    /// 1 = full clone, 0 = linked clone
    #[serde(default = "default_clone_type")]
    pub clone_type: u8,
    /// Address, optionally with a prefix length (`10.0.0.5/24`)
    #[serde(rename = "ip_address")]
    pub ip: String,
    #[serde(rename = "ip_gw")]
    pub gateway: String,
    #[serde(rename = "virtual_ip_address", default)]
    pub virtual_ip: Option<String>,
    #[serde(rename = "vm_type")]
    pub role: Role,
    pub user: String,
    #[serde(rename = "ssh_key")]
    pub key_path: PathBuf,
    #[serde(default, alias = "pw")]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub cores: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub memory: Option<u32>,
    /// Extra disk in GiB
    #[serde(default, deserialize_with = "lenient_u32")]
    pub disk_size: Option<u32>,
    #[serde(rename = "node_state", default)]
    pub ha_role: Option<HaRole>,
    #[serde(default)]
    pub tags: Option<String>,
}

fn default_clone_type() -> u8 {
    1
}

/// Inventory files in the wild carry resource sizes both as numbers and as strings
fn lenient_u32<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u32),
        Str(String),
    }

    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(NumOrString::Str(s)) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got '{}'", s))),
    }
}

impl HostDescriptor {
    /// Bare address used for SSH and as the pool key
    pub fn address(&self) -> &str {
        self.ip.split('/').next().unwrap_or(&self.ip)
    }

    /// Address with prefix length, /24 when the inventory omitted it
    pub fn cidr(&self) -> String {
        if self.ip.contains('/') {
            self.ip.clone()
        } else {
            format!("{}/24", self.ip)
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.clone(), self.key_path.clone())
    }

    /// Virtual IP without a prefix length
    pub fn virtual_address(&self) -> Option<&str> {
        self.virtual_ip
            .as_deref()
            .map(|vip| vip.split('/').next().unwrap_or(vip))
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SetupError::configuration(format!(
                "host with vm_id {} has an empty vm_name",
                self.vm_id
            )));
        }
        if self.user.trim().is_empty() {
            return Err(SetupError::configuration(format!(
                "host '{}' has an empty user",
                self.name
            )));
        }
        if self.cores.is_some() != self.memory.is_some() {
            return Err(SetupError::configuration(format!(
                "host '{}': cores and memory must be specified together",
                self.name
            )));
        }
        if self.role == Role::LoadBalancer {
            if self.virtual_ip.is_none() {
                return Err(SetupError::configuration(format!(
                    "load balancer '{}' requires virtual_ip_address",
                    self.name
                )));
            }
            if self.ha_role.is_none() {
                return Err(SetupError::configuration(format!(
                    "load balancer '{}' requires node_state (MASTER or BACKUP)",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Ordered, validated list of hosts for one run
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: Vec<HostDescriptor>,
}

impl Inventory {
    /// Validate every host up front so a bad file never reaches a remote machine
    pub fn new(hosts: Vec<HostDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for host in &hosts {
            host.validate()?;
            if !seen.insert(host.address().to_string()) {
                return Err(SetupError::configuration(format!(
                    "address {} is used by more than one host",
                    host.address()
                )));
            }
        }
        Ok(Self { hosts })
    }

    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Hosts that run the node preparation pipeline, in inventory order
    pub fn preparation_targets(&self) -> impl Iterator<Item = &HostDescriptor> {
        self.hosts.iter().filter(|h| h.role.needs_preparation())
    }

    /// Stable partition of the inventory keyed and sorted by role name
    pub fn group_by_role(&self) -> RoleGroups<'_> {
        let mut groups: BTreeMap<Role, Vec<&HostDescriptor>> = BTreeMap::new();
        for host in &self.hosts {
            groups.entry(host.role).or_default().push(host);
        }
        RoleGroups { groups }
    }
}

/// Hosts partitioned by role
#[derive(Debug, Clone)]
pub struct RoleGroups<'a> {
    groups: BTreeMap<Role, Vec<&'a HostDescriptor>>,
}

impl<'a> RoleGroups<'a> {
    /// Roles present, sorted by role name
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.groups.keys().copied()
    }

    pub fn get(&self, role: Role) -> &[&'a HostDescriptor] {
        self.groups.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn control_planes(&self) -> &[&'a HostDescriptor] {
        self.get(Role::ControlPlane)
    }

    /// The host that runs `kubeadm init`
    pub fn primary_control_plane(&self) -> Option<&'a HostDescriptor> {
        self.control_planes().first().copied()
    }

    /// Control planes that join through the certificate hand-off
    pub fn secondary_control_planes(&self) -> &[&'a HostDescriptor] {
        self.control_planes().get(1..).unwrap_or(&[])
    }

    pub fn workers(&self) -> &[&'a HostDescriptor] {
        self.get(Role::Worker)
    }

    pub fn load_balancers(&self) -> &[&'a HostDescriptor] {
        self.get(Role::LoadBalancer)
    }

    /// Sorted control-plane addresses, as used for the HAProxy backend list
    pub fn sorted_control_plane_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .control_planes()
            .iter()
            .map(|h| h.address().to_string())
            .collect();
        addrs.sort();
        addrs
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn host(name: &str, ip: &str, role: Role) -> HostDescriptor {
        HostDescriptor {
            name: name.to_string(),
            vm_id: 100,
            node: "pve".to_string(),
            clone_type: 1,
            ip: format!("{}/24", ip),
            gateway: "10.0.0.1".to_string(),
            virtual_ip: None,
            role,
            user: "ubuntu".to_string(),
            key_path: PathBuf::from("/home/ubuntu/.ssh/id_rsa"),
            password: Some("secret".to_string()),
            cores: None,
            memory: None,
            disk_size: None,
            ha_role: None,
            tags: None,
        }
    }

    pub fn load_balancer(name: &str, ip: &str, vip: &str, ha: HaRole) -> HostDescriptor {
        HostDescriptor {
            virtual_ip: Some(vip.to_string()),
            ha_role: Some(ha),
            ..host(name, ip, Role::LoadBalancer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{host, load_balancer};
    use super::*;

    #[test]
    fn test_grouping_partitions_every_host_exactly_once() {
        let inventory = Inventory::new(vec![
            host("w1", "10.0.0.21", Role::Worker),
            host("cp1", "10.0.0.11", Role::ControlPlane),
            load_balancer("lb1", "10.0.0.5", "10.0.0.100", HaRole::Primary),
            host("w2", "10.0.0.22", Role::Worker),
            host("cp2", "10.0.0.12", Role::ControlPlane),
        ])
        .unwrap();
        let groups = inventory.group_by_role();

        let total: usize = groups.roles().map(|r| groups.get(r).len()).sum();
        assert_eq!(total, inventory.len());
        for h in inventory.hosts() {
            let hits = groups
                .roles()
                .filter(|r| groups.get(*r).iter().any(|g| g.name == h.name))
                .count();
            assert_eq!(hits, 1, "{} should be in exactly one group", h.name);
        }
    }

    #[test]
    fn test_group_keys_are_distinct_roles_sorted_by_name() {
        let inventory = Inventory::new(vec![
            host("w1", "10.0.0.21", Role::Worker),
            host("cp1", "10.0.0.11", Role::ControlPlane),
        ])
        .unwrap();
        let groups = inventory.group_by_role();
        let roles: Vec<&str> = groups.roles().map(|r| r.name()).collect();
        assert_eq!(roles, vec!["CONTROL_PLANE", "WORKER"]);

        let mut by_name = [Role::Worker, Role::LoadBalancer, Role::ControlPlane];
        by_name.sort();
        let names: Vec<&str> = by_name.iter().map(|r| r.name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_grouping_preserves_inventory_order_within_role() {
        let inventory = Inventory::new(vec![
            host("w-b", "10.0.0.22", Role::Worker),
            host("cp1", "10.0.0.11", Role::ControlPlane),
            host("w-a", "10.0.0.21", Role::Worker),
        ])
        .unwrap();
        let groups = inventory.group_by_role();
        let workers: Vec<&str> = groups.workers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(workers, vec!["w-b", "w-a"]);
        assert_eq!(groups.primary_control_plane().unwrap().name, "cp1");
        assert!(groups.secondary_control_planes().is_empty());
    }

    #[test]
    fn test_load_balancer_without_virtual_ip_is_rejected() {
        let mut lb = load_balancer("lb1", "10.0.0.5", "10.0.0.100", HaRole::Primary);
        lb.virtual_ip = None;
        let err = Inventory::new(vec![lb]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_balancer_without_ha_role_is_rejected() {
        let mut lb = load_balancer("lb1", "10.0.0.5", "10.0.0.100", HaRole::Primary);
        lb.ha_role = None;
        assert!(Inventory::new(vec![lb]).unwrap_err().is_configuration());
    }

    #[test]
    fn test_partial_resources_are_rejected() {
        let mut cores_only = host("cp1", "10.0.0.11", Role::ControlPlane);
        cores_only.cores = Some(4);
        assert!(Inventory::new(vec![cores_only]).unwrap_err().is_configuration());

        let mut memory_only = host("cp1", "10.0.0.11", Role::ControlPlane);
        memory_only.memory = Some(4096);
        assert!(Inventory::new(vec![memory_only]).unwrap_err().is_configuration());

        let mut both = host("cp1", "10.0.0.11", Role::ControlPlane);
        both.cores = Some(4);
        both.memory = Some(4096);
        assert!(Inventory::new(vec![both]).is_ok());
    }

    #[test]
    fn test_duplicate_addresses_are_rejected() {
        let err = Inventory::new(vec![
            host("cp1", "10.0.0.11", Role::ControlPlane),
            host("w1", "10.0.0.11", Role::Worker),
        ])
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_preparation_targets_skip_load_balancers() {
        let inventory = Inventory::new(vec![
            load_balancer("lb1", "10.0.0.5", "10.0.0.100", HaRole::Primary),
            host("cp1", "10.0.0.11", Role::ControlPlane),
            host("w1", "10.0.0.21", Role::Worker),
        ])
        .unwrap();
        let names: Vec<&str> = inventory
            .preparation_targets()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, vec!["cp1", "w1"]);
    }

    #[test]
    fn test_address_strips_prefix() {
        let h = host("cp1", "10.0.0.11", Role::ControlPlane);
        assert_eq!(h.address(), "10.0.0.11");
        assert_eq!(h.cidr(), "10.0.0.11/24");

        let bare = HostDescriptor {
            ip: "10.0.0.12".to_string(),
            ..h
        };
        assert_eq!(bare.address(), "10.0.0.12");
        assert_eq!(bare.cidr(), "10.0.0.12/24");
    }

    #[test]
    fn test_descriptor_parses_inventory_json() {
        let json = r#"{
            "vm_name": "test_01",
            "vm_type": "master",
            "target_name": "pve1",
            "vm_id": 123,
            "clone_type": 1,
            "ip_address": "10.10.10.10/24",
            "ip_gw": "10.10.10.1",
            "cores": "4",
            "memory": 4092,
            "user": "tom",
            "ssh_key": "/home/tom/.ssh/homelab"
        }"#;
        let h: HostDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(h.role, Role::ControlPlane);
        assert_eq!(h.cores, Some(4));
        assert_eq!(h.memory, Some(4092));
        assert_eq!(h.disk_size, None);
        assert_eq!(h.address(), "10.10.10.10");
    }

    #[test]
    fn test_load_balancer_json_with_node_state() {
        let json = r#"{
            "vm_name": "lb",
            "vm_type": "LOADBALANCER",
            "target_name": "pve1",
            "vm_id": 130,
            "ip_address": "10.10.10.30/24",
            "ip_gw": "10.10.10.1",
            "virtual_ip_address": "10.10.10.100",
            "node_state": "backup",
            "user": "tom",
            "ssh_key": "/home/tom/.ssh/homelab"
        }"#;
        let h: HostDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(h.role, Role::LoadBalancer);
        assert_eq!(h.ha_role, Some(HaRole::Backup));
        assert_eq!(h.virtual_address(), Some("10.10.10.100"));
    }
}
