use super::ProxmoxClient;
use crate::config::Delays;
use crate::error::Result;
use crate::inventory::{HostDescriptor, Inventory};
use crate::runner::pause;
use tracing::{info, warn};

/// VM operations a bring-up needs from the hypervisor
pub trait Hypervisor {
    fn clone_template(&self, node: &str, vm_id: u32, name: &str, full: bool) -> Result<()>;
    fn set_config(&self, node: &str, vm_id: u32, params: &[(&str, String)]) -> Result<()>;
    fn grow_disk(&self, node: &str, vm_id: u32, gigabytes: u32) -> Result<()>;
    fn start(&self, node: &str, vm_id: u32) -> Result<()>;
    fn shutdown(&self, node: &str, vm_id: u32) -> Result<()>;
    fn delete(&self, node: &str, vm_id: u32) -> Result<()>;
}

impl Hypervisor for ProxmoxClient {
    fn clone_template(&self, node: &str, vm_id: u32, name: &str, full: bool) -> Result<()> {
        ProxmoxClient::clone_template(self, node, vm_id, name, full)
    }

    fn set_config(&self, node: &str, vm_id: u32, params: &[(&str, String)]) -> Result<()> {
        ProxmoxClient::set_config(self, node, vm_id, params)
    }

    fn grow_disk(&self, node: &str, vm_id: u32, gigabytes: u32) -> Result<()> {
        ProxmoxClient::grow_disk(self, node, vm_id, gigabytes)
    }

    fn start(&self, node: &str, vm_id: u32) -> Result<()> {
        ProxmoxClient::start(self, node, vm_id)
    }

    fn shutdown(&self, node: &str, vm_id: u32) -> Result<()> {
        ProxmoxClient::shutdown(self, node, vm_id)
    }

    fn delete(&self, node: &str, vm_id: u32) -> Result<()> {
        ProxmoxClient::delete(self, node, vm_id)
    }
}

/// Network, tag and size settings applied to a fresh clone
fn config_params(host: &HostDescriptor) -> Vec<(&'static str, String)> {
    let mut params = vec![(
        "ipconfig0",
        format!("ip={},gw={}", host.cidr(), host.gateway),
    )];
    if let Some(tags) = host.tags.as_deref().filter(|t| !t.trim().is_empty()) {
        params.push(("tags", tags.replace(',', ";")));
    }
    if let (Some(cores), Some(memory)) = (host.cores, host.memory) {
        params.push(("cores", cores.to_string()));
        params.push(("memory", memory.to_string()));
    }
    params
}

/// Clone, configure and start one VM per host, in inventory order
pub fn provision<H: Hypervisor>(
    hypervisor: &H,
    inventory: &Inventory,
    delays: &Delays,
) -> Result<Vec<u32>> {
    let mut started = Vec::new();
    for host in inventory.hosts() {
        info!(vm_id = host.vm_id, name = %host.name, node = %host.node, "cloning");
        hypervisor.clone_template(&host.node, host.vm_id, &host.name, host.clone_type == 1)?;
        pause(delays.clone_settle());

        hypervisor.set_config(&host.node, host.vm_id, &config_params(host))?;
        if let Some(size) = host.disk_size {
            hypervisor.grow_disk(&host.node, host.vm_id, size)?;
        }
        hypervisor.start(&host.node, host.vm_id)?;
        started.push(host.vm_id);
    }
    Ok(started)
}

/// Let the clones finish their first boot, then power-cycle all of them so
/// network and hostname changes take effect
pub fn required_restarts<H: Hypervisor>(
    hypervisor: &H,
    inventory: &Inventory,
    delays: &Delays,
) -> Result<()> {
    info!("waiting for first boot");
    pause(delays.first_boot());

    for host in inventory.hosts() {
        info!(vm_id = host.vm_id, name = %host.name, "shutting down");
        hypervisor.shutdown(&host.node, host.vm_id)?;
    }
    pause(delays.shutdown_settle());

    for host in inventory.hosts() {
        info!(vm_id = host.vm_id, name = %host.name, "starting again");
        hypervisor.start(&host.node, host.vm_id)?;
    }
    pause(delays.restart_settle());
    Ok(())
}

/// Shut down and delete every VM in the inventory
///
/// A VM that refuses to shut down (usually because it is already off) is
/// still deleted.
pub fn cleanup<H: Hypervisor>(hypervisor: &H, inventory: &Inventory, delays: &Delays) -> Result<()> {
    for host in inventory.hosts() {
        info!(vm_id = host.vm_id, name = %host.name, "shutting down");
        if let Err(e) = hypervisor.shutdown(&host.node, host.vm_id) {
            warn!(vm_id = host.vm_id, error = %e, "shutdown failed");
        }
    }
    pause(delays.shutdown_settle());

    for host in inventory.hosts() {
        info!(vm_id = host.vm_id, name = %host.name, "deleting");
        hypervisor.delete(&host.node, host.vm_id)?;
    }
    Ok(())
}
