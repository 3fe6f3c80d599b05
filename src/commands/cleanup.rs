//! `cleanup` command

use crate::commands::banner;
use crate::config;
use crate::proxmox::{self, ProxmoxClient};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Clone, Debug)]
pub struct CleanupArgs {
    /// Proxmox connection file (JSON)
    #[arg(long, env = "KUBESETUP_PROXMOX_CONFIG")]
    pub proxmox_config: PathBuf,
    /// Inventory whose VMs are removed (JSON)
    #[arg(long, env = "KUBESETUP_VM_CONFIG")]
    pub vm_config: PathBuf,
    /// Cluster settings (TOML), for the shutdown wait
    #[arg(long)]
    pub settings: Option<PathBuf>,
}

pub fn handle_cleanup(args: CleanupArgs) -> Result<()> {
    let settings = config::load_settings(args.settings.as_deref())
        .context("Failed to load cluster settings")?;
    let inventory = config::load_inventory(&args.vm_config)
        .with_context(|| format!("Failed to load inventory {}", args.vm_config.display()))?;
    let connection = config::load_proxmox_connection(&args.proxmox_config).with_context(|| {
        format!(
            "Failed to load Proxmox config {}",
            args.proxmox_config.display()
        )
    })?;
    let client = ProxmoxClient::new(&connection).context("Failed to create Proxmox client")?;

    banner("Cluster cleanup");
    for host in inventory.hosts() {
        println!("  {} ({}) on {}", host.name, host.vm_id, host.node);
    }
    println!();

    proxmox::cleanup(&client, &inventory, &settings.delays).context("Cleanup failed")?;
    println!("✓ Cleanup completed");
    Ok(())
}
