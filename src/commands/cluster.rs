//! `simple` and `ha` bring-up commands

use crate::commands::banner;
use crate::config;
use crate::inventory::Inventory;
use crate::pool::ConnectionPool;
use crate::proxmox::{self, ProxmoxClient};
use crate::runner::FailurePolicy;
use crate::services::ClusterMode;
use crate::services::cluster::{self, BringUpReport};
use crate::utils::ssh::SshConnector;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Clone, Debug)]
pub struct ClusterArgs {
    /// Proxmox connection file (JSON); not needed with --skip-vms
    #[arg(long, env = "KUBESETUP_PROXMOX_CONFIG")]
    pub proxmox_config: Option<PathBuf>,
    /// Inventory of VMs to create and configure (JSON)
    #[arg(long, env = "KUBESETUP_VM_CONFIG")]
    pub vm_config: PathBuf,
    /// Cluster settings (TOML); defaults apply when omitted
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// Use already-running VMs instead of cloning them
    #[arg(long)]
    pub skip_vms: bool,
    /// Abort on the first remote command that exits non-zero
    #[arg(long)]
    pub fail_fast: bool,
}

#[derive(Args, Clone, Debug)]
pub struct HaArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
    /// API endpoint (host:port) the nodes use; defaults to <load balancer VIP>:6443
    #[arg(long)]
    pub control_plane_endpoint: Option<String>,
}

pub fn handle_simple(args: ClusterArgs) -> Result<()> {
    run(args, None)
}

pub fn handle_ha(args: HaArgs) -> Result<()> {
    let endpoint = args
        .control_plane_endpoint
        .clone()
        .unwrap_or_default();
    run(args.cluster, Some(endpoint))
}

/// `ha_endpoint` is `Some` for HA mode; an empty string means "derive it"
fn run(args: ClusterArgs, ha_endpoint: Option<String>) -> Result<()> {
    let mut settings = config::load_settings(args.settings.as_deref())
        .context("Failed to load cluster settings")?;
    if args.fail_fast {
        settings.failure_policy = FailurePolicy::FailFast;
    }
    let inventory = config::load_inventory(&args.vm_config)
        .with_context(|| format!("Failed to load inventory {}", args.vm_config.display()))?;

    let mode = match ha_endpoint.as_deref() {
        None => ClusterMode::Simple,
        Some(endpoint) => ClusterMode::ha(&inventory.group_by_role(), Some(endpoint))
            .context("Failed to determine the control-plane endpoint")?,
    };
    cluster::preflight(&inventory, &mode).context("Inventory does not fit the cluster mode")?;

    banner(match mode {
        ClusterMode::Simple => "Cluster bring-up - single control plane",
        ClusterMode::Ha { .. } => "Cluster bring-up - highly available control plane",
    });
    if let ClusterMode::Ha {
        control_plane_endpoint,
    } = &mode
    {
        println!("Control-plane endpoint: {}", control_plane_endpoint);
    }
    println!("Hosts: {}", inventory.len());
    println!();

    if args.skip_vms {
        println!("Skipping VM provisioning (--skip-vms)");
    } else {
        provision_vms(&args, &inventory, &settings)?;
    }

    let connector = SshConnector::new().context("Failed to prepare the SSH control directory")?;
    let pool = ConnectionPool::new(connector);
    let report = cluster::bring_up(&pool, &inventory, &mode, &settings)
        .context("Cluster bring-up failed")?;

    print_report(&report);
    Ok(())
}

fn provision_vms(
    args: &ClusterArgs,
    inventory: &Inventory,
    settings: &config::ClusterSettings,
) -> Result<()> {
    let path = args
        .proxmox_config
        .as_deref()
        .context("--proxmox-config is required unless --skip-vms is set")?;
    let connection = config::load_proxmox_connection(path)
        .with_context(|| format!("Failed to load Proxmox config {}", path.display()))?;
    let client = ProxmoxClient::new(&connection).context("Failed to create Proxmox client")?;

    println!("Cloning {} VMs from template {}...", inventory.len(), client.template_id());
    let started = proxmox::provision(&client, inventory, &settings.delays)
        .context("VM provisioning failed")?;
    println!("✓ Started VMs: {:?}", started);

    println!("Waiting for first boot, then restarting all VMs...");
    proxmox::required_restarts(&client, inventory, &settings.delays)
        .context("VM restart cycle failed")?;
    println!("✓ VMs restarted");
    println!();
    Ok(())
}

fn print_report(report: &BringUpReport) {
    println!();
    banner("Bring-up finished");
    if !report.edge.is_empty() {
        println!("✓ Load balancers: {}", report.edge.join(", "));
    }
    println!("✓ Prepared: {}", report.prepared.join(", "));
    if !report.control_planes.joined.is_empty() {
        println!(
            "✓ Control planes joined: {}",
            report.control_planes.joined.join(", ")
        );
    }
    for (host, reason) in &report.control_planes.skipped {
        println!("⚠ Control plane {} was not joined: {}", host, reason);
    }
    println!("✓ Workers joined: {}", report.workers.join(", "));
}
