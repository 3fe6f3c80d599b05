//! Whole-cluster bring-up
//!
//! edge → prepare → bootstrap → control-plane join → worker join, then every
//! pooled session is closed whether or not the phases succeeded.

use crate::config::ClusterSettings;
use crate::error::{Result, SetupError};
use crate::inventory::Inventory;
use crate::pool::ConnectionPool;
use crate::services::{ClusterMode, bootstrap, edge, join, prepare};
use crate::templates::TemplateEngine;
use crate::utils::exec::Connector;
use tracing::{info, warn};

/// What each phase touched
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BringUpReport {
    pub edge: Vec<String>,
    pub prepared: Vec<String>,
    pub control_planes: join::ControlPlaneJoinReport,
    pub workers: Vec<String>,
}

/// Reject inventories that cannot work in `mode` before anything is contacted
pub fn preflight(inventory: &Inventory, mode: &ClusterMode) -> Result<()> {
    let groups = inventory.group_by_role();
    if groups.primary_control_plane().is_none() {
        return Err(SetupError::configuration(
            "the inventory has no control plane (vm_type MASTER)",
        ));
    }

    match mode {
        ClusterMode::Simple => {
            if groups.control_planes().len() > 1 {
                return Err(SetupError::configuration(format!(
                    "simple mode supports one control plane, the inventory has {}; use HA mode",
                    groups.control_planes().len()
                )));
            }
        }
        ClusterMode::Ha {
            control_plane_endpoint,
        } => {
            if control_plane_endpoint.trim().is_empty() {
                return Err(SetupError::configuration(
                    "HA mode needs a control-plane endpoint",
                ));
            }
            if let Some(host) = groups
                .secondary_control_planes()
                .iter()
                .find(|h| h.password.as_deref().is_none_or(str::is_empty))
            {
                return Err(SetupError::configuration(format!(
                    "control plane '{}' needs a password for certificate staging",
                    host.name
                )));
            }
        }
    }
    Ok(())
}

fn run_phases<C: Connector>(
    pool: &ConnectionPool<C>,
    inventory: &Inventory,
    mode: &ClusterMode,
    settings: &ClusterSettings,
    templates: &TemplateEngine,
) -> Result<BringUpReport> {
    let mut report = BringUpReport::default();

    let groups = inventory.group_by_role();
    if !groups.load_balancers().is_empty() {
        info!("configuring load balancers");
        report.edge = edge::configure_edge(pool, &groups, settings, templates)?;
    }

    info!("preparing nodes");
    report.prepared = prepare::prepare_all(pool, inventory, settings)?;

    // Grouping is recomputed once preparation is done
    let groups = inventory.group_by_role();

    info!("bootstrapping control plane");
    let tokens = bootstrap::bootstrap(pool, &groups, mode, settings, templates)?;

    if mode.is_ha() {
        match tokens.control_plane.as_deref() {
            Some(token) => {
                info!("joining secondary control planes");
                report.control_planes =
                    join::join_control_planes(pool, &groups, token, settings)?;
            }
            None if !groups.secondary_control_planes().is_empty() => {
                warn!("no control-plane join command, secondary control planes were not joined");
            }
            None => {}
        }
    }

    info!("joining workers");
    report.workers = join::join_workers(pool, &groups, &tokens.worker, settings)?;
    Ok(report)
}

/// Bring the cluster described by `inventory` up
///
/// The pool is drained on every exit path.
pub fn bring_up<C: Connector>(
    pool: &ConnectionPool<C>,
    inventory: &Inventory,
    mode: &ClusterMode,
    settings: &ClusterSettings,
) -> Result<BringUpReport> {
    preflight(inventory, mode)?;
    let templates = TemplateEngine::new()?;

    let result = run_phases(pool, inventory, mode, settings, &templates);
    pool.close_all();
    result
}
