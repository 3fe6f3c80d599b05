//! Joining nodes to an initialized control plane

use crate::config::ClusterSettings;
use crate::error::{Result, SetupError};
use crate::inventory::{HostDescriptor, RoleGroups};
use crate::pool::ConnectionPool;
use crate::runner;
use crate::services::session_for;
use crate::utils::exec::{CommandExecutor, Connector};
use crate::utils::ssh::shell_escape;
use tracing::{info, info_span, warn};

const PKI_DIR: &str = "/etc/kubernetes/pki";

/// Outcome of the control-plane join phase
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlPlaneJoinReport {
    pub joined: Vec<String>,
    /// Hosts whose certificates could not be staged, with the reason
    pub skipped: Vec<(String, String)>,
}

/// Copy the primary's PKI into `secondary`'s certificate directory
///
/// Node-specific certificates are pruned after the move so `kubeadm join`
/// regenerates them for the secondary's own name and address.
pub fn stage_certificates<E, F>(
    primary: &E,
    secondary_session: &F,
    secondary: &HostDescriptor,
) -> Result<()>
where
    E: CommandExecutor + ?Sized,
    F: CommandExecutor + ?Sized,
{
    let password = secondary.password.as_deref().ok_or_else(|| {
        SetupError::configuration(format!(
            "control plane '{}' needs a password for certificate staging",
            secondary.name
        ))
    })?;
    let dir = runner::pwd(secondary_session)?;

    let copy = |secret: &str| {
        format!(
            "sudo sshpass -p {} scp -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -r {} {}@{}:{}",
            secret,
            PKI_DIR,
            secondary.user,
            secondary.address(),
            shell_escape(&dir)
        )
    };
    let output = runner::run_redacted(primary, &copy(&shell_escape(password)), &copy("'***'"))?;
    if !output.success() {
        return Err(SetupError::transport(format!(
            "copying {} to {} failed: {}",
            PKI_DIR,
            secondary.address(),
            output.stderr.trim()
        )));
    }

    let staged = format!("{}/pki", dir.trim_end_matches('/'));
    let relocate = runner::run(
        secondary_session,
        &format!(
            "sudo mkdir -p /etc/kubernetes && sudo rm -rf {pki} && sudo mv {staged} {pki} && \
             sudo find {pki} -type f ! -name 'ca.*' ! -name 'sa.*' ! -name 'front-proxy-ca.*' -delete",
            pki = PKI_DIR,
            staged = shell_escape(&staged)
        ),
    )?;
    if !relocate.success() {
        return Err(SetupError::transport(format!(
            "moving certificates into place on {} failed: {}",
            secondary.address(),
            relocate.stderr.trim()
        )));
    }
    Ok(())
}

/// Stage certificates on, then join, every secondary control plane
///
/// A host whose staging fails is skipped; the others still join.
pub fn join_control_planes<C: Connector>(
    pool: &ConnectionPool<C>,
    groups: &RoleGroups<'_>,
    token: &str,
    settings: &ClusterSettings,
) -> Result<ControlPlaneJoinReport> {
    let mut report = ControlPlaneJoinReport::default();
    let Some(primary) = groups.primary_control_plane() else {
        return Ok(report);
    };
    let primary_session = session_for(pool, primary)?;

    for secondary in groups.secondary_control_planes() {
        let span = info_span!("join", host = %secondary.name, ip = secondary.address());
        let _enter = span.enter();

        let staged = session_for(pool, secondary).and_then(|session| {
            stage_certificates(primary_session.as_ref(), session.as_ref(), secondary)
                .map(|()| session)
        });
        let session = match staged {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "certificate staging failed, skipping join");
                report.skipped.push((secondary.name.clone(), e.to_string()));
                continue;
            }
        };

        info!("joining as control plane");
        runner::run_checked(session.as_ref(), token, settings.failure_policy)?;
        runner::pause(settings.delays.join_settle());
        report.joined.push(secondary.name.clone());
    }
    Ok(report)
}

/// Run the worker join command on every worker, one at a time
pub fn join_workers<C: Connector>(
    pool: &ConnectionPool<C>,
    groups: &RoleGroups<'_>,
    token: &str,
    settings: &ClusterSettings,
) -> Result<Vec<String>> {
    let mut joined = Vec::new();
    for worker in groups.workers() {
        let span = info_span!("join", host = %worker.name, ip = worker.address());
        let _enter = span.enter();

        let session = session_for(pool, worker)?;
        info!("joining as worker");
        runner::run_checked(session.as_ref(), token, settings.failure_policy)?;
        // Let the node register before the next one joins
        runner::pause(settings.delays.join_settle());
        joined.push(worker.name.clone());
    }
    Ok(joined)
}
