//! Control-plane bootstrap
//!
//! Runs `kubeadm init` on the first control plane and recovers the join
//! commands from its output.

use crate::config::ClusterSettings;
use crate::error::{Result, SetupError};
use crate::inventory::RoleGroups;
use crate::pool::ConnectionPool;
use crate::runner;
use crate::services::{ClusterMode, session_for, upload};
use crate::templates::{ControlPlaneMember, KubeadmContext, Template, TemplateEngine};
use crate::utils::exec::Connector;
use tracing::{info, info_span, warn};

const JOIN_MARKER: &str = "kubeadm join";
const CONTROL_PLANE_FLAG: &str = "--control-plane";

/// Join commands recovered from `kubeadm init`, ready to run as-is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTokens {
    pub worker: String,
    /// Only present in HA mode, and only when init printed one
    pub control_plane: Option<String>,
}

/// Collect the join command starting at `lines[start]`: the marker line plus
/// every following line up to a blank line or the next marker
fn collect_command(lines: &[&str], start: usize) -> String {
    let first = lines[start];
    let from = first.find(JOIN_MARKER).unwrap_or(0);
    let mut pieces = vec![&first[from..]];

    for &line in &lines[start + 1..] {
        if line.trim().is_empty() || line.contains(JOIN_MARKER) {
            break;
        }
        pieces.push(line);
    }

    let command = pieces
        .iter()
        .map(|p| p.trim().trim_end_matches('\\').trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!("sudo {}", command)
}

/// Scan init output for join commands. The position of the join text is
/// never assumed; any amount of text may surround it.
pub fn parse_join_tokens(output: &str, ha: bool) -> Result<JoinTokens> {
    let lines: Vec<&str> = output.lines().collect();
    let mut worker = None;
    let mut control_plane = None;

    for (idx, line) in lines.iter().enumerate() {
        if !line.contains(JOIN_MARKER) {
            continue;
        }
        let command = collect_command(&lines, idx);
        let is_control_plane = command
            .split_whitespace()
            .any(|arg| arg == CONTROL_PLANE_FLAG);
        if is_control_plane {
            control_plane.get_or_insert(command);
        } else {
            worker.get_or_insert(command);
        }
    }

    let worker = worker.ok_or_else(|| {
        SetupError::parse("no worker `kubeadm join` command found in init output")
    })?;
    Ok(JoinTokens {
        worker,
        control_plane: if ha { control_plane } else { None },
    })
}

fn kubeadm_context(
    groups: &RoleGroups<'_>,
    advertise_address: &str,
    mode: &ClusterMode,
    settings: &ClusterSettings,
) -> KubeadmContext {
    KubeadmContext {
        advertise_address: advertise_address.to_string(),
        kube_version: settings.kube_version.clone(),
        pod_subnet: settings.pod_subnet.clone(),
        service_subnet: settings.service_subnet.clone(),
        control_plane_endpoint: match mode {
            ClusterMode::Ha {
                control_plane_endpoint,
            } => Some(control_plane_endpoint.clone()),
            ClusterMode::Simple => None,
        },
        control_planes: groups
            .control_planes()
            .iter()
            .map(|h| ControlPlaneMember {
                name: h.name.clone(),
                address: h.address().to_string(),
            })
            .collect(),
    }
}

/// Initialize the cluster on the primary control plane and hand back the join tokens
pub fn bootstrap<C: Connector>(
    pool: &ConnectionPool<C>,
    groups: &RoleGroups<'_>,
    mode: &ClusterMode,
    settings: &ClusterSettings,
    templates: &TemplateEngine,
) -> Result<JoinTokens> {
    let primary = groups
        .primary_control_plane()
        .ok_or_else(|| SetupError::configuration("the inventory has no control plane"))?;
    let span = info_span!("bootstrap", host = %primary.name, ip = primary.address());
    let _enter = span.enter();

    let context = kubeadm_context(groups, primary.address(), mode, settings);
    let init_template = if mode.is_ha() {
        Template::KubeadmHa
    } else {
        Template::KubeadmSimple
    };
    let init_config = templates.render(init_template, &context)?;
    let overlay = templates.render(Template::Calico, &context)?;

    let session = session_for(pool, primary)?;
    let dir = runner::pwd(session.as_ref())?;
    let config_path = upload(session.as_ref(), &dir, init_template.file_name(), &init_config)?;
    let overlay_path = upload(session.as_ref(), &dir, Template::Calico.file_name(), &overlay)?;

    info!("running kubeadm init");
    let init = runner::run_checked(
        session.as_ref(),
        &format!("sudo kubeadm init --config={}", config_path),
        settings.failure_policy,
    )?;
    let tokens = parse_join_tokens(&init.stdout, mode.is_ha()).map_err(|e| {
        if init.stderr.trim().is_empty() {
            e
        } else {
            SetupError::parse(format!("{} (kubeadm stderr: {})", e, init.stderr.trim()))
        }
    })?;
    if mode.is_ha() && tokens.control_plane.is_none() {
        warn!("kubeadm init printed no control-plane join command");
    }

    runner::run_sequence(
        session.as_ref(),
        &[
            "mkdir -p $HOME/.kube".to_string(),
            "sudo cp -f /etc/kubernetes/admin.conf $HOME/.kube/config".to_string(),
            "sudo chown $(id -u):$(id -g) $HOME/.kube/config".to_string(),
            format!(
                "kubectl create -f https://raw.githubusercontent.com/projectcalico/calico/v{}/manifests/tigera-operator.yaml",
                settings.calico_version
            ),
            format!("kubectl apply -f {}", overlay_path),
        ],
        settings.delays.command(),
        settings.failure_policy,
    )?;

    // Overlay readiness is not polled
    runner::pause(settings.delays.overlay_settle());
    info!("control plane initialized");
    Ok(tokens)
}
