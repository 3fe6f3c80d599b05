//! Node preparation
//!
//! Turns a fresh Ubuntu VM into something `kubeadm` can use: forwarding on,
//! swap off, containerd on the systemd cgroup driver, kube packages installed
//! and images pre-pulled. Steps always run in [`PrepStep::ORDER`].

use crate::config::ClusterSettings;
use crate::error::Result;
use crate::inventory::{HostDescriptor, Inventory};
use crate::patch::{self, PatchRule};
use crate::pool::ConnectionPool;
use crate::runner;
use crate::services::session_for;
use crate::utils::exec::{CommandExecutor, Connector};
use std::time::Duration;
use tracing::{info, info_span};

const SYSCTL_CONF: &str = "/etc/sysctl.conf";
const CONTAINERD_CONF: &str = "/etc/containerd/config.toml";
const KEYRINGS: &str = "/etc/apt/keyrings";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepStep {
    RefreshPackages,
    InstallTools,
    EnableForwarding,
    DisableSwap,
    InstallContainerRuntime,
    ConfigureContainerRuntime,
    InstallKubePackages,
}

impl PrepStep {
    pub const ORDER: [PrepStep; 7] = [
        PrepStep::RefreshPackages,
        PrepStep::InstallTools,
        PrepStep::EnableForwarding,
        PrepStep::DisableSwap,
        PrepStep::InstallContainerRuntime,
        PrepStep::ConfigureContainerRuntime,
        PrepStep::InstallKubePackages,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PrepStep::RefreshPackages => "refresh packages",
            PrepStep::InstallTools => "install tools",
            PrepStep::EnableForwarding => "enable forwarding",
            PrepStep::DisableSwap => "disable swap",
            PrepStep::InstallContainerRuntime => "install container runtime",
            PrepStep::ConfigureContainerRuntime => "configure container runtime",
            PrepStep::InstallKubePackages => "install kube packages",
        }
    }
}

/// One unit of work inside a step
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Run(Vec<String>),
    Patch {
        path: &'static str,
        rules: Vec<PatchRule>,
    },
    Pause(Duration),
}

fn commands(list: &[&str]) -> Action {
    Action::Run(list.iter().map(|c| c.to_string()).collect())
}

fn refresh_commands(upgrade: bool) -> Vec<String> {
    let mut cmds = vec!["sudo apt-get update -y".to_string()];
    if upgrade {
        cmds.push("sudo DEBIAN_FRONTEND=noninteractive apt-get upgrade -y".to_string());
    }
    cmds
}

fn plan(step: PrepStep, settings: &ClusterSettings) -> Vec<Action> {
    let delays = &settings.delays;
    match step {
        PrepStep::RefreshPackages => vec![
            Action::Run(refresh_commands(settings.upgrade)),
            Action::Pause(delays.package_settle()),
        ],
        PrepStep::InstallTools => vec![commands(&[
            "sudo apt-get install nfs-common -y",
            "sudo apt-get install sshpass -y",
        ])],
        PrepStep::EnableForwarding => vec![
            Action::Patch {
                path: SYSCTL_CONF,
                rules: vec![
                    PatchRule::uncomment("net.ipv4.ip_forward=1"),
                    PatchRule::uncomment("net.ipv6.conf.all.forwarding=1"),
                ],
            },
            commands(&["sudo sysctl -p"]),
        ],
        PrepStep::DisableSwap => vec![commands(&[
            "sudo swapoff -a",
            "sudo sed -i '/swap/d' /etc/fstab",
        ])],
        PrepStep::InstallContainerRuntime => vec![
            Action::Run(vec![
                "sudo apt-get install apt-transport-https ca-certificates curl gpg jq -y".to_string(),
                format!("sudo install -m 0755 -d {}", KEYRINGS),
                format!(
                    "sudo curl -fsSL https://download.docker.com/linux/ubuntu/gpg -o {}/docker.asc",
                    KEYRINGS
                ),
                format!("sudo chmod a+r {}/docker.asc", KEYRINGS),
                format!(
                    "echo \"deb [arch=$(dpkg --print-architecture) signed-by={}/docker.asc] \
                     https://download.docker.com/linux/ubuntu $(. /etc/os-release && echo \"$VERSION_CODENAME\") stable\" \
                     | sudo tee /etc/apt/sources.list.d/docker.list > /dev/null",
                    KEYRINGS
                ),
                "sudo apt-get update -y".to_string(),
                "sudo apt-get install containerd.io -y".to_string(),
            ]),
            Action::Pause(delays.runtime_settle()),
        ],
        PrepStep::ConfigureContainerRuntime => vec![
            Action::Run(vec![
                "sudo mkdir -p /etc/containerd".to_string(),
                format!("containerd config default | sudo tee {} > /dev/null", CONTAINERD_CONF),
            ]),
            Action::Patch {
                path: CONTAINERD_CONF,
                rules: vec![
                    PatchRule::replace("SystemdCgroup = false", "false", "true"),
                    PatchRule::replace("sandbox_image", "pause:3.8", "pause:3.9"),
                ],
            },
            commands(&["sudo systemctl restart containerd"]),
        ],
        PrepStep::InstallKubePackages => {
            let repo = format!(
                "https://pkgs.k8s.io/core:/stable:/v{}/deb/",
                settings.kube_version
            );
            vec![
                Action::Run(vec![
                    format!(
                        "curl -fsSL {}Release.key | sudo gpg --batch --yes --dearmor -o {}/kubernetes-apt-keyring.gpg",
                        repo, KEYRINGS
                    ),
                    format!(
                        "echo 'deb [signed-by={}/kubernetes-apt-keyring.gpg] {} /' \
                         | sudo tee /etc/apt/sources.list.d/kubernetes.list > /dev/null",
                        KEYRINGS, repo
                    ),
                    "sudo apt-get update -y".to_string(),
                ]),
                Action::Pause(delays.repo_settle()),
                commands(&[
                    "sudo apt-get install kubelet kubeadm kubectl -y",
                    "sudo apt-mark hold kubelet kubeadm kubectl",
                    "sudo systemctl enable --now kubelet",
                    "sudo kubeadm config images pull",
                ]),
            ]
        }
    }
}

fn execute<E: CommandExecutor + ?Sized>(
    session: &E,
    action: &Action,
    settings: &ClusterSettings,
) -> Result<()> {
    match action {
        Action::Run(cmds) => {
            runner::run_sequence(
                session,
                cmds,
                settings.delays.command(),
                settings.failure_policy,
            )?;
        }
        Action::Patch { path, rules } => {
            patch::patch_remote_file(session, path, rules, settings.failure_policy)?
        }
        Action::Pause(duration) => runner::pause(*duration),
    }
    Ok(())
}

/// Run every preparation step against one host, in order
pub fn prepare_host<C: Connector>(
    pool: &ConnectionPool<C>,
    host: &HostDescriptor,
    settings: &ClusterSettings,
) -> Result<()> {
    let span = info_span!("prepare", host = %host.name, ip = host.address());
    let _enter = span.enter();

    let session = session_for(pool, host)?;
    for step in PrepStep::ORDER {
        info!(step = step.label(), "starting");
        for action in plan(step, settings) {
            execute(session.as_ref(), &action, settings)?;
        }
    }
    info!("host prepared");
    Ok(())
}

/// Prepare every non-load-balancer host in inventory order
pub fn prepare_all<C: Connector>(
    pool: &ConnectionPool<C>,
    inventory: &Inventory,
    settings: &ClusterSettings,
) -> Result<Vec<String>> {
    let mut prepared = Vec::new();
    for host in inventory.preparation_targets() {
        prepare_host(pool, host, settings)?;
        prepared.push(host.name.clone());
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Delays;
    use crate::inventory::fixtures::{host, load_balancer};
    use crate::inventory::{HaRole, Role};
    use crate::error::SetupError;
    use crate::runner::FailurePolicy;
    use crate::utils::exec::CommandOutput;
    use crate::utils::exec::testing::FakeConnector;

    fn settings() -> ClusterSettings {
        ClusterSettings {
            delays: Delays::none(),
            ..ClusterSettings::default()
        }
    }

    fn position(commands: &[String], needle: &str) -> usize {
        commands
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("`{needle}` never ran"))
    }

    #[test]
    fn test_steps_run_in_fixed_order() {
        let connector = FakeConnector::new();
        let pool = ConnectionPool::new(connector.clone());
        let cp = host("cp1", "10.0.0.11", Role::ControlPlane);

        prepare_host(&pool, &cp, &settings()).unwrap();

        let cmds = connector.commands_on("10.0.0.11");
        let milestones = [
            "apt-get update",
            "apt-get upgrade",
            "install nfs-common",
            "install sshpass",
            "sudo cat /etc/sysctl.conf",
            "sysctl -p",
            "swapoff -a",
            "sed -i '/swap/d' /etc/fstab",
            "download.docker.com/linux/ubuntu/gpg",
            "install containerd.io",
            "containerd config default",
            "sudo cat /etc/containerd/config.toml",
            "systemctl restart containerd",
            "kubernetes-apt-keyring.gpg",
            "install kubelet kubeadm kubectl",
            "kubeadm config images pull",
        ];
        let positions: Vec<usize> = milestones.iter().map(|m| position(&cmds, m)).collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
        assert!(cmds.last().unwrap().contains("kubeadm config images pull"));
    }

    #[test]
    fn test_kube_repository_uses_configured_version() {
        let connector = FakeConnector::new();
        let pool = ConnectionPool::new(connector.clone());
        let settings = ClusterSettings {
            kube_version: "1.29".to_string(),
            ..settings()
        };

        prepare_host(&pool, &host("w1", "10.0.0.21", Role::Worker), &settings).unwrap();

        let cmds = connector.commands_on("10.0.0.21");
        assert!(cmds.iter().any(|c| c.contains("pkgs.k8s.io/core:/stable:/v1.29/deb/")));
        assert!(!cmds.iter().any(|c| c.contains("v1.30")));
    }

    #[test]
    fn test_upgrade_can_be_skipped() {
        let connector = FakeConnector::new();
        let pool = ConnectionPool::new(connector.clone());
        let settings = ClusterSettings {
            upgrade: false,
            ..settings()
        };

        prepare_host(&pool, &host("w1", "10.0.0.21", Role::Worker), &settings).unwrap();

        let cmds = connector.commands_on("10.0.0.21");
        assert!(cmds.iter().any(|c| c.contains("apt-get update")));
        assert!(!cmds.iter().any(|c| c.contains("apt-get upgrade")));
    }

    #[test]
    fn test_containerd_config_switched_to_systemd_cgroup() {
        let connector = FakeConnector::new();
        connector.seed_file(
            "10.0.0.11",
            CONTAINERD_CONF,
            "    sandbox_image = \"registry.k8s.io/pause:3.8\"\n    SystemdCgroup = false\n",
        );
        let pool = ConnectionPool::new(connector.clone());

        prepare_host(&pool, &host("cp1", "10.0.0.11", Role::ControlPlane), &settings()).unwrap();

        let written = connector
            .written("10.0.0.11", "/tmp/kubesetup-config.toml")
            .unwrap();
        assert_eq!(
            written,
            "    sandbox_image = \"registry.k8s.io/pause:3.9\"\n    SystemdCgroup = true\n"
        );
    }

    #[test]
    fn test_prepare_all_skips_load_balancers_and_keeps_order() {
        let connector = FakeConnector::new();
        let pool = ConnectionPool::new(connector.clone());
        let inventory = Inventory::new(vec![
            host("w1", "10.0.0.21", Role::Worker),
            load_balancer("lb1", "10.0.0.5", "10.0.0.100", HaRole::Primary),
            host("cp1", "10.0.0.11", Role::ControlPlane),
        ])
        .unwrap();

        let prepared = prepare_all(&pool, &inventory, &settings()).unwrap();

        assert_eq!(prepared, vec!["w1", "cp1"]);
        assert!(connector.commands_on("10.0.0.5").is_empty());
        let pulls = connector.hosts_running("kubeadm config images pull");
        assert_eq!(pulls, vec!["10.0.0.21", "10.0.0.11"]);
        assert_eq!(connector.connects(), 2);
    }

    fn exit_1(stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status: Some(1),
        }
    }

    #[test]
    fn test_unreadable_sysctl_does_not_stop_best_effort_preparation() {
        let connector = FakeConnector::new();
        connector.respond_with("10.0.0.21", "sudo cat /etc/sysctl.conf", exit_1("boom"));
        let pool = ConnectionPool::new(connector.clone());

        prepare_host(&pool, &host("w1", "10.0.0.21", Role::Worker), &settings()).unwrap();

        let cmds = connector.commands_on("10.0.0.21");
        assert!(cmds.iter().any(|c| c.contains("kubeadm config images pull")));
        assert!(connector.written("10.0.0.21", "/tmp/kubesetup-sysctl.conf").is_none());
    }

    #[test]
    fn test_failed_file_install_stops_fail_fast_preparation() {
        let connector = FakeConnector::new();
        connector.seed_file("10.0.0.21", "/etc/sysctl.conf", "#net.ipv4.ip_forward=1\n");
        connector.respond_with(
            "10.0.0.21",
            "sudo cp /tmp/kubesetup-sysctl.conf",
            exit_1("read-only file system"),
        );
        let pool = ConnectionPool::new(connector.clone());
        let settings = ClusterSettings {
            failure_policy: FailurePolicy::FailFast,
            ..settings()
        };

        let err = prepare_host(&pool, &host("w1", "10.0.0.21", Role::Worker), &settings)
            .unwrap_err();

        assert!(matches!(err, SetupError::RemoteCommand { .. }));
        let cmds = connector.commands_on("10.0.0.21");
        assert!(!cmds.iter().any(|c| c.contains("sysctl -p")));
        assert!(!cmds.iter().any(|c| c.contains("kubeadm config images pull")));
    }
}
