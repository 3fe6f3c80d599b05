//! HAProxy and keepalived on the load-balancer hosts
//!
//! Runs before any node is prepared, so the virtual IP is already answering by
//! the time `kubeadm init` points the cluster at it.

use crate::config::ClusterSettings;
use crate::error::{Result, SetupError};
use crate::inventory::{HostDescriptor, RoleGroups};
use crate::pool::ConnectionPool;
use crate::runner;
use crate::services::{session_for, upload};
use crate::templates::{HaproxyContext, KeepalivedContext, Template, TemplateEngine};
use crate::utils::exec::{CommandExecutor, Connector};
use tracing::{info, info_span};

fn keepalived_context(lb: &HostDescriptor, settings: &ClusterSettings) -> Result<KeepalivedContext> {
    let (Some(ha_role), Some(vip)) = (lb.ha_role, lb.virtual_address()) else {
        return Err(SetupError::configuration(format!(
            "load balancer '{}' needs node_state and virtual_ip_address",
            lb.name
        )));
    };
    let keepalived = &settings.keepalived;
    Ok(KeepalivedContext {
        state: ha_role.keepalived_state().to_string(),
        interface: keepalived.interface.clone(),
        virtual_router_id: keepalived.virtual_router_id,
        priority: keepalived.priority_for(ha_role),
        auth_pass: keepalived.auth_pass.clone(),
        virtual_ip: vip.to_string(),
    })
}

fn configure_haproxy<E: CommandExecutor + ?Sized>(
    session: &E,
    dir: &str,
    backends: Vec<String>,
    settings: &ClusterSettings,
    templates: &TemplateEngine,
) -> Result<()> {
    runner::run_checked(session, "sudo apt-get install haproxy -y", settings.failure_policy)?;
    let rendered = templates.render(Template::Haproxy, &HaproxyContext { backends })?;
    let staged = upload(session, dir, Template::Haproxy.file_name(), &rendered)?;
    runner::run_sequence(
        session,
        &[
            format!("sudo mv {} /etc/haproxy/haproxy.cfg", staged),
            "sudo systemctl restart haproxy".to_string(),
            "sudo systemctl enable haproxy".to_string(),
        ],
        settings.delays.command(),
        settings.failure_policy,
    )?;
    Ok(())
}

fn configure_keepalived<E: CommandExecutor + ?Sized>(
    session: &E,
    dir: &str,
    context: &KeepalivedContext,
    settings: &ClusterSettings,
    templates: &TemplateEngine,
) -> Result<()> {
    runner::run_checked(session, "sudo apt-get install keepalived -y", settings.failure_policy)?;
    let conf = templates.render(Template::Keepalived, context)?;
    let check = templates.render(Template::CheckApiserver, context)?;
    let conf_path = upload(session, dir, Template::Keepalived.file_name(), &conf)?;
    let check_path = upload(session, dir, Template::CheckApiserver.file_name(), &check)?;
    runner::run_sequence(
        session,
        &[
            format!("sudo mv {} /etc/keepalived/keepalived.conf", conf_path),
            format!("sudo mv {} /etc/keepalived/check_apiserver.sh", check_path),
            "sudo chmod +x /etc/keepalived/check_apiserver.sh".to_string(),
            "sudo systemctl restart keepalived".to_string(),
            "sudo systemctl enable keepalived".to_string(),
        ],
        settings.delays.command(),
        settings.failure_policy,
    )?;
    Ok(())
}

/// Install and configure the edge stack on every load balancer
pub fn configure_edge<C: Connector>(
    pool: &ConnectionPool<C>,
    groups: &RoleGroups<'_>,
    settings: &ClusterSettings,
    templates: &TemplateEngine,
) -> Result<Vec<String>> {
    let backends = groups.sorted_control_plane_addresses();
    let mut configured = Vec::new();

    for lb in groups.load_balancers() {
        let span = info_span!("edge", host = %lb.name, ip = lb.address());
        let _enter = span.enter();

        let context = keepalived_context(lb, settings)?;
        let session = session_for(pool, lb)?;

        let mut refresh = vec!["sudo apt-get update -y".to_string()];
        if settings.upgrade {
            refresh.push("sudo DEBIAN_FRONTEND=noninteractive apt-get upgrade -y".to_string());
        }
        runner::run_sequence(
            session.as_ref(),
            &refresh,
            settings.delays.command(),
            settings.failure_policy,
        )?;

        let dir = runner::pwd(session.as_ref())?;
        configure_haproxy(session.as_ref(), &dir, backends.clone(), settings, templates)?;
        configure_keepalived(session.as_ref(), &dir, &context, settings, templates)?;
        info!(state = %context.state, vip = %context.virtual_ip, "edge configured");
        configured.push(lb.name.clone());
    }
    Ok(configured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Delays;
    use crate::inventory::fixtures::{host, load_balancer};
    use crate::inventory::{HaRole, Inventory, Role};
    use crate::utils::exec::testing::FakeConnector;

    fn settings() -> ClusterSettings {
        ClusterSettings {
            delays: Delays::none(),
            ..ClusterSettings::default()
        }
    }

    fn inventory() -> Inventory {
        Inventory::new(vec![
            host("cp2", "10.0.0.12", Role::ControlPlane),
            host("cp1", "10.0.0.11", Role::ControlPlane),
            load_balancer("lb1", "10.0.0.5", "10.0.0.100", HaRole::Primary),
            load_balancer("lb2", "10.0.0.6", "10.0.0.100", HaRole::Backup),
            host("w1", "10.0.0.21", Role::Worker),
        ])
        .unwrap()
    }

    #[test]
    fn test_edge_runs_only_on_load_balancers() {
        let connector = FakeConnector::new();
        connector.respond("*", "pwd", "/home/ubuntu\n");
        let pool = ConnectionPool::new(connector.clone());
        let inventory = inventory();

        let configured = configure_edge(
            &pool,
            &inventory.group_by_role(),
            &settings(),
            &TemplateEngine::new().unwrap(),
        )
        .unwrap();

        assert_eq!(configured, vec!["lb1", "lb2"]);
        assert_eq!(
            connector.hosts_running("install haproxy"),
            vec!["10.0.0.5", "10.0.0.6"]
        );
        for ip in ["10.0.0.11", "10.0.0.12", "10.0.0.21"] {
            assert!(connector.commands_on(ip).is_empty());
        }
    }

    #[test]
    fn test_haproxy_backends_are_sorted_control_planes() {
        let connector = FakeConnector::new();
        connector.respond("*", "pwd", "/home/ubuntu\n");
        let pool = ConnectionPool::new(connector.clone());
        let inventory = inventory();

        configure_edge(
            &pool,
            &inventory.group_by_role(),
            &settings(),
            &TemplateEngine::new().unwrap(),
        )
        .unwrap();

        let cfg = connector.written("10.0.0.5", "/home/ubuntu/haproxy.cfg").unwrap();
        let first = cfg.find("10.0.0.11:6443").unwrap();
        let second = cfg.find("10.0.0.12:6443").unwrap();
        assert!(first < second);
        assert!(!cfg.contains("10.0.0.21"));
    }

    #[test]
    fn test_keepalived_state_and_priority_follow_ha_role() {
        let connector = FakeConnector::new();
        connector.respond("*", "pwd", "/home/ubuntu\n");
        let pool = ConnectionPool::new(connector.clone());
        let inventory = inventory();

        configure_edge(
            &pool,
            &inventory.group_by_role(),
            &settings(),
            &TemplateEngine::new().unwrap(),
        )
        .unwrap();

        let primary = connector.written("10.0.0.5", "/home/ubuntu/keepalived.conf").unwrap();
        assert!(primary.contains("state MASTER"));
        assert!(primary.contains("priority 101"));
        let backup = connector.written("10.0.0.6", "/home/ubuntu/keepalived.conf").unwrap();
        assert!(backup.contains("state BACKUP"));
        assert!(backup.contains("priority 100"));
        assert!(
            connector
                .commands_on("10.0.0.6")
                .contains(&"sudo mv /home/ubuntu/check_apiserver.sh /etc/keepalived/check_apiserver.sh".to_string())
        );
    }
}
