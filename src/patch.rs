//! Whole-file remote edits driven by marker rules
//!
//! A remote file is read in full, every line containing a rule's marker is
//! transformed, and the complete result is written back. Lines are never
//! patched in place on the host.

use crate::error::Result;
use crate::runner::{self, FailurePolicy};
use crate::utils::exec::CommandExecutor;
use crate::utils::ssh::shell_escape;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Strip leading `#` characters and surrounding whitespace
    Uncomment,
    /// Literal substring replacement within the matched line
    Replace { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRule {
    pub marker: String,
    pub transform: Transform,
}

impl PatchRule {
    pub fn uncomment(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            transform: Transform::Uncomment,
        }
    }

    pub fn replace(marker: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            transform: Transform::Replace {
                from: from.into(),
                to: to.into(),
            },
        }
    }

    fn apply(&self, line: &str) -> String {
        match &self.transform {
            Transform::Uncomment => line.trim().trim_start_matches('#').trim().to_string(),
            Transform::Replace { from, to } => line.replace(from.as_str(), to),
        }
    }
}

/// Apply the first matching rule to each line. Line endings are preserved.
pub fn apply_rules(content: &str, rules: &[PatchRule]) -> String {
    content
        .split_inclusive('\n')
        .map(|line| {
            let (body, ending) = match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            };
            match rules.iter().find(|r| body.contains(r.marker.as_str())) {
                Some(rule) => format!("{}{}", rule.apply(body), ending),
                None => line.to_string(),
            }
        })
        .collect()
}

/// Read `path` on the host, apply `rules`, write the whole file back as root
///
/// A failed read or install is logged and skipped under
/// [`FailurePolicy::BestEffort`] and raised under [`FailurePolicy::FailFast`].
pub fn patch_remote_file<E: CommandExecutor + ?Sized>(
    session: &E,
    path: &str,
    rules: &[PatchRule],
    policy: FailurePolicy,
) -> Result<()> {
    let read = format!("sudo cat {}", shell_escape(path));
    let current = runner::run_checked(session, &read, policy)?;
    if !current.success() {
        warn!(host = session.address(), path, "could not read file, leaving it untouched");
        return Ok(());
    }

    let patched = apply_rules(&current.stdout, rules);
    if patched == current.stdout {
        info!(host = session.address(), path, "no lines matched, file left untouched");
        return Ok(());
    }

    // Stage next to the user's files, then replace the target in one copy
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let staged = format!("/tmp/kubesetup-{}", file_name);
    session.write_file(&staged, patched.as_bytes())?;
    let installed = runner::run_checked(
        session,
        &format!(
            "sudo cp {} {} && rm -f {}",
            shell_escape(&staged),
            shell_escape(path),
            shell_escape(&staged)
        ),
        policy,
    )?;
    if installed.success() {
        info!(host = session.address(), path, "patched");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SetupError;
    use crate::utils::exec::testing::FakeConnector;
    use crate::utils::exec::{CommandOutput, Connector, Credentials};
    use pretty_assertions::assert_eq;

    const SYSCTL: &str = "\
# Uncomment the next line to enable packet forwarding for IPv4
#net.ipv4.ip_forward=1

# Uncomment the next line to enable packet forwarding for IPv6
#net.ipv6.conf.all.forwarding=1
kernel.printk = 3 4 1 3
";

    #[test]
    fn test_uncomment_rules() {
        let rules = [
            PatchRule::uncomment("net.ipv4.ip_forward=1"),
            PatchRule::uncomment("net.ipv6.conf.all.forwarding=1"),
        ];
        let expected = "\
# Uncomment the next line to enable packet forwarding for IPv4
net.ipv4.ip_forward=1

# Uncomment the next line to enable packet forwarding for IPv6
net.ipv6.conf.all.forwarding=1
kernel.printk = 3 4 1 3
";
        assert_eq!(apply_rules(SYSCTL, &rules), expected);
    }

    #[test]
    fn test_replace_rule_only_touches_matching_lines() {
        let config = "    SystemdCgroup = false\n    NoPivotRoot = false\n";
        let rules = [PatchRule::replace("SystemdCgroup = false", "false", "true")];
        assert_eq!(
            apply_rules(config, &rules),
            "    SystemdCgroup = true\n    NoPivotRoot = false\n"
        );
    }

    #[test]
    fn test_missing_trailing_newline_is_preserved() {
        let rules = [PatchRule::uncomment("a=1")];
        assert_eq!(apply_rules("#a=1", &rules), "a=1");
    }

    #[test]
    fn test_patch_remote_file_writes_whole_file_back() {
        let connector = FakeConnector::new();
        connector.seed_file("10.0.0.5", "/etc/sysctl.conf", SYSCTL);
        let session = connector
            .connect("10.0.0.5", &Credentials::new("u", "key"))
            .unwrap();

        patch_remote_file(
            &session,
            "/etc/sysctl.conf",
            &[PatchRule::uncomment("net.ipv4.ip_forward=1")],
            FailurePolicy::BestEffort,
        )
        .unwrap();

        let written = connector
            .written("10.0.0.5", "/tmp/kubesetup-sysctl.conf")
            .unwrap();
        assert!(written.contains("\nnet.ipv4.ip_forward=1\n"));
        assert!(written.contains("#net.ipv6.conf.all.forwarding=1"));
        let commands = connector.commands_on("10.0.0.5");
        assert_eq!(commands[0], "sudo cat /etc/sysctl.conf");
        assert!(commands[1].starts_with("sudo cp /tmp/kubesetup-sysctl.conf /etc/sysctl.conf"));
    }

    #[test]
    fn test_patch_remote_file_skips_write_when_nothing_matches() {
        let connector = FakeConnector::new();
        connector.seed_file("10.0.0.5", "/etc/sysctl.conf", "kernel.printk = 3\n");
        let session = connector
            .connect("10.0.0.5", &Credentials::new("u", "key"))
            .unwrap();

        patch_remote_file(
            &session,
            "/etc/sysctl.conf",
            &[PatchRule::uncomment("net.ipv4.ip_forward=1")],
            FailurePolicy::BestEffort,
        )
        .unwrap();

        assert!(connector.written("10.0.0.5", "/tmp/kubesetup-sysctl.conf").is_none());
        assert_eq!(connector.commands_on("10.0.0.5").len(), 1);
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status: Some(1),
        }
    }

    #[test]
    fn test_unreadable_file_is_skipped_under_best_effort() {
        let connector = FakeConnector::new();
        connector.respond_with("10.0.0.5", "sudo cat /etc/sysctl.conf", failed("boom"));
        let session = connector
            .connect("10.0.0.5", &Credentials::new("u", "key"))
            .unwrap();

        patch_remote_file(
            &session,
            "/etc/sysctl.conf",
            &[PatchRule::uncomment("net.ipv4.ip_forward=1")],
            FailurePolicy::BestEffort,
        )
        .unwrap();

        assert!(connector.written("10.0.0.5", "/tmp/kubesetup-sysctl.conf").is_none());
        assert_eq!(connector.commands_on("10.0.0.5"), vec!["sudo cat /etc/sysctl.conf"]);
    }

    #[test]
    fn test_unreadable_file_fails_fast() {
        let connector = FakeConnector::new();
        connector.respond_with("10.0.0.5", "sudo cat /etc/sysctl.conf", failed("boom"));
        let session = connector
            .connect("10.0.0.5", &Credentials::new("u", "key"))
            .unwrap();

        let err = patch_remote_file(
            &session,
            "/etc/sysctl.conf",
            &[PatchRule::uncomment("net.ipv4.ip_forward=1")],
            FailurePolicy::FailFast,
        )
        .unwrap_err();

        assert!(matches!(err, SetupError::RemoteCommand { status: 1, .. }));
        assert!(connector.written("10.0.0.5", "/tmp/kubesetup-sysctl.conf").is_none());
    }

    #[test]
    fn test_failed_install_fails_fast() {
        let connector = FakeConnector::new();
        connector.seed_file("10.0.0.5", "/etc/sysctl.conf", SYSCTL);
        connector.respond_with("10.0.0.5", "sudo cp /tmp/kubesetup-sysctl.conf", failed("read-only"));
        let session = connector
            .connect("10.0.0.5", &Credentials::new("u", "key"))
            .unwrap();

        let err = patch_remote_file(
            &session,
            "/etc/sysctl.conf",
            &[PatchRule::uncomment("net.ipv4.ip_forward=1")],
            FailurePolicy::FailFast,
        )
        .unwrap_err();

        match err {
            SetupError::RemoteCommand { host, command, .. } => {
                assert_eq!(host, "10.0.0.5");
                assert!(command.starts_with("sudo cp /tmp/kubesetup-sysctl.conf /etc/sysctl.conf"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
