//! Remote command runner
//!
//! Commands are run the way a shell script would run them: one after another,
//! output logged, exit status ignored. [`FailurePolicy::FailFast`] turns a
//! non-zero exit into [`SetupError::RemoteCommand`] instead.

use crate::error::{Result, SetupError};
use crate::utils::exec::{CommandExecutor, CommandOutput};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Log failures and keep going
    #[default]
    BestEffort,
    /// Abort on the first non-zero exit
    FailFast,
}

/// Run one command, log its output, hand the output back
pub fn run<E: CommandExecutor + ?Sized>(session: &E, command: &str) -> Result<CommandOutput> {
    run_logged_as(session, command, command)
}

/// Like [`run`], but logs `shown` in place of a command that carries a secret
pub fn run_redacted<E: CommandExecutor + ?Sized>(
    session: &E,
    command: &str,
    shown: &str,
) -> Result<CommandOutput> {
    run_logged_as(session, command, shown)
}

fn run_logged_as<E: CommandExecutor + ?Sized>(
    session: &E,
    command: &str,
    shown: &str,
) -> Result<CommandOutput> {
    let output = session.execute_shell(command)?;
    info!(
        host = session.address(),
        command = shown,
        stdout = %output.stdout.trim_end(),
        stderr = %output.stderr.trim_end(),
        "{}",
        shown
    );
    Ok(output)
}

/// Run one command under `policy`
pub fn run_checked<E: CommandExecutor + ?Sized>(
    session: &E,
    command: &str,
    policy: FailurePolicy,
) -> Result<CommandOutput> {
    let output = run(session, command)?;
    if !output.success() {
        match policy {
            FailurePolicy::BestEffort => {
                warn!(
                    host = session.address(),
                    command,
                    status = ?output.status,
                    "command failed, continuing"
                );
            }
            FailurePolicy::FailFast => {
                return Err(SetupError::RemoteCommand {
                    host: session.address().to_string(),
                    command: command.to_string(),
                    status: output.status.unwrap_or(-1),
                });
            }
        }
    }
    Ok(output)
}

/// Run commands strictly in order, pausing `inter_delay` between them
pub fn run_sequence<E, S>(
    session: &E,
    commands: &[S],
    inter_delay: Duration,
    policy: FailurePolicy,
) -> Result<Vec<CommandOutput>>
where
    E: CommandExecutor + ?Sized,
    S: AsRef<str>,
{
    let mut outputs = Vec::with_capacity(commands.len());
    for (idx, command) in commands.iter().enumerate() {
        if idx > 0 {
            pause(inter_delay);
        }
        outputs.push(run_checked(session, command.as_ref(), policy)?);
    }
    Ok(outputs)
}

/// Working directory of the login user, where rendered files are dropped
pub fn pwd<E: CommandExecutor + ?Sized>(session: &E) -> Result<String> {
    let output = run(session, "pwd")?;
    let dir = output.first_line();
    if dir.is_empty() {
        return Err(SetupError::parse(format!(
            "`pwd` on {} printed nothing",
            session.address()
        )));
    }
    Ok(dir.to_string())
}

pub fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
