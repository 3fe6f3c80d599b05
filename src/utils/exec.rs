use crate::error::Result;
use std::path::PathBuf;
use std::process::Output;

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// First line of stdout, trimmed
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status.code(),
        }
    }
}

/// Login material for opening a session to a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub key_path: PathBuf,
}

impl Credentials {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
        }
    }
}

/// An open command channel to one host
///
/// Implementations serialize commands: a session never runs two commands at once.
pub trait CommandExecutor: Send + Sync {
    /// Address this session is bound to
    fn address(&self) -> &str;

    /// Run a shell command and wait for it to finish
    fn execute_shell(&self, command: &str) -> Result<CommandOutput>;

    /// Deliver a whole file over the transfer sub-channel
    fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Tear the channel down. Closing twice is a no-op.
    fn close(&self) -> Result<()>;
}

/// Opens sessions. The pool owns one of these.
pub trait Connector: Send + Sync {
    type Session: CommandExecutor;

    fn connect(&self, address: &str, credentials: &Credentials) -> Result<Self::Session>;
}
