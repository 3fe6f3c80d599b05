//! Error types for cluster bring-up

use thiserror::Error;

/// Errors raised while bringing a cluster up
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SetupError {
    /// Missing or contradictory input. Always raised before any remote side effect.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A hypervisor task finished with a non-OK status or did not finish in time
    #[error("hypervisor task error: {0}")]
    HypervisorTask(String),

    /// A remote command failed while the run was in fail-fast mode
    #[error("remote command failed on {host}: `{command}` (exit {status})")]
    RemoteCommand {
        host: String,
        command: String,
        status: i32,
    },

    /// Tool output did not contain what we expected to extract from it
    #[error("parse error: {0}")]
    Parse(String),

    /// A template failed to render
    #[error("template error: {0}")]
    Template(String),

    /// The transport to a host (ssh, scp, http) could not be used at all
    #[error("transport error: {0}")]
    Transport(String),
}

impl SetupError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn hypervisor_task(msg: impl Into<String>) -> Self {
        Self::HypervisorTask(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// True for errors that must stop the run before anything touches a host
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<std::io::Error> for SetupError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for SetupError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SetupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_message_names_host_and_command() {
        let err = SetupError::RemoteCommand {
            host: "10.0.0.5".to_string(),
            command: "sudo swapoff -a".to_string(),
            status: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.5"));
        assert!(msg.contains("sudo swapoff -a"));
        assert!(msg.contains("exit 1"));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(SetupError::configuration("missing user").is_configuration());
        assert!(!SetupError::parse("no join marker").is_configuration());
    }

    #[test]
    fn test_io_error_becomes_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "ssh not found");
        let err: SetupError = io.into();
        assert!(matches!(err, SetupError::Transport(_)));
    }
}
