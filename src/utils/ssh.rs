use crate::error::{Result, SetupError};
use crate::utils::exec::{CommandExecutor, CommandOutput, Connector, Credentials};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tracing::debug;

/// SSH connection for remote command execution
///
/// Backed by an OpenSSH control master: the first connect opens one TCP/SSH
/// connection that every later command and file write multiplexes over, until
/// [`CommandExecutor::close`] sends `-O exit`.
pub struct SshConnection {
    address: String,
    destination: String,
    key_path: PathBuf,
    control_path: PathBuf,
    /// One in-flight command per host
    busy: Mutex<()>,
    closed: AtomicBool,
}

impl SshConnection {
    pub fn connect(address: &str, credentials: &Credentials, control_dir: &Path) -> Result<Self> {
        let conn = Self {
            address: address.to_string(),
            destination: format!("{}@{}", credentials.user, address),
            key_path: credentials.key_path.clone(),
            control_path: control_dir.join(format!("{}.sock", address.replace(':', "_"))),
            busy: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        // Opening the master doubles as the key-auth probe
        let mut args = conn.build_ssh_args();
        args.insert(args.len() - 1, "-o".to_string());
        args.insert(args.len() - 1, "ConnectTimeout=10".to_string());
        args.push("echo".to_string());
        args.push("test".to_string());

        let output = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| SetupError::transport(format!("failed to spawn ssh: {}", e)))?;

        if !output.status.success() {
            return Err(SetupError::transport(format!(
                "could not open ssh session to {}: {}",
                conn.destination,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(address, "ssh control master established");
        Ok(conn)
    }

    fn build_ssh_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            // Lab hosts are recreated constantly; trust whatever key they present
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "PreferredAuthentications=publickey".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            self.destination.clone(),
        ]
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SetupError::transport(format!(
                "session to {} is closed",
                self.address
            )));
        }
        Ok(())
    }
}

impl CommandExecutor for SshConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn execute_shell(&self, command: &str) -> Result<CommandOutput> {
        self.ensure_open()?;
        let _guard = self.busy.lock().unwrap_or_else(|e| e.into_inner());

        let mut ssh_args = self.build_ssh_args();
        ssh_args.push(command.to_string());

        let output = Command::new("ssh")
            .args(&ssh_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SetupError::transport(format!("failed to execute ssh: {}", e)))?;

        Ok(output.into())
    }

    fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.busy.lock().unwrap_or_else(|e| e.into_inner());

        let mut ssh_args = self.build_ssh_args();
        ssh_args.push(format!("cat > {}", shell_escape(path)));

        let mut child = Command::new("ssh")
            .args(&ssh_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SetupError::transport(format!("failed to spawn ssh for {}: {}", path, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content)?;
            stdin.flush()?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(SetupError::transport(format!(
                "failed to write {} on {}: {}",
                path,
                self.address,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.busy.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("ssh")
            .args([
                "-o",
                &format!("ControlPath={}", self.control_path.display()),
                "-O",
                "exit",
                &self.destination,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        if !output.status.success() {
            // Master already gone (host rebooted, socket removed); nothing left to close
            debug!(
                address = %self.address,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ssh control master was not running"
            );
        }
        Ok(())
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens [`SshConnection`]s with their control sockets in a private temp dir
pub struct SshConnector {
    control_dir: TempDir,
}

impl SshConnector {
    pub fn new() -> Result<Self> {
        let control_dir = tempfile::Builder::new().prefix("kubesetup-ssh-").tempdir()?;
        Ok(Self { control_dir })
    }
}

impl Connector for SshConnector {
    type Session = SshConnection;

    fn connect(&self, address: &str, credentials: &Credentials) -> Result<SshConnection> {
        SshConnection::connect(address, credentials, self.control_dir.path())
    }
}

/// Escape a string for safe use in shell commands
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '/' || c == '.')
    {
        return s.to_string();
    }

    // End the quote, add an escaped quote, start a new quote
    let escaped = s.replace('\'', "'\"'\"'");
    format!("'{}'", escaped)
}
