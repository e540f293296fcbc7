//! SSH access to freshly created VMs.
//!
//! [`OpenSshConnector`] drives the system `ssh` binary through
//! `tokio::process`. Tests substitute their own [`SshConnector`].

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CloudError, CloudResult};

/// An established session with one VM.
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Write `content` to `remote_path` on the VM.
    async fn upload(&self, content: &str, remote_path: &str) -> CloudResult<()>;

    /// Run `command` on the VM. A non-zero exit status is an error.
    async fn execute(&self, command: &str) -> CloudResult<()>;
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Open a session. Fails if the VM does not accept connections yet.
    async fn connect(&self, ip_address: &str, username: &str) -> CloudResult<Box<dyn SshClient>>;
}

// ── OpenSSH ────────────────────────────────────────────────────────

pub struct OpenSshConnector {
    private_key: Option<PathBuf>,
    connect_timeout_secs: u64,
}

impl OpenSshConnector {
    pub fn new(private_key: Option<PathBuf>) -> Self {
        Self {
            private_key,
            connect_timeout_secs: 10,
        }
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    fn base_args(&self, ip_address: &str, username: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(key) = &self.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{username}@{ip_address}"));
        args
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn connect(&self, ip_address: &str, username: &str) -> CloudResult<Box<dyn SshClient>> {
        let client = OpenSshClient {
            args: self.base_args(ip_address, username),
            destination: format!("{username}@{ip_address}"),
        };
        client.execute("true").await?;
        debug!(destination = %client.destination, "ssh connection established");
        Ok(Box::new(client))
    }
}

struct OpenSshClient {
    args: Vec<String>,
    destination: String,
}

impl OpenSshClient {
    fn command(&self, remote: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(&self.args);
        command.arg(remote);
        command.kill_on_drop(true);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command
    }

    fn check(&self, remote: &str, output: std::process::Output) -> CloudResult<()> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CloudError::Ssh(format!(
            "`{remote}` on {} exited with {}: {}",
            self.destination,
            output.status,
            stderr.trim()
        )))
    }
}

#[async_trait]
impl SshClient for OpenSshClient {
    async fn upload(&self, content: &str, remote_path: &str) -> CloudResult<()> {
        let remote = format!("cat > {}", shell_quote(remote_path));
        let mut child = self
            .command(&remote)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| CloudError::Ssh(format!("could not start ssh: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        self.check(&remote, output)
    }

    async fn execute(&self, command: &str) -> CloudResult<()> {
        let output = self
            .command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CloudError::Ssh(format!("could not start ssh: {e}")))?;
        self.check(command, output)
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_include_key_and_destination() {
        let connector = OpenSshConnector::new(Some(PathBuf::from("/etc/chaingrid/id_rsa")))
            .with_connect_timeout_secs(5);
        let args = connector.base_args("10.0.0.7", "ubuntu");
        assert_eq!(args.last().map(String::as_str), Some("ubuntu@10.0.0.7"));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        let key = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key + 1], "/etc/chaingrid/id_rsa");
    }

    #[test]
    fn args_without_key() {
        let args = OpenSshConnector::new(None).base_args("10.0.0.7", "root");
        assert!(!args.iter().any(|a| a == "-i"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/tmp/setup.sh"), "'/tmp/setup.sh'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
