//! Remote command execution, the primitive every guest-side probe and
//! remediation step is built on.

use crate::config::HealthConfig;
use crate::error::Result;
use crate::process::run_captured;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

pub use crate::process::{shell_quote, CommandOutput};

/// Runs a shell command somewhere and reports `(stdout, stderr, exit_code)`.
///
/// A non-zero exit is a normal [`CommandOutput`]; `Err` means the command
/// could not be run at all or exceeded `timeout`.
#[async_trait]
pub trait RemoteCommandExecutor: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// OpenSSH in batch mode. Host keys are not pinned: guests are recreated
/// from images and the transport is loopback or a private bridge.
#[derive(Clone, Debug)]
pub struct SshExecutor {
    binary: String,
    host: String,
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
}

impl SshExecutor {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            binary: "ssh".to_string(),
            host: host.into(),
            port,
            user: user.into(),
            identity_file: None,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            binary: config.ssh_binary.clone(),
            host: config.host.clone(),
            port: config.ssh_port,
            user: config.user.clone(),
            identity_file: config.identity_file.clone(),
        }
    }

    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Arguments passed to the ssh binary for `command`.
    pub fn args(&self, command: &str, timeout: Duration) -> Vec<String> {
        let connect_secs = timeout.as_secs().max(1);
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={connect_secs}"),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteCommandExecutor for SshExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut ssh = Command::new(&self.binary);
        ssh.args(self.args(command, timeout));
        tracing::trace!(host = %self.host, port = self.port, command, "ssh exec");
        run_captured(ssh, timeout, "ssh").await
    }
}

/// Runs commands on this host through `sh -c`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalExecutor;

#[async_trait]
impl RemoteCommandExecutor for LocalExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut sh = Command::new("sh");
        sh.arg("-c").arg(command);
        run_captured(sh, timeout, "local command").await
    }
}
