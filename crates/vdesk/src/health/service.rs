//! Guest service-manager access.

use super::remote::{shell_quote, RemoteCommandExecutor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Query and start guest services. `start` must be idempotent.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn is_active(&self, service: &str) -> Result<bool>;
    async fn start(&self, service: &str) -> Result<()>;
}

/// systemd on the guest, driven through a [`RemoteCommandExecutor`].
pub struct SystemdController {
    executor: Arc<dyn RemoteCommandExecutor>,
    timeout: Duration,
    use_sudo: bool,
}

impl SystemdController {
    pub fn new(
        executor: Arc<dyn RemoteCommandExecutor>,
        timeout: Duration,
        use_sudo: bool,
    ) -> Self {
        Self {
            executor,
            timeout,
            use_sudo,
        }
    }

    fn start_command(&self, service: &str) -> String {
        let sudo = if self.use_sudo { "sudo -n " } else { "" };
        format!("{sudo}systemctl start {}", shell_quote(service))
    }
}

#[async_trait]
impl ServiceController for SystemdController {
    async fn is_active(&self, service: &str) -> Result<bool> {
        let command = format!("systemctl is-active --quiet {}", shell_quote(service));
        let output = self.executor.run(&command, self.timeout).await?;
        Ok(output.success())
    }

    async fn start(&self, service: &str) -> Result<()> {
        let output = self
            .executor
            .run(&self.start_command(service), self.timeout)
            .await?;
        if output.success() {
            return Ok(());
        }
        Err(Error::remote(
            format!("failed to start {service}"),
            serde_json::json!({
                "exit_code": output.exit_code,
                "stderr": output.stderr.trim(),
            }),
        ))
    }
}
