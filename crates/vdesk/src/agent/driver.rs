//! Display/input capability used by the agent.

use super::keys::Key;
use crate::error::{Error, Result};
use crate::process::{run_captured, CommandOutput};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

/// Pointer, keyboard and screen access on the guest desktop.
///
/// Implementations must tolerate their futures being dropped mid-call: the
/// agent cancels on timeout and then calls [`InputDriver::release_all`].
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn click(&self, x: i32, y: i32) -> Result<()>;
    async fn type_text(&self, text: &str) -> Result<()>;
    async fn key_press(&self, key: &Key) -> Result<()>;
    /// Capture the whole screen and return the image location.
    async fn capture_screen(&self) -> Result<PathBuf>;
    /// Release mouse button 1 and the common modifiers.
    async fn release_all(&self) -> Result<()>;
}

/// `xdotool` for input, ImageMagick `import` for captures.
#[derive(Clone, Debug)]
pub struct XdotoolDriver {
    display: String,
    screenshot_dir: PathBuf,
    command_timeout: Duration,
}

impl XdotoolDriver {
    pub fn new(display: impl Into<String>, screenshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            display: display.into(),
            screenshot_dir: screenshot_dir.into(),
            command_timeout: Duration::from_secs(10),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut command = Command::new(program);
        command.env("DISPLAY", &self.display).args(args);
        let output = run_captured(command, self.command_timeout, program).await?;
        if output.success() {
            return Ok(output);
        }
        let stderr = output.stderr.trim();
        Err(Error::remote(
            if stderr.is_empty() {
                format!("{program} exited with status {}", output.exit_code)
            } else {
                format!("{program} failed: {stderr}")
            },
            serde_json::json!({ "exit_code": output.exit_code }),
        ))
    }
}

#[async_trait]
impl InputDriver for XdotoolDriver {
    async fn click(&self, x: i32, y: i32) -> Result<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.run("xdotool", &["mousemove", "--sync", &x, &y, "click", "1"])
            .await
            .map(drop)
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.run("xdotool", &["type", "--delay", "12", "--", text])
            .await
            .map(drop)
    }

    async fn key_press(&self, key: &Key) -> Result<()> {
        self.run("xdotool", &["key", "--", key.as_str()]).await.map(drop)
    }

    async fn capture_screen(&self) -> Result<PathBuf> {
        let path = self
            .screenshot_dir
            .join(format!("screenshot-{}.png", Uuid::new_v4()));
        let target = path.display().to_string();
        self.run("import", &["-window", "root", &target]).await?;
        Ok(path)
    }

    async fn release_all(&self) -> Result<()> {
        self.run(
            "xdotool",
            &["mouseup", "1", "keyup", "Shift_L", "Control_L", "Alt_L", "Super_L"],
        )
        .await
        .map(drop)
    }
}
