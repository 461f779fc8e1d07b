//! Bounded child-process execution.
//!
//! Every external command (ssh, systemctl via ssh, pgrep, xdotool, import)
//! runs through [`run_captured`]: output is captured, and when the ceiling
//! expires the child is killed rather than left running in the background.

use crate::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `command` to completion, killing it if it outlives `timeout`.
pub async fn run_captured(
    mut command: Command,
    timeout: Duration,
    what: &str,
) -> Result<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command
        .spawn()
        .map_err(|err| Error::io(format!("failed to spawn {what}"), err))?;

    // Dropping the wait future on timeout drops the child, which kills it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }),
        Ok(Err(err)) => Err(Error::io(format!("failed to wait for {what}"), err)),
        Err(_) => Err(Error::timeout(
            format!("{what} timed out"),
            serde_json::json!({ "timeout_ms": duration_ms(timeout) }),
        )),
    }
}

/// Single-quote `value` for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
