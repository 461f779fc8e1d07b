//! Per-action execution with ceilings and release-on-cancel.

use super::driver::InputDriver;
use super::keys::Key;
use crate::error::{Error, Result};
use crate::model::{clamp_wait, ActionKind, ActionRequest, ActionResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error text for an action that exceeded its ceiling.
pub const ACTION_TIMEOUT: &str = "timeout";

/// Ceiling for the cleanup pass that follows a cancelled click or key.
const RELEASE_CEILING: Duration = Duration::from_secs(1);

/// Runs decoded requests against an [`InputDriver`].
///
/// Failures never escape as errors: every outcome, including a driver panic,
/// is folded into an [`ActionResult`].
#[derive(Clone)]
pub struct ActionExecutor {
    driver: Arc<dyn InputDriver>,
    min_screenshot_bytes: u64,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn InputDriver>, min_screenshot_bytes: u64) -> Self {
        Self {
            driver,
            min_screenshot_bytes,
        }
    }

    pub async fn execute(&self, request: ActionRequest) -> ActionResult {
        let kind = request.kind();
        if let ActionRequest::Wait { duration } = request {
            // The clamp already bounds this below the wait ceiling.
            tokio::time::sleep(clamp_wait(duration)).await;
            return ActionResult::ok(kind);
        }

        let this = self.clone();
        let mut task = tokio::spawn(async move { this.perform(request).await });
        match tokio::time::timeout(kind.ceiling(), &mut task).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(err))) => {
                debug!(action = %kind, error = %err, "action failed");
                ActionResult::failure(kind.as_str(), err.message)
            }
            Ok(Err(join_err)) => {
                warn!(action = %kind, error = %join_err, "action task aborted");
                ActionResult::failure(kind.as_str(), format!("{kind} aborted unexpectedly"))
            }
            Err(_) => {
                task.abort();
                // The aborted future (and its kill_on_drop child) is gone once this resolves.
                let _ = (&mut task).await;
                warn!(
                    action = %kind,
                    ceiling_secs = kind.ceiling().as_secs(),
                    "action timed out"
                );
                if kind.holds_input() {
                    self.release_input().await;
                }
                ActionResult::failure(kind.as_str(), ACTION_TIMEOUT)
            }
        }
    }

    async fn perform(&self, request: ActionRequest) -> Result<ActionResult> {
        let kind = request.kind();
        match request {
            ActionRequest::Click { x, y } => self.driver.click(x, y).await?,
            ActionRequest::Type { text } => self.driver.type_text(&text).await?,
            ActionRequest::Key { key } => self.driver.key_press(&Key::resolve(&key)).await?,
            ActionRequest::Wait { duration } => tokio::time::sleep(clamp_wait(duration)).await,
            ActionRequest::Screenshot => {
                let path = self.driver.capture_screen().await?;
                self.verify_capture(&path).await?;
                return Ok(ActionResult::captured(path.display().to_string()));
            }
        }
        Ok(ActionResult::ok(kind))
    }

    async fn verify_capture(&self, path: &Path) -> Result<()> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| Error::io("screenshot was not written", err))?;
        if metadata.len() >= self.min_screenshot_bytes {
            return Ok(());
        }
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!(path = %path.display(), error = %err, "failed to remove undersized screenshot");
        }
        Err(Error::remote(
            format!(
                "screenshot too small ({} bytes, expected at least {})",
                metadata.len(),
                self.min_screenshot_bytes
            ),
            None,
        ))
    }

    async fn release_input(&self) {
        match tokio::time::timeout(RELEASE_CEILING, self.driver.release_all()).await {
            Ok(Ok(())) => debug!("released held input"),
            Ok(Err(err)) => warn!(error = %err, "failed to release held input"),
            Err(_) => warn!("releasing held input timed out"),
        }
    }
}
