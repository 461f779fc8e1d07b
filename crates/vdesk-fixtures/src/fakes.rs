//! In-memory stand-ins for the external capabilities vdesk drives.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vdesk::agent::{InputDriver, Key};
use vdesk::error::{Error, Result};
use vdesk::health::{CommandOutput, RemoteCommandExecutor, ServiceController};

// ============================================================================
// ScriptedExecutor
// ============================================================================

#[derive(Clone, Debug)]
enum Reply {
    Output(CommandOutput),
    Hang,
    Error(String),
}

/// Remote command executor that answers from a script.
///
/// Rules match by substring, first match wins. Unmatched commands succeed
/// with empty output, except `echo X`, which prints `X`.
///
/// # Example
///
/// ```ignore
/// let remote = ScriptedExecutor::new()
///     .respond("test -f", 1, "")
///     .hang("curl");
/// ```
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `needle` exit with `exit_code` and print `stdout`.
    #[must_use]
    pub fn respond(self, needle: &str, exit_code: i32, stdout: &str) -> Self {
        self.set(needle, exit_code, stdout);
        self
    }

    /// Commands containing `needle` never finish.
    #[must_use]
    pub fn hang(self, needle: &str) -> Self {
        self.put(needle, Reply::Hang);
        self
    }

    /// Commands containing `needle` cannot be run at all.
    #[must_use]
    pub fn fail(self, needle: &str, message: &str) -> Self {
        self.put(needle, Reply::Error(message.to_string()));
        self
    }

    /// Replace (or add) the rule for `needle` on a shared executor.
    pub fn set(&self, needle: &str, exit_code: i32, stdout: &str) {
        self.put(
            needle,
            Reply::Output(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
            }),
        );
    }

    fn put(&self, needle: &str, reply: Reply) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(slot) = rules.iter_mut().find(|(n, _)| n == needle) {
            slot.1 = reply;
        } else {
            rules.push((needle.to_string(), reply));
        }
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of commands run so far that contain `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }

    fn reply_for(&self, command: &str) -> Reply {
        let rules = self.rules.lock().unwrap();
        let matched = rules
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()));
        if let Some((_, reply)) = matched {
            return reply.clone();
        }
        let stdout = command
            .strip_prefix("echo ")
            .map(|rest| format!("{rest}\n"))
            .unwrap_or_default();
        Reply::Output(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

#[async_trait]
impl RemoteCommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        match self.reply_for(command) {
            Reply::Output(output) => Ok(output),
            Reply::Error(message) => Err(Error::remote(message, None)),
            Reply::Hang => {
                tokio::time::sleep(timeout).await;
                Err(Error::timeout(format!("{command} timed out"), None))
            }
        }
    }
}

// ============================================================================
// FakeServices
// ============================================================================

type StartHook = Arc<dyn Fn() + Send + Sync>;

/// Service manager kept in memory.
///
/// `start` marks the service active unless it was registered as broken, and
/// runs any hook registered for it.
#[derive(Default)]
pub struct FakeServices {
    active: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    starts: Mutex<Vec<String>>,
    hooks: Mutex<HashMap<String, StartHook>>,
}

impl FakeServices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Services that are already running.
    #[must_use]
    pub fn with_active(self, services: &[&str]) -> Self {
        self.active
            .lock()
            .unwrap()
            .extend(services.iter().map(|s| (*s).to_string()));
        self
    }

    /// `start` succeeds for `service` but it never becomes active.
    #[must_use]
    pub fn with_broken(self, service: &str) -> Self {
        self.broken.lock().unwrap().insert(service.to_string());
        self
    }

    /// Run `hook` every time `service` is started.
    #[must_use]
    pub fn on_start(self, service: &str, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks
            .lock()
            .unwrap()
            .insert(service.to_string(), Arc::new(hook));
        self
    }

    /// Every `start` call so far, in order.
    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stop(&self, service: &str) {
        self.active.lock().unwrap().remove(service);
    }
}

#[async_trait]
impl ServiceController for FakeServices {
    async fn is_active(&self, service: &str) -> Result<bool> {
        Ok(self.active.lock().unwrap().contains(service))
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.starts.lock().unwrap().push(service.to_string());
        if !self.broken.lock().unwrap().contains(service) {
            self.active.lock().unwrap().insert(service.to_string());
        }
        let hook = self.hooks.lock().unwrap().get(service).cloned();
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }
}

// ============================================================================
// RecordingDriver
// ============================================================================

/// One call observed by [`RecordingDriver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Click(i32, i32),
    Type(String),
    Key(String),
    Screenshot,
    ReleaseAll,
    /// An in-flight action was dropped before it finished.
    Cancelled,
}

/// Records [`DriverCall::Cancelled`] if dropped while still armed.
struct InFlight<'a> {
    calls: &'a Mutex<Vec<DriverCall>>,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.calls.lock().unwrap().push(DriverCall::Cancelled);
        }
    }
}

/// Input driver that records calls instead of touching a display.
///
/// Captures are written to `dir` with `screenshot_bytes` bytes of content.
/// An action dropped mid-flight records [`DriverCall::Cancelled`], so tests
/// can see whether a cancellation landed before or after `release_all`.
#[derive(Debug)]
pub struct RecordingDriver {
    calls: Mutex<Vec<DriverCall>>,
    dir: PathBuf,
    delay: Option<Duration>,
    screenshot_bytes: usize,
    failure: Option<String>,
}

impl RecordingDriver {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            dir: dir.into(),
            delay: None,
            screenshot_bytes: 4096,
            failure: None,
        }
    }

    /// Every action (not `release_all`) sleeps this long before finishing.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_screenshot_bytes(mut self, bytes: usize) -> Self {
        self.screenshot_bytes = bytes;
        self
    }

    /// Every action fails with `message`.
    #[must_use]
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn act(&self, call: DriverCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        let mut in_flight = InFlight {
            calls: &self.calls,
            armed: true,
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        in_flight.armed = false;
        match &self.failure {
            Some(message) => Err(Error::remote(message.clone(), None)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InputDriver for RecordingDriver {
    async fn click(&self, x: i32, y: i32) -> Result<()> {
        self.act(DriverCall::Click(x, y)).await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.act(DriverCall::Type(text.to_string())).await
    }

    async fn key_press(&self, key: &Key) -> Result<()> {
        self.act(DriverCall::Key(key.as_str().to_string())).await
    }

    async fn capture_screen(&self) -> Result<PathBuf> {
        self.act(DriverCall::Screenshot).await?;
        let seq = self.calls.lock().unwrap().len();
        let path = self.dir.join(format!("capture-{seq}.png"));
        tokio::fs::write(&path, vec![0x89; self.screenshot_bytes])
            .await
            .map_err(|err| Error::io("failed to write capture", err))?;
        Ok(path)
    }

    async fn release_all(&self) -> Result<()> {
        self.calls.lock().unwrap().push(DriverCall::ReleaseAll);
        Ok(())
    }
}
