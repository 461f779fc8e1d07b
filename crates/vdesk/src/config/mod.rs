//! Runtime configuration for the three services.
//!
//! The supervisor reads an optional YAML/JSON file first and then lets
//! `VDESK_*` environment variables override individual keys, so a scheduler
//! can run it with no arguments at all. Agent and relay settings come mostly
//! from CLI flags with environment fallbacks.

use crate::error::{Error, Result};
use crate::model::ForwardRule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment key.
pub const ENV_PREFIX: &str = "VDESK_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Guest address as seen from the host.
    pub host: String,
    /// Guest SSH port (the control port probed for reachability).
    pub ssh_port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub ssh_binary: String,
    /// Pidfile of the VM process; preferred over `vm_process_pattern`.
    pub vm_pidfile: Option<PathBuf>,
    /// `pgrep -f` pattern matching the VM process.
    pub vm_process_pattern: Option<String>,
    /// Directory holding `state.json` and its lock file.
    pub state_dir: PathBuf,
    /// Defaults to `<state_dir>/health.log`.
    pub log_file: Option<PathBuf>,
    pub max_retries: u32,
    pub probe_timeout_secs: u64,
    pub remediation_timeout_secs: u64,
    /// Pause between remediation and the re-probe.
    pub settle_secs: u64,
    pub lock_timeout_secs: u64,
    pub required_services: Vec<String>,
    /// Guest path written once first-boot provisioning finishes.
    pub bootstrap_marker: String,
    /// Unit whose successful run writes `bootstrap_marker`.
    pub bootstrap_service: Option<String>,
    /// Optional guest-local application health URL.
    pub health_url: Option<String>,
    /// Prefix service starts with `sudo -n`.
    pub use_sudo: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ssh_port: 2222,
            user: "vdesk".to_string(),
            identity_file: None,
            ssh_binary: "ssh".to_string(),
            vm_pidfile: None,
            vm_process_pattern: Some("qemu-system".to_string()),
            state_dir: PathBuf::from("/var/lib/vdesk"),
            log_file: None,
            max_retries: 3,
            probe_timeout_secs: 10,
            remediation_timeout_secs: 30,
            settle_secs: 5,
            lock_timeout_secs: 30,
            required_services: vec![
                "vdesk-display.service".to_string(),
                "vdesk-agent.service".to_string(),
            ],
            bootstrap_marker: "/var/lib/vdesk/bootstrap-complete".to_string(),
            bootstrap_service: None,
            health_url: None,
            use_sudo: true,
        }
    }
}

impl HealthConfig {
    /// File layer (if any), then the process environment, then validation.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let base = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.with_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|err| Error::io(format!("failed to read config {}", path.display()), err))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&data).map_err(|err| err.to_string())
        } else {
            serde_yml::from_str(&data).map_err(|err| err.to_string())
        };
        parsed.map_err(|err| {
            Error::config(
                format!("failed to parse config {}", path.display()),
                serde_json::json!({ "parse_error": err }),
            )
        })
    }

    /// Overlay `VDESK_*` keys resolved through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        env.string("HOST", &mut self.host);
        env.parse("SSH_PORT", &mut self.ssh_port)?;
        env.string("USER", &mut self.user);
        env.optional_path("IDENTITY_FILE", &mut self.identity_file);
        env.string("SSH_BINARY", &mut self.ssh_binary);
        env.optional_path("VM_PIDFILE", &mut self.vm_pidfile);
        env.optional_string("VM_PROCESS", &mut self.vm_process_pattern);
        if let Some(dir) = env.get("STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        env.optional_path("LOG_FILE", &mut self.log_file);
        env.parse("MAX_RETRIES", &mut self.max_retries)?;
        env.parse("PROBE_TIMEOUT_SECS", &mut self.probe_timeout_secs)?;
        env.parse("REMEDIATION_TIMEOUT_SECS", &mut self.remediation_timeout_secs)?;
        env.parse("SETTLE_SECS", &mut self.settle_secs)?;
        env.parse("LOCK_TIMEOUT_SECS", &mut self.lock_timeout_secs)?;
        if let Some(list) = env.get("REQUIRED_SERVICES") {
            self.required_services = split_list(&list);
        }
        env.string("BOOTSTRAP_MARKER", &mut self.bootstrap_marker);
        env.optional_string("BOOTSTRAP_SERVICE", &mut self.bootstrap_service);
        env.optional_string("HEALTH_URL", &mut self.health_url);
        if let Some(raw) = env.get("USE_SUDO") {
            self.use_sudo = parse_bool(&format!("{ENV_PREFIX}USE_SUDO"), &raw)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(invalid_key("host", "must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(invalid_key("user", "must not be empty"));
        }
        if self.max_retries == 0 {
            return Err(invalid_key("max_retries", "must be at least 1"));
        }
        for (key, value) in [
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("remediation_timeout_secs", self.remediation_timeout_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid_key(key, "must be greater than zero"));
            }
        }
        if self.required_services.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid_key("required_services", "contains an empty name"));
        }
        if self.vm_pidfile.is_none() && self.vm_process_pattern.is_none() {
            return Err(invalid_key(
                "vm_process_pattern",
                "set either vm_pidfile or vm_process_pattern",
            ));
        }
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("health.log"))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn remediation_timeout(&self) -> Duration {
        Duration::from_secs(self.remediation_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    pub listen: String,
    /// X display the input driver talks to.
    pub display: String,
    /// Connections idle longer than this are closed.
    pub idle_timeout: Duration,
    pub screenshot_dir: PathBuf,
    /// Captures smaller than this are treated as failures.
    pub min_screenshot_bytes: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8765".to_string(),
            display: ":0".to_string(),
            idle_timeout: Duration::from_secs(300),
            screenshot_dir: std::env::temp_dir(),
            min_screenshot_bytes: 1024,
        }
    }
}

impl AgentConfig {
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        env.string("AGENT_LISTEN", &mut self.listen);
        if let Some(display) = (env.lookup)("DISPLAY").filter(|v| !v.is_empty()) {
            self.display = display;
        }
        let mut idle = self.idle_timeout.as_secs();
        env.parse("AGENT_IDLE_TIMEOUT_SECS", &mut idle)?;
        self.idle_timeout = Duration::from_secs(idle);
        if let Some(dir) = env.get("SCREENSHOT_DIR") {
            self.screenshot_dir = PathBuf::from(dir);
        }
        env.parse("MIN_SCREENSHOT_BYTES", &mut self.min_screenshot_bytes)?;
        Ok(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardConfig {
    pub rules: Vec<ForwardRule>,
    pub connect_timeout: Duration,
    /// Address every local port is bound on.
    pub listen_host: String,
}

impl ForwardConfig {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(rules: Vec<ForwardRule>) -> Self {
        Self {
            rules,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            listen_host: "0.0.0.0".to_string(),
        }
    }

    #[must_use]
    pub fn with_listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some(value) = self.get(key) {
            *slot = value;
        }
    }

    fn optional_string(&self, key: &str, slot: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            *slot = Some(value);
        }
    }

    fn optional_path(&self, key: &str, slot: &mut Option<PathBuf>) {
        if let Some(value) = self.get(key) {
            *slot = Some(PathBuf::from(value));
        }
    }

    fn parse<T: FromStr>(&self, key: &str, slot: &mut T) -> Result<()> {
        if let Some(raw) = self.get(key) {
            *slot = raw.parse().map_err(|_| {
                Error::config(
                    format!("invalid value for {ENV_PREFIX}{key}"),
                    serde_json::json!({ "received": raw }),
                )
            })?;
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(
            format!("invalid boolean for {key}"),
            serde_json::json!({ "received": raw, "hint": "use true/false, yes/no or 1/0" }),
        )),
    }
}

fn invalid_key(key: &str, reason: &str) -> Error {
    Error::config(
        format!("invalid config: {key} {reason}"),
        serde_json::json!({ "key": key }),
    )
}
