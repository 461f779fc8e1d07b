//! Ordered, short-circuiting probe chain.
//!
//! Each [`Probe`] answers one question about the guest and names the state to
//! report when it is the first to fail. [`ProbeChain`] runs them in order,
//! each under its own ceiling, and stops at the first failure.

use super::remote::{shell_quote, RemoteCommandExecutor};
use super::service::ServiceController;
use crate::config::HealthConfig;
use crate::model::{HealthReport, HealthState, ProbeOutcome};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

const ECHO_TOKEN: &str = "vdesk-ok";

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// State reported when this probe fails or times out.
    fn failure_state(&self) -> HealthState;

    /// Ceiling for one `check`, given the chain default.
    fn timeout(&self, default: Duration) -> Duration {
        default
    }

    async fn check(&self) -> ProbeOutcome;
}

pub struct ProbeChain {
    probes: Vec<Box<dyn Probe>>,
    timeout: Duration,
}

impl ProbeChain {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            timeout,
        }
    }

    #[must_use]
    pub fn with(mut self, probe: impl Probe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }

    /// Process, port, remote exec, bootstrap marker, services, and the
    /// endpoint probe when `health_url` is set.
    pub fn standard(
        config: &HealthConfig,
        remote: Arc<dyn RemoteCommandExecutor>,
        local: Arc<dyn RemoteCommandExecutor>,
        services: Arc<dyn ServiceController>,
    ) -> Self {
        let timeout = config.probe_timeout();
        let mut chain = Self::new(timeout)
            .with(ProcessProbe {
                pidfile: config.vm_pidfile.clone(),
                pattern: config.vm_process_pattern.clone(),
                local,
                timeout,
            })
            .with(PortProbe::new(config.host.clone(), config.ssh_port))
            .with(RemoteExecProbe {
                executor: remote.clone(),
                timeout,
            })
            .with(BootstrapMarkerProbe {
                executor: remote.clone(),
                marker: config.bootstrap_marker.clone(),
                timeout,
            })
            .with(ServicesProbe {
                controller: services,
                services: config.required_services.clone(),
            });
        if let Some(url) = &config.health_url {
            chain = chain.with(EndpointProbe {
                executor: remote,
                url: url.clone(),
                timeout,
            });
        }
        chain
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|probe| probe.name()).collect()
    }

    pub async fn evaluate(&self) -> HealthReport {
        for probe in &self.probes {
            let limit = probe.timeout(self.timeout);
            let outcome = match tokio::time::timeout(limit, probe.check()).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::failed(
                    probe.failure_state(),
                    format!("{} probe timed out after {}s", probe.name(), limit.as_secs_f64()),
                ),
            };
            debug!(
                probe = probe.name(),
                passed = outcome.passed,
                detail = %outcome.detail,
                "probe finished"
            );
            if !outcome.passed {
                info!(
                    probe = probe.name(),
                    state = %outcome.state_if_failed,
                    detail = %outcome.detail,
                    "probe chain stopped"
                );
                return HealthReport::new(outcome.state_if_failed, outcome.detail)
                    .with_failed_probe(probe.name());
            }
        }
        HealthReport::new(HealthState::Healthy, "all probes passed")
    }
}

/// Is the VM process alive on this host.
pub struct ProcessProbe {
    pub pidfile: Option<PathBuf>,
    pub pattern: Option<String>,
    pub local: Arc<dyn RemoteCommandExecutor>,
    pub timeout: Duration,
}

impl ProcessProbe {
    fn check_pidfile(path: &Path) -> ProbeOutcome {
        let fail = |detail: String| ProbeOutcome::failed(HealthState::ProcessDown, detail);
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => return fail(format!("cannot read pidfile {}: {err}", path.display())),
        };
        let Ok(pid) = raw.trim().parse::<i32>() else {
            return fail(format!("pidfile {} holds no pid", path.display()));
        };
        if pid <= 0 {
            return fail(format!("pidfile {} holds invalid pid {pid}", path.display()));
        }
        match kill(Pid::from_raw(pid), None) {
            // EPERM: the process exists but belongs to someone else.
            Ok(()) | Err(Errno::EPERM) => {
                ProbeOutcome::passed(HealthState::ProcessDown, format!("vm pid {pid} alive"))
            }
            Err(err) => fail(format!("vm pid {pid} not running ({err})")),
        }
    }
}

#[async_trait]
impl Probe for ProcessProbe {
    fn name(&self) -> &'static str {
        "process"
    }

    fn failure_state(&self) -> HealthState {
        HealthState::ProcessDown
    }

    async fn check(&self) -> ProbeOutcome {
        if let Some(pidfile) = &self.pidfile {
            return Self::check_pidfile(pidfile);
        }
        let Some(pattern) = &self.pattern else {
            return ProbeOutcome::failed(
                HealthState::ProcessDown,
                "no vm process selector configured",
            );
        };
        // exec so the shell's own command line cannot match the pattern.
        let command = format!("exec pgrep -f -- {}", shell_quote(pattern));
        match self.local.run(&command, self.timeout).await {
            Ok(output) if output.success() => ProbeOutcome::passed(
                HealthState::ProcessDown,
                format!("vm process matching '{pattern}' alive"),
            ),
            Ok(_) => ProbeOutcome::failed(
                HealthState::ProcessDown,
                format!("no process matches '{pattern}'"),
            ),
            Err(err) => ProbeOutcome::failed(HealthState::ProcessDown, err.to_string()),
        }
    }
}

/// Does the guest control port accept TCP connections.
pub struct PortProbe {
    host: String,
    port: u16,
}

impl PortProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Probe for PortProbe {
    fn name(&self) -> &'static str {
        "port"
    }

    fn failure_state(&self) -> HealthState {
        HealthState::PortClosed
    }

    async fn check(&self) -> ProbeOutcome {
        match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(_) => ProbeOutcome::passed(
                HealthState::PortClosed,
                format!("{}:{} open", self.host, self.port),
            ),
            Err(err) => ProbeOutcome::failed(
                HealthState::PortClosed,
                format!("{}:{} closed: {err}", self.host, self.port),
            ),
        }
    }
}

/// Can a trivial command be run on the guest and its stdout observed.
pub struct RemoteExecProbe {
    pub executor: Arc<dyn RemoteCommandExecutor>,
    pub timeout: Duration,
}

#[async_trait]
impl Probe for RemoteExecProbe {
    fn name(&self) -> &'static str {
        "remote_exec"
    }

    fn failure_state(&self) -> HealthState {
        HealthState::AuthFailed
    }

    async fn check(&self) -> ProbeOutcome {
        let command = format!("echo {ECHO_TOKEN}");
        match self.executor.run(&command, self.timeout).await {
            Ok(output) if output.success() && output.stdout.trim() == ECHO_TOKEN => {
                ProbeOutcome::passed(HealthState::AuthFailed, "remote exec ok")
            }
            Ok(output) => ProbeOutcome::failed(
                HealthState::AuthFailed,
                format!(
                    "remote exec exited {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ),
            Err(err) => ProbeOutcome::failed(HealthState::AuthFailed, err.to_string()),
        }
    }
}

/// Has first-boot provisioning written its marker.
pub struct BootstrapMarkerProbe {
    pub executor: Arc<dyn RemoteCommandExecutor>,
    pub marker: String,
    pub timeout: Duration,
}

#[async_trait]
impl Probe for BootstrapMarkerProbe {
    fn name(&self) -> &'static str {
        "bootstrap_marker"
    }

    fn failure_state(&self) -> HealthState {
        HealthState::BootstrapIncomplete
    }

    async fn check(&self) -> ProbeOutcome {
        let command = format!("test -f {}", shell_quote(&self.marker));
        match self.executor.run(&command, self.timeout).await {
            Ok(output) if output.success() => ProbeOutcome::passed(
                HealthState::BootstrapIncomplete,
                format!("bootstrap marker {} present", self.marker),
            ),
            Ok(_) => ProbeOutcome::failed(
                HealthState::BootstrapIncomplete,
                format!("bootstrap marker {} absent", self.marker),
            ),
            Err(err) => ProbeOutcome::failed(HealthState::BootstrapIncomplete, err.to_string()),
        }
    }
}

/// Is every required service active.
pub struct ServicesProbe {
    pub controller: Arc<dyn ServiceController>,
    pub services: Vec<String>,
}

#[async_trait]
impl Probe for ServicesProbe {
    fn name(&self) -> &'static str {
        "services"
    }

    fn failure_state(&self) -> HealthState {
        HealthState::ServicesDegraded
    }

    fn timeout(&self, default: Duration) -> Duration {
        let count = u32::try_from(self.services.len()).unwrap_or(u32::MAX).max(1);
        default.saturating_mul(count)
    }

    async fn check(&self) -> ProbeOutcome {
        let mut inactive = Vec::new();
        for service in &self.services {
            match self.controller.is_active(service).await {
                Ok(true) => {}
                Ok(false) => inactive.push(service.clone()),
                Err(err) => inactive.push(format!("{service} ({err})")),
            }
        }
        if inactive.is_empty() {
            ProbeOutcome::passed(
                HealthState::ServicesDegraded,
                format!("{} services active", self.services.len()),
            )
        } else {
            ProbeOutcome::failed(
                HealthState::ServicesDegraded,
                format!("inactive services: {}", inactive.join(", ")),
            )
        }
    }
}

/// Does the guest-local application endpoint answer.
pub struct EndpointProbe {
    pub executor: Arc<dyn RemoteCommandExecutor>,
    pub url: String,
    pub timeout: Duration,
}

#[async_trait]
impl Probe for EndpointProbe {
    fn name(&self) -> &'static str {
        "endpoint"
    }

    fn failure_state(&self) -> HealthState {
        HealthState::ServicesDegraded
    }

    async fn check(&self) -> ProbeOutcome {
        let command = format!(
            "curl -fsS -o /dev/null --max-time {} {}",
            self.timeout.as_secs().max(1),
            shell_quote(&self.url)
        );
        match self.executor.run(&command, self.timeout).await {
            Ok(output) if output.success() => ProbeOutcome::passed(
                HealthState::ServicesDegraded,
                format!("{} answered", self.url),
            ),
            Ok(output) => ProbeOutcome::failed(
                HealthState::ServicesDegraded,
                format!("{} unhealthy: {}", self.url, output.stderr.trim()),
            ),
            Err(err) => ProbeOutcome::failed(HealthState::ServicesDegraded, err.to_string()),
        }
    }
}
