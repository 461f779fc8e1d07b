//! Health/bootstrap supervisor.
//!
//! One invocation of [`HealthSupervisor::run_once`]:
//!
//! 1. takes the state lock and loads the retry counter;
//! 2. if the retry budget is already spent, reports `Failed` and stops;
//! 3. evaluates the probe chain;
//! 4. for `BootstrapIncomplete`/`ServicesDegraded`, starts whatever required
//!    services are not running, waits for them to settle and probes again;
//! 5. persists the outcome and maps it onto exit codes `0`/`1`/`2`.
//!
//! `ProcessDown`, `PortClosed` and `AuthFailed` are never remediated here.

pub mod probe;
pub mod remote;
pub mod service;
pub mod state;

use crate::config::HealthConfig;
use crate::error::{Error, Result};
use crate::model::{HealthReport, HealthState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub use probe::{Probe, ProbeChain};
pub use remote::{CommandOutput, LocalExecutor, RemoteCommandExecutor, SshExecutor};
pub use service::{ServiceController, SystemdController};
pub use state::{StateGuard, StateStore, SupervisorState};

/// Knobs that shape remediation and retry accounting.
#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    pub max_retries: u32,
    pub required_services: Vec<String>,
    pub bootstrap_service: Option<String>,
    pub remediation_timeout: Duration,
    pub settle_delay: Duration,
    pub lock_timeout: Duration,
}

impl SupervisorOptions {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            required_services: config.required_services.clone(),
            bootstrap_service: config.bootstrap_service.clone(),
            remediation_timeout: config.remediation_timeout(),
            settle_delay: config.settle_delay(),
            lock_timeout: config.lock_timeout(),
        }
    }
}

/// What one remediation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RemediationSummary {
    pub started: Vec<String>,
    pub already_active: Vec<String>,
    pub failed: Vec<String>,
}

/// Result of a full invocation.
#[derive(Clone, Debug, Serialize)]
pub struct SupervisorOutcome {
    pub report: HealthReport,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<RemediationSummary>,
}

impl SupervisorOutcome {
    fn new(report: HealthReport, remediation: Option<RemediationSummary>) -> Self {
        Self {
            exit_code: report.state.exit_code(),
            report,
            remediation,
        }
    }
}

pub struct HealthSupervisor {
    chain: ProbeChain,
    services: Arc<dyn ServiceController>,
    store: StateStore,
    options: SupervisorOptions,
}

impl HealthSupervisor {
    pub fn new(
        chain: ProbeChain,
        services: Arc<dyn ServiceController>,
        store: StateStore,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            chain,
            services,
            store,
            options,
        }
    }

    /// Wire the production collaborators: ssh to the guest, systemd on the
    /// guest, local process table, state under `state_dir`.
    pub fn from_config(config: &HealthConfig) -> Self {
        let remote: Arc<dyn RemoteCommandExecutor> = Arc::new(SshExecutor::from_config(config));
        let local: Arc<dyn RemoteCommandExecutor> = Arc::new(LocalExecutor);
        let services: Arc<dyn ServiceController> = Arc::new(SystemdController::new(
            remote.clone(),
            config.probe_timeout(),
            config.use_sudo,
        ));
        let chain = ProbeChain::standard(config, remote, local, services.clone());
        Self::new(
            chain,
            services,
            StateStore::new(config.state_dir.clone()),
            SupervisorOptions::from_config(config),
        )
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Evaluate the probe chain without touching persisted state.
    pub async fn run_check(&self) -> HealthReport {
        self.chain.evaluate().await
    }

    /// Start-if-not-running for every service `state` calls for.
    ///
    /// Only `BootstrapIncomplete` and `ServicesDegraded` are accepted.
    pub async fn remediate(&self, state: HealthState) -> Result<RemediationSummary> {
        if !state.is_remediable() {
            return Err(Error::new(
                crate::error::ErrorCode::Internal,
                format!("state {state} is not remediable"),
                None,
            ));
        }
        let mut targets: Vec<&str> = Vec::new();
        if state == HealthState::BootstrapIncomplete {
            if let Some(unit) = &self.options.bootstrap_service {
                targets.push(unit);
            }
        }
        targets.extend(self.options.required_services.iter().map(String::as_str));

        let mut summary = RemediationSummary::default();
        for service in targets {
            match self.ensure_started(service).await {
                Ok(true) => summary.started.push(service.to_string()),
                Ok(false) => summary.already_active.push(service.to_string()),
                Err(err) => {
                    warn!(service, error = %err, "service start failed");
                    summary.failed.push(service.to_string());
                }
            }
        }
        info!(
            started = ?summary.started,
            already_active = ?summary.already_active,
            failed = ?summary.failed,
            "remediation pass finished"
        );
        Ok(summary)
    }

    /// Returns `true` when a start was issued.
    async fn ensure_started(&self, service: &str) -> Result<bool> {
        let limit = self.options.remediation_timeout;
        let step = async {
            if self.services.is_active(service).await? {
                return Ok(false);
            }
            info!(service, "starting service");
            self.services.start(service).await?;
            Ok::<bool, Error>(true)
        };
        tokio::time::timeout(limit, step).await.map_err(|_| {
            Error::timeout(
                format!("starting {service} timed out"),
                serde_json::json!({ "timeout_secs": limit.as_secs() }),
            )
        })?
    }

    /// One full supervisor invocation.
    pub async fn run_once(&self) -> Result<SupervisorOutcome> {
        let max = self.options.max_retries;
        let guard = self.store.lock(self.options.lock_timeout).await?;
        let mut state = guard.load(max)?;

        if state.retries_exhausted(max) {
            let report = HealthReport::new(
                HealthState::Failed,
                format!(
                    "retry budget exhausted ({}/{max}); operator reset required",
                    state.retry_count
                ),
            )
            .with_retry_count(state.retry_count);
            error!(
                retry_count = state.retry_count,
                max_retries = max,
                "supervisor gave up, not remediating"
            );
            state.retry_count = state.retry_count.min(max);
            state.bootstrap_timed_out = true;
            state.record(report.state, &report.detail);
            guard.save(&state)?;
            return Ok(SupervisorOutcome::new(report, None));
        }

        let report = self.run_check().await;
        if report.state == HealthState::Healthy {
            state.mark_healthy(&report.detail);
            guard.save(&state)?;
            info!("guest healthy");
            return Ok(SupervisorOutcome::new(report.with_retry_count(0), None));
        }
        if !report.state.is_remediable() {
            error!(
                state = %report.state,
                detail = %report.detail,
                "guest needs manual intervention"
            );
            state.record(report.state, &report.detail);
            guard.save(&state)?;
            let retries = state.retry_count;
            return Ok(SupervisorOutcome::new(report.with_retry_count(retries), None));
        }

        warn!(state = %report.state, detail = %report.detail, "remediating guest");
        let summary = self.remediate(report.state).await?;
        if !self.options.settle_delay.is_zero() {
            tokio::time::sleep(self.options.settle_delay).await;
        }
        let after = self.run_check().await;

        if after.state == HealthState::Healthy {
            state.mark_healthy(&after.detail);
            guard.save(&state)?;
            info!("guest healthy after remediation");
            return Ok(SupervisorOutcome::new(after.with_retry_count(0), Some(summary)));
        }

        let exhausted = state.record_failed_attempt(max);
        let final_report = (if exhausted {
            error!(
                retry_count = state.retry_count,
                detail = %after.detail,
                "remediation retries exhausted"
            );
            HealthReport {
                state: HealthState::Failed,
                detail: format!("remediation failed {} times: {}", state.retry_count, after.detail),
                ..after
            }
        } else {
            warn!(
                retry_count = state.retry_count,
                max_retries = max,
                state = %after.state,
                "remediation did not restore health"
            );
            after
        })
        .with_retry_count(state.retry_count);
        state.record(final_report.state, &final_report.detail);
        guard.save(&state)?;
        Ok(SupervisorOutcome::new(final_report, Some(summary)))
    }

    /// Operator reset: zero the counter and clear both markers.
    pub async fn reset(&self) -> Result<SupervisorState> {
        let guard = self.store.lock(self.options.lock_timeout).await?;
        let mut state = SupervisorState::fresh(self.options.max_retries);
        state.record(HealthState::Unknown, "reset by operator");
        guard.save(&state)?;
        info!(dir = %self.store.dir().display(), "supervisor state reset");
        Ok(state)
    }

    pub async fn status(&self) -> Result<SupervisorState> {
        let guard = self.store.lock(self.options.lock_timeout).await?;
        guard.load(self.options.max_retries)
    }
}
