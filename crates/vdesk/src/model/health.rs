use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Guest health as derived from the first failing probe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No probe has run yet.
    #[default]
    Unknown,
    /// The VM process itself is gone.
    ProcessDown,
    /// The guest control port does not accept connections.
    PortClosed,
    /// A trivial remote command could not be executed.
    AuthFailed,
    /// The guest has not finished first-boot provisioning.
    BootstrapIncomplete,
    /// At least one required service (or the app endpoint) is down.
    ServicesDegraded,
    /// Every probe passed.
    Healthy,
    /// Remediation retries are exhausted; an operator must reset state.
    Failed,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::ProcessDown => "process_down",
            Self::PortClosed => "port_closed",
            Self::AuthFailed => "auth_failed",
            Self::BootstrapIncomplete => "bootstrap_incomplete",
            Self::ServicesDegraded => "services_degraded",
            Self::Healthy => "healthy",
            Self::Failed => "failed",
        }
    }

    /// States whose cause can be fixed by starting services on the guest.
    pub fn is_remediable(self) -> bool {
        matches!(self, Self::BootstrapIncomplete | Self::ServicesDegraded)
    }

    /// States that need manual action before anything can improve.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ProcessDown | Self::PortClosed | Self::AuthFailed | Self::Failed
        )
    }

    /// Exit code of a supervisor invocation that ends in this state.
    ///
    /// `0` healthy, `1` not ready yet (remediation outstanding), `2` terminal.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Healthy => 0,
            Self::Unknown | Self::BootstrapIncomplete | Self::ServicesDegraded => 1,
            Self::ProcessDown | Self::PortClosed | Self::AuthFailed | Self::Failed => 2,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub passed: bool,
    /// State the chain reports when this probe is the first to fail.
    pub state_if_failed: HealthState,
    pub detail: String,
}

impl ProbeOutcome {
    pub fn passed(state_if_failed: HealthState, detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            state_if_failed,
            detail: detail.into(),
        }
    }

    pub fn failed(state_if_failed: HealthState, detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            state_if_failed,
            detail: detail.into(),
        }
    }
}

/// Snapshot produced by one evaluation of the probe chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub detail: String,
    /// Milliseconds since the Unix epoch.
    pub probed_at_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_probe: Option<String>,
}

impl HealthReport {
    pub fn new(state: HealthState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: detail.into(),
            probed_at_ms: now_unix_ms(),
            retry_count: 0,
            failed_probe: None,
        }
    }

    #[must_use]
    pub fn with_failed_probe(mut self, probe: impl Into<String>) -> Self {
        self.failed_probe = Some(probe.into());
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

pub fn now_unix_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_invocation_contract() {
        assert_eq!(HealthState::Healthy.exit_code(), 0);
        assert_eq!(HealthState::BootstrapIncomplete.exit_code(), 1);
        assert_eq!(HealthState::ServicesDegraded.exit_code(), 1);
        for state in [
            HealthState::ProcessDown,
            HealthState::PortClosed,
            HealthState::AuthFailed,
            HealthState::Failed,
        ] {
            assert_eq!(state.exit_code(), 2, "{state}");
            assert!(state.is_terminal());
            assert!(!state.is_remediable());
        }
    }

    #[test]
    fn states_serialize_snake_case() {
        let json = serde_json::to_string(&HealthState::BootstrapIncomplete).unwrap();
        assert_eq!(json, "\"bootstrap_incomplete\"");
    }
}
