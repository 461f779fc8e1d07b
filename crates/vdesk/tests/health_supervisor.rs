// Test module - relaxed lint rules
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]

use std::sync::Arc;

use tokio::net::TcpListener;
use vdesk::config::HealthConfig;
use vdesk::health::{HealthSupervisor, ProbeChain, StateStore, SupervisorOptions};
use vdesk::HealthState;
use vdesk_fixtures::{temp_dir, FakeServices, HealthConfigBuilder, ScriptedExecutor};

const BOOTSTRAP: &str = "vdesk-bootstrap.service";
const DISPLAY: &str = "vdesk-display.service";
const AGENT: &str = "vdesk-agent.service";

struct Harness {
    supervisor: HealthSupervisor,
    remote: Arc<ScriptedExecutor>,
    local: Arc<ScriptedExecutor>,
    services: Arc<FakeServices>,
    config: HealthConfig,
    // Keeps the guest "control port" open for the port probe.
    _listener: TcpListener,
}

async fn harness(
    configure: impl FnOnce(HealthConfigBuilder) -> HealthConfigBuilder,
    remote: ScriptedExecutor,
    local: ScriptedExecutor,
    services: FakeServices,
) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = temp_dir("health");
    let config = configure(HealthConfigBuilder::new(&dir).with_ssh_port(port)).build();
    build(config, Arc::new(remote), Arc::new(local), Arc::new(services), listener)
}

fn build(
    config: HealthConfig,
    remote: Arc<ScriptedExecutor>,
    local: Arc<ScriptedExecutor>,
    services: Arc<FakeServices>,
    listener: TcpListener,
) -> Harness {
    let chain = ProbeChain::standard(&config, remote.clone(), local.clone(), services.clone());
    let supervisor = HealthSupervisor::new(
        chain,
        services.clone(),
        StateStore::new(config.state_dir.clone()),
        SupervisorOptions::from_config(&config),
    );
    Harness {
        supervisor,
        remote,
        local,
        services,
        config,
        _listener: listener,
    }
}

#[tokio::test]
async fn missing_vm_process_is_terminal_and_not_remediated() {
    let h = harness(
        |b| b,
        ScriptedExecutor::new(),
        ScriptedExecutor::new().respond("pgrep", 1, ""),
        FakeServices::new(),
    )
    .await;

    let outcome = h.supervisor.run_once().await.unwrap();

    assert_eq!(outcome.report.state, HealthState::ProcessDown);
    assert_eq!(outcome.report.failed_probe.as_deref(), Some("process"));
    assert_eq!(outcome.exit_code, 2);
    assert!(outcome.remediation.is_none());
    assert!(h.services.starts().is_empty());
    // Short-circuit: nothing after the process probe touched the guest.
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn incomplete_bootstrap_is_remediated_to_healthy() {
    let remote = Arc::new(ScriptedExecutor::new().respond("test -f", 1, ""));
    let marker = Arc::clone(&remote);
    let services = FakeServices::new().on_start(BOOTSTRAP, move || marker.set("test -f", 0, ""));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = HealthConfigBuilder::new(&temp_dir("bootstrap"))
        .with_ssh_port(port)
        .build();
    let h = build(
        config,
        remote,
        Arc::new(ScriptedExecutor::new()),
        Arc::new(services),
        listener,
    );

    let outcome = h.supervisor.run_once().await.unwrap();

    assert_eq!(outcome.report.state, HealthState::Healthy);
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.report.retry_count, 0);
    assert_eq!(h.services.starts(), vec![BOOTSTRAP, DISPLAY, AGENT]);
    let summary = outcome.remediation.unwrap();
    assert_eq!(summary.started.len(), 3);
    assert!(summary.failed.is_empty());

    let state = h.supervisor.status().await.unwrap();
    assert_eq!(state.retry_count, 0);
    assert!(state.bootstrap_done);
    assert!(!state.bootstrap_timed_out);
    assert_eq!(state.last_state, HealthState::Healthy);
}

#[tokio::test]
async fn remediation_only_starts_inactive_services() {
    let h = harness(
        |b| b,
        ScriptedExecutor::new(),
        ScriptedExecutor::new(),
        FakeServices::new().with_active(&[DISPLAY]),
    )
    .await;

    let outcome = h.supervisor.run_once().await.unwrap();

    assert_eq!(outcome.report.state, HealthState::Healthy);
    assert_eq!(h.services.starts(), vec![AGENT]);
    let summary = outcome.remediation.unwrap();
    assert_eq!(summary.already_active, vec![DISPLAY.to_string()]);
}

#[tokio::test]
async fn unrecovered_services_count_retries_until_failed() {
    let h = harness(
        |b| b.with_max_retries(2),
        ScriptedExecutor::new(),
        ScriptedExecutor::new(),
        FakeServices::new().with_active(&[DISPLAY]).with_broken(AGENT),
    )
    .await;

    let first = h.supervisor.run_once().await.unwrap();
    assert_eq!(first.report.state, HealthState::ServicesDegraded);
    assert_eq!(first.exit_code, 1);
    assert_eq!(first.report.retry_count, 1);

    let second = h.supervisor.run_once().await.unwrap();
    assert_eq!(second.report.state, HealthState::Failed);
    assert_eq!(second.exit_code, 2);
    assert_eq!(second.report.retry_count, 2);

    let state = h.supervisor.status().await.unwrap();
    assert_eq!(state.retry_count, 2);
    assert!(state.bootstrap_timed_out);
}

#[tokio::test]
async fn exhausted_budget_reports_failed_without_probing_or_remediating() {
    let h = harness(
        |b| b.with_max_retries(1),
        ScriptedExecutor::new(),
        ScriptedExecutor::new(),
        FakeServices::new().with_broken(DISPLAY).with_broken(AGENT),
    )
    .await;

    let first = h.supervisor.run_once().await.unwrap();
    assert_eq!(first.report.state, HealthState::Failed);
    let starts_before = h.services.starts().len();
    let remote_before = h.remote.calls().len();
    let local_before = h.local.calls().len();

    let again = h.supervisor.run_once().await.unwrap();

    assert_eq!(again.report.state, HealthState::Failed);
    assert_eq!(again.exit_code, 2);
    assert!(again.remediation.is_none());
    assert_eq!(h.services.starts().len(), starts_before);
    assert_eq!(h.remote.calls().len(), remote_before);
    assert_eq!(h.local.calls().len(), local_before);
    assert!(again.report.retry_count <= h.config.max_retries);
}

#[tokio::test]
async fn operator_reset_reenables_remediation() {
    let h = harness(
        |b| b.with_max_retries(1),
        ScriptedExecutor::new(),
        ScriptedExecutor::new(),
        FakeServices::new().with_active(&[DISPLAY]).with_broken(AGENT),
    )
    .await;
    assert_eq!(
        h.supervisor.run_once().await.unwrap().report.state,
        HealthState::Failed
    );

    let state = h.supervisor.reset().await.unwrap();
    assert_eq!(state.retry_count, 0);
    assert!(!state.bootstrap_timed_out);

    let starts_before = h.services.starts().len();
    let outcome = h.supervisor.run_once().await.unwrap();
    assert!(outcome.remediation.is_some());
    assert!(h.services.starts().len() > starts_before);
}

#[tokio::test]
async fn healthy_run_clears_previous_failures() {
    let h = harness(
        |b| b,
        ScriptedExecutor::new(),
        ScriptedExecutor::new(),
        FakeServices::new().with_active(&[DISPLAY, AGENT]),
    )
    .await;
    {
        let store = StateStore::new(h.config.state_dir.clone());
        let guard = store.lock(h.config.lock_timeout()).await.unwrap();
        let mut state = guard.load(h.config.max_retries).unwrap();
        state.retry_count = 2;
        state.bootstrap_timed_out = true;
        guard.save(&state).unwrap();
    }

    let outcome = h.supervisor.run_once().await.unwrap();

    assert_eq!(outcome.report.state, HealthState::Healthy);
    assert!(outcome.remediation.is_none());
    let state = h.supervisor.status().await.unwrap();
    assert_eq!(state.retry_count, 0);
    assert!(!state.bootstrap_timed_out);
    assert!(state.bootstrap_done);
}

#[tokio::test]
async fn failed_remote_exec_stops_the_chain() {
    let h = harness(
        |b| b,
        ScriptedExecutor::new().respond("echo", 255, ""),
        ScriptedExecutor::new(),
        FakeServices::new(),
    )
    .await;

    let report = h.supervisor.run_check().await;

    assert_eq!(report.state, HealthState::AuthFailed);
    assert_eq!(report.failed_probe.as_deref(), Some("remote_exec"));
    assert_eq!(h.remote.count("test -f"), 0);
    assert!(h.services.starts().is_empty());
}

#[tokio::test]
async fn closed_control_port_reports_port_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let config = HealthConfigBuilder::new(&temp_dir("port"))
        .with_ssh_port(port)
        .build();
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let h = build(
        config,
        Arc::new(ScriptedExecutor::new()),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(FakeServices::new()),
        placeholder,
    );

    let outcome = h.supervisor.run_once().await.unwrap();

    assert_eq!(outcome.report.state, HealthState::PortClosed);
    assert_eq!(outcome.exit_code, 2);
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn hung_probe_times_out_with_its_failure_state() {
    let h = harness(
        |b| b,
        ScriptedExecutor::new().hang("test -f"),
        ScriptedExecutor::new(),
        FakeServices::new(),
    )
    .await;

    let report = h.supervisor.run_check().await;

    assert_eq!(report.state, HealthState::BootstrapIncomplete);
    assert_eq!(report.failed_probe.as_deref(), Some("bootstrap_marker"));
    assert!(report.detail.contains("timed out"), "{}", report.detail);
}

#[tokio::test]
async fn endpoint_probe_runs_last_and_degrades_services() {
    let h = harness(
        |b| b.with_health_url("http://127.0.0.1:8765/health"),
        ScriptedExecutor::new().respond("curl", 22, ""),
        ScriptedExecutor::new(),
        FakeServices::new().with_active(&[DISPLAY, AGENT]),
    )
    .await;

    let report = h.supervisor.run_check().await;

    assert_eq!(report.state, HealthState::ServicesDegraded);
    assert_eq!(report.failed_probe.as_deref(), Some("endpoint"));
}

#[test]
fn standard_chain_runs_probes_in_fixed_order() {
    let config = HealthConfigBuilder::new(&temp_dir("order"))
        .with_health_url("http://127.0.0.1/health")
        .build();
    let chain = ProbeChain::standard(
        &config,
        Arc::new(ScriptedExecutor::new()),
        Arc::new(ScriptedExecutor::new()),
        Arc::new(FakeServices::new()),
    );
    assert_eq!(
        chain.names(),
        vec!["process", "port", "remote_exec", "bootstrap_marker", "services", "endpoint"]
    );
}
