//! vdesk CLI: keep a virtual desktop guest healthy, drive it, and reach it.
//!
//! - `health` runs one supervisor invocation and exits 0/1/2.
//! - `agent` serves the NDJSON action protocol inside the guest.
//! - `forward` relays host ports to guest ports.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes
#![allow(clippy::fn_params_excessive_bools)] // CLI flags are naturally bools

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use vdesk::agent::{ActionAgent, XdotoolDriver};
use vdesk::config::{AgentConfig, ForwardConfig, HealthConfig};
use vdesk::forward::PortForwarder;
use vdesk::health::HealthSupervisor;
use vdesk::ForwardRule;

mod logging;

use logging::Console;

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Debug, Parser)]
#[command(name = "vdesk", version, about = "Virtual desktop supervisor, action agent and relay")]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe the guest once and remediate what is safe
    ///
    /// Exits 0 when healthy, 1 while recovery is pending, 2 when an operator is needed.
    Health {
        #[arg(long, help = "YAML or JSON config file; VDESK_* variables override it")]
        config: Option<PathBuf>,
        #[arg(long, help = "Print the outcome as JSON on stdout (logs move to stderr)")]
        json: bool,
        #[arg(long, conflicts_with = "status", help = "Clear the retry counter and markers")]
        reset: bool,
        #[arg(long, help = "Print the persisted supervisor state without probing")]
        status: bool,
    },
    /// Serve the NDJSON action protocol against the guest display
    Agent {
        #[arg(long, help = "Listen address (default 0.0.0.0:8765, or VDESK_AGENT_LISTEN)")]
        listen: Option<String>,
        #[arg(long, help = "X display to drive (default $DISPLAY or :0)")]
        display: Option<String>,
        #[arg(long, help = "Directory for captured screenshots")]
        screenshot_dir: Option<PathBuf>,
    },
    /// Relay LOCAL_PORT to REMOTE_HOST:REMOTE_PORT until interrupted
    Forward {
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        #[arg(
            long = "also",
            value_name = "LOCAL:HOST:REMOTE",
            help = "Additional relay rule; may be repeated"
        )]
        also: Vec<ForwardRule>,
        #[arg(
            long,
            default_value_t = 5,
            value_parser = clap::value_parser!(u64).range(1..),
            help = "Upstream connect timeout in seconds"
        )]
        connect_timeout: u64,
        #[arg(long, default_value = "0.0.0.0", help = "Address the local ports bind on")]
        bind: String,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

/// Configure color output based on CLI flag and environment
fn configure_colors(mode: ColorMode) {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            // Respect NO_COLOR environment variable
            if std::env::var("NO_COLOR").is_ok() {
                false
            } else {
                // Check if stderr supports color (where we output diagnostics)
                supports_color::on(supports_color::Stream::Stderr).is_some()
            }
        }
    };

    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_colors(cli.color);
    match cli.command {
        Commands::Health {
            config,
            json,
            reset,
            status,
        } => {
            // Anything that stops the check from running needs an operator.
            let code = match runtime()?.block_on(cmd_health(config, json, reset, status)) {
                Ok(code) => code,
                Err(report) => {
                    eprintln!("{report:?}");
                    2
                }
            };
            std::process::exit(code);
        }
        Commands::Agent {
            listen,
            display,
            screenshot_dir,
        } => runtime()?.block_on(cmd_agent(listen, display, screenshot_dir)),
        Commands::Forward {
            local_port,
            remote_host,
            remote_port,
            also,
            connect_timeout,
            bind,
        } => {
            let mut rules = vec![ForwardRule::new(local_port, remote_host, remote_port)];
            rules.extend(also);
            let config = ForwardConfig::new(rules)
                .with_connect_timeout(Duration::from_secs(connect_timeout))
                .with_listen_host(bind);
            runtime()?.block_on(cmd_forward(config))
        }
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

/// Handle the health command. Returns the process exit code.
async fn cmd_health(config: Option<PathBuf>, json: bool, reset: bool, status: bool) -> Result<i32> {
    let config = HealthConfig::load(config.as_deref())?;
    let console = if json { Console::Stderr } else { Console::Stdout };
    logging::init("info", console, Some(&config.log_path()))?;
    let supervisor = HealthSupervisor::from_config(&config);

    if reset || status {
        let state = if reset {
            supervisor.reset().await?
        } else {
            supervisor.status().await?
        };
        emit(json, &state, || {
            format!(
                "state: {} retries: {}/{} bootstrap_done: {} bootstrap_timed_out: {}",
                state.last_state,
                state.retry_count,
                config.max_retries,
                state.bootstrap_done,
                state.bootstrap_timed_out
            )
        })?;
        return Ok(0);
    }

    match supervisor.run_once().await {
        Ok(outcome) => {
            info!(
                state = %outcome.report.state,
                exit_code = outcome.exit_code,
                retry_count = outcome.report.retry_count,
                "health check finished"
            );
            emit(json, &outcome, || {
                format!("{}: {}", outcome.report.state, outcome.report.detail)
            })?;
            Ok(outcome.exit_code)
        }
        Err(err) => {
            error!(code = %err.code, error = %err.message, "health check could not run");
            let code = err.exit_code();
            if json {
                let payload = serde_json::json!({
                    "error": {
                        "code": err.code.as_str(),
                        "message": err.message,
                        "context": err.context,
                    },
                    "exit_code": code,
                });
                println!("{payload}");
            }
            Ok(code)
        }
    }
}

/// Handle the agent command.
async fn cmd_agent(
    listen: Option<String>,
    display: Option<String>,
    screenshot_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = AgentConfig::default().with_env(|key| std::env::var(key).ok())?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if let Some(display) = display {
        config.display = display;
    }
    if let Some(dir) = screenshot_dir {
        config.screenshot_dir = dir;
    }
    logging::init("info", Console::Stdout, None)?;
    std::fs::create_dir_all(&config.screenshot_dir).into_diagnostic()?;

    let driver = Arc::new(XdotoolDriver::new(
        config.display.clone(),
        config.screenshot_dir.clone(),
    ));
    let agent = ActionAgent::new(driver, &config);
    let listener = ActionAgent::bind(&config.listen).await?;
    info!(display = %config.display, "action agent ready");
    agent.serve(listener, shutdown_signal()).await?;
    Ok(())
}

/// Handle the forward command.
async fn cmd_forward(config: ForwardConfig) -> Result<()> {
    logging::init("warn", Console::Stdout, None)?;
    let forwarder = PortForwarder::bind(&config).await?;
    forwarder.serve(shutdown_signal()).await?;
    Ok(())
}

/// Handle the completions command.
#[allow(clippy::unnecessary_wraps)] // Consistent with other command handlers
fn cmd_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    if json {
        let payload = serde_json::to_string(value).into_diagnostic()?;
        println!("{payload}");
    } else {
        eprintln!("{}", human());
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
}
