//! DCP slave daemon entry point.
//!
//! Loads a slave description, serves it to a DCP master over UDP and
//! reports its health until a shutdown signal arrives.

mod diagnostics;
mod signals;
mod udp;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dcp_codec::decode_frame;
use dcp_common::RuntimeConfig;
use dcp_slave::{DcpSlave, SlaveDescription};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::diagnostics::{status_json, DiagnosticsCollector, DiagnosticsState};
use crate::signals::SignalHandler;
use crate::udp::{Datagram, UdpDriver};

/// DCP daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "dcp-daemon",
    about = "DCP slave daemon - serves a slave description to a DCP master over UDP",
    version,
    long_about = None
)]
struct Args {
    /// Path to a runtime configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the slave description (overrides config file).
    #[arg(long, short = 'd', value_name = "FILE")]
    description: Option<PathBuf>,

    /// Control channel address (overrides config file).
    #[arg(long, short = 'b', value_name = "ADDR")]
    bind: Option<String>,

    /// Interval between status reports, e.g. "30s" (0s disables them).
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    status_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting DCP daemon");

    let mut config = load_config(args.config.as_deref())?;
    if let Some(description) = &args.description {
        config.description = Some(description.clone());
    }
    if let Some(bind) = &args.bind {
        config.transport.bind.clone_from(bind);
    }

    let Some(description_path) = config.description.clone() else {
        bail!("No slave description given (use --description or set `description` in the config)");
    };
    let description = SlaveDescription::from_file(&description_path)
        .with_context(|| format!("Failed to load slave description {description_path:?}"))?;
    info!(
        name = %description.dcp_slave_name,
        uuid = %description.uuid,
        op_mode = ?description.op_mode,
        "Slave description loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    let diag_state = Arc::new(DiagnosticsState::new());
    let diagnostics = DiagnosticsCollector::new(Arc::clone(&diag_state));

    let (driver, inbox) = UdpDriver::bind(&config.transport, diag_state)
        .with_context(|| format!("Failed to bind {}", config.transport.bind))?;
    let local = driver.local_addr().context("Control socket has no address")?;

    let read_timeout = config.transport.read_timeout;
    let slave = DcpSlave::new(description, driver, config).context("Failed to create slave")?;
    slave.set_error_listener(|code| warn!(?code, "Slave reported an error"));
    slave.set_missed_listener(|channel| warn!(?channel, "PDUs lost"));
    info!(%local, state = %slave.state(), "Waiting for a master");

    run_daemon(
        &slave,
        &inbox,
        &signal_handler,
        &diagnostics,
        read_timeout,
        args.status_interval,
    )
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("dcp_daemon={level},dcp_slave={level},dcp_codec={level},dcp_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `DCP_CONFIG_PATH` environment variable
/// 3. `/etc/dcp/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(cli_path: Option<&Path>) -> Result<RuntimeConfig> {
    if let Some(config_path) = cli_path {
        info!(?config_path, "Loading config from command-line argument");
        return RuntimeConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("DCP_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from DCP_CONFIG_PATH");
            return RuntimeConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from DCP_CONFIG_PATH={env_path:?}"));
        }
        warn!(
            path = %env_path,
            "DCP_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for candidate in ["/etc/dcp/config.toml", "config/default.toml"] {
        let config_path = Path::new(candidate);
        if config_path.exists() {
            info!(?config_path, "Loading config");
            return RuntimeConfig::from_file(config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(RuntimeConfig::default())
}

/// Feed received datagrams into the slave until shutdown.
fn run_daemon(
    slave: &DcpSlave<UdpDriver>,
    inbox: &Receiver<Datagram>,
    signal_handler: &SignalHandler,
    diagnostics: &DiagnosticsCollector,
    poll: Duration,
    status_interval: Duration,
) -> Result<()> {
    let mut last_status = Instant::now();

    while !signal_handler.shutdown_requested() {
        match inbox.recv_timeout(poll) {
            Ok(datagram) => {
                let accepted = decode_frame(&datagram.bytes)
                    .map_err(|e| e.to_string())
                    .and_then(|pdu| slave.receive(pdu).map_err(|e| e.to_string()));
                if let Err(reason) = accepted {
                    diagnostics.state().record_rejected();
                    debug!(from = %datagram.from, %reason, "Datagram dropped");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("All transport readers stopped");
                break;
            }
        }

        let periodic = !status_interval.is_zero() && last_status.elapsed() >= status_interval;
        if periodic || signal_handler.take_status_request() {
            let snapshot = diagnostics.snapshot(slave.state(), slave.metrics());
            info!(status = %status_json(&snapshot), "Status");
            last_status = Instant::now();
        }
    }

    info!("Shutting down...");
    if slave.stop() {
        info!("Simulation stopped");
    }
    slave.shutdown();

    let snapshot = diagnostics.snapshot(slave.state(), slave.metrics());
    info!(
        received = snapshot.received,
        rejected = snapshot.rejected,
        sent = snapshot.sent,
        steps = snapshot.steps.total_steps,
        signals = signal_handler.state().signal_count(),
        uptime_secs = snapshot.uptime.as_secs(),
        final_state = %snapshot.state,
        "Daemon shutdown complete"
    );

    Ok(())
}
