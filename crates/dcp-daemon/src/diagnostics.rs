//! Diagnostics for the DCP daemon.
//!
//! Counts datagrams in and out and condenses the slave state into a health
//! value for the periodic status line and the final report.

use dcp_common::{DcpState, StepMetricsSnapshot};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health of the slave as seen by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Registered and operating normally.
    Healthy,
    /// Realtime steps overrun their period too often.
    Degraded,
    /// The slave is handling or has resolved an error.
    Unhealthy,
    /// Waiting for a master to register.
    Idle,
    /// Stopping or stopped.
    Stopped,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Idle => write!(f, "idle"),
            HealthStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of daemon diagnostics.
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    /// Health derived from state and step metrics.
    pub health: HealthStatus,
    /// Slave state.
    pub state: DcpState,
    /// Datagrams received on any socket.
    pub received: u64,
    /// Datagrams that did not decode.
    pub rejected: u64,
    /// Datagrams sent.
    pub sent: u64,
    /// Failed sends.
    pub send_errors: u64,
    /// Uptime since daemon start.
    pub uptime: Duration,
    /// Realtime step timing.
    pub steps: StepMetricsSnapshot,
}

/// Counters shared between the receive loop and the UDP driver.
#[derive(Debug)]
pub struct DiagnosticsState {
    received: AtomicU64,
    rejected: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
    start_time: Instant,
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsState {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count a received datagram.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a datagram that was not a valid PDU.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a send attempt.
    pub fn record_sent(&self, ok: bool) {
        if ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Datagrams received.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Datagrams rejected.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Datagrams sent.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Failed sends.
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Time since daemon start.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Builds snapshots from the shared counters.
pub struct DiagnosticsCollector {
    state: Arc<DiagnosticsState>,
}

impl DiagnosticsCollector {
    /// Create a collector over `state`.
    pub fn new(state: Arc<DiagnosticsState>) -> Self {
        Self { state }
    }

    /// Health for a slave in `state` with the given step metrics.
    pub fn health(&self, state: DcpState, steps: &StepMetricsSnapshot) -> HealthStatus {
        match state {
            DcpState::Alive => HealthStatus::Idle,
            DcpState::ErrorHandling | DcpState::ErrorResolved => HealthStatus::Unhealthy,
            DcpState::Stopping | DcpState::Stopped => HealthStatus::Stopped,
            _ => {
                // more than 1% overruns
                if steps.total_steps > 0 && steps.overrun_count * 100 > steps.total_steps {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }

    /// Snapshot the counters together with the slave's view.
    pub fn snapshot(&self, state: DcpState, steps: StepMetricsSnapshot) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            health: self.health(state, &steps),
            state,
            received: self.state.received(),
            rejected: self.state.rejected(),
            sent: self.state.sent(),
            send_errors: self.state.send_errors(),
            uptime: self.state.uptime(),
            steps,
        }
    }

    /// Shared counters.
    pub fn state(&self) -> &Arc<DiagnosticsState> {
        &self.state
    }
}

/// Render a snapshot as a JSON status document.
pub fn status_json(snapshot: &DiagnosticsSnapshot) -> Value {
    json!({
        "health": snapshot.health.to_string(),
        "state": snapshot.state.to_string(),
        "uptime_secs": snapshot.uptime.as_secs(),
        "datagrams": {
            "received": snapshot.received,
            "rejected": snapshot.rejected,
            "sent": snapshot.sent,
            "send_errors": snapshot.send_errors,
        },
        "steps": {
            "total": snapshot.steps.total_steps,
            "overruns": snapshot.steps.overrun_count,
            "period_ns": snapshot.steps.period_ns,
            "mean_ns": snapshot.steps.mean_ns,
            "max_ns": snapshot.steps.max_ns,
        },
    })
}
