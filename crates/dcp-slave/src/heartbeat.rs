//! Heartbeat supervision of the master.
//!
//! A registered master has to poll the slave with `INF_state` at least once
//! per heartbeat interval. Every `INF_state` kicks the monitor. A separate
//! thread checks the time since the last kick and calls the miss handler
//! once when the interval has been exceeded, until the monitor is reset.

use dcp_common::{SlaveError, SlaveResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Monitors the time between `INF_state` requests.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    state: Arc<HeartbeatState>,
    monitor_handle: Option<JoinHandle<()>>,
    interval: Duration,
    min_check_interval: Duration,
}

#[derive(Debug)]
struct HeartbeatState {
    /// Nanoseconds since `start_time` at the last kick.
    last_kick_ns: AtomicU64,
    start_time: Instant,
    missed: AtomicBool,
    running: AtomicBool,
    stop_requested: Mutex<bool>,
    wake: Condvar,
}

impl HeartbeatState {
    fn new() -> Self {
        Self {
            last_kick_ns: AtomicU64::new(0),
            start_time: Instant::now(),
            missed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_requested: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn kick(&self) {
        self.last_kick_ns.store(self.elapsed_ns(), Ordering::Release);
    }

    fn since_kick(&self) -> Duration {
        let last = self.last_kick_ns.load(Ordering::Acquire);
        Duration::from_nanos(self.elapsed_ns().saturating_sub(last))
    }

    /// Sleep for `period` unless a stop is requested first. Returns true if
    /// the monitor should exit.
    fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut stop = self.stop_requested.lock();
        while !*stop {
            if self.wake.wait_until(&mut stop, deadline).timed_out() {
                break;
            }
        }
        *stop
    }
}

impl HeartbeatMonitor {
    /// Create a stopped monitor for `interval`. The check period is a
    /// quarter of the interval, but never below `min_check_interval`.
    #[must_use]
    pub fn new(interval: Duration, min_check_interval: Duration) -> Self {
        Self {
            state: Arc::new(HeartbeatState::new()),
            monitor_handle: None,
            interval,
            min_check_interval,
        }
    }

    /// Start the monitor thread. `on_miss` runs on that thread, once per
    /// missed heartbeat, with the time since the last kick.
    ///
    /// # Errors
    ///
    /// Fails if the monitor already runs or the thread cannot be spawned.
    pub fn start<F>(&mut self, on_miss: F) -> SlaveResult<()>
    where
        F: Fn(Duration) + Send + 'static,
    {
        if self.is_running() {
            return Err(SlaveError::Config("heartbeat monitor already running".into()));
        }

        info!(interval_ms = self.interval.as_millis(), "Starting heartbeat monitor");

        *self.state.stop_requested.lock() = false;
        self.state.missed.store(false, Ordering::Release);
        self.state.kick();

        let state = Arc::clone(&self.state);
        let interval = self.interval;
        let check_interval = (interval / 4).max(self.min_check_interval);

        self.state.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("dcp-heartbeat".into())
            .spawn(move || {
                debug!("Heartbeat monitor thread started");

                while !state.sleep(check_interval) {
                    let since = state.since_kick();
                    if since > interval && !state.missed.swap(true, Ordering::AcqRel) {
                        warn!(
                            since_ms = since.as_millis(),
                            interval_ms = interval.as_millis(),
                            "Heartbeat missed"
                        );
                        on_miss(since);
                    }
                }

                state.running.store(false, Ordering::Release);
                debug!("Heartbeat monitor thread stopped");
            });

        match spawned {
            Ok(handle) => {
                self.monitor_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.running.store(false, Ordering::Release);
                Err(SlaveError::Spawn {
                    name: "dcp-heartbeat".into(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Record an `INF_state` from the master.
    #[inline]
    pub fn kick(&self) {
        self.state.kick();
    }

    /// Clear the miss flag and kick, keeping the thread running.
    pub fn reset(&self) {
        self.state.missed.store(false, Ordering::Release);
        self.state.kick();
        debug!("Heartbeat monitor reset");
    }

    /// Stop the monitor thread and wait for it, unless called from the
    /// monitor thread itself.
    pub fn stop(&mut self) {
        let Some(handle) = self.monitor_handle.take() else {
            return;
        };

        info!("Stopping heartbeat monitor");
        *self.state.stop_requested.lock() = true;
        self.state.wake.notify_all();

        if handle.thread().id() == thread::current().id() {
            return;
        }
        if let Err(e) = handle.join() {
            warn!("Heartbeat thread panicked: {:?}", e);
        }
    }

    /// The monitor thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
