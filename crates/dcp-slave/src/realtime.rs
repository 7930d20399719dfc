//! Real-time stepping for SRT and HRT op modes.
//!
//! Once `STC_run` arrives the slave steps on its own clock: one step per
//! time resolution, paced against absolute deadlines so that jitter does
//! not accumulate. All waits are cancellable so that a stop or an error
//! ends the loop promptly.
//!
//! The loop itself is generic over a [`RealtimeTask`], which performs one
//! step and decides whether the loop continues.

use dcp_common::{OverrunPolicy, RealtimeConfig, SlaveError, SlaveResult, StepMetrics, StepMetricsSnapshot};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Cancellation flag with interruptible sleeps.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    /// Create an active token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake every sleeper.
    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.wake.notify_all();
    }

    /// The token was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleep until `deadline`. Returns true if cancelled meanwhile.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Completion signal of an asynchronous step callback.
#[derive(Debug, Default)]
pub struct StepSignal {
    finished: Mutex<bool>,
    wake: Condvar,
}

impl StepSignal {
    /// Mark the current step as finished.
    pub fn finish(&self) {
        *self.finished.lock() = true;
        self.wake.notify_all();
    }

    fn reset(&self) {
        *self.finished.lock() = false;
    }

    /// Wait for [`StepSignal::finish`], checking `token` every `poll`.
    /// Returns false if cancelled first.
    fn wait(&self, token: &CancelToken, poll: Duration) -> bool {
        let mut finished = self.finished.lock();
        loop {
            if *finished {
                *finished = false;
                return true;
            }
            if token.is_cancelled() {
                return false;
            }
            self.wake.wait_for(&mut finished, poll);
        }
    }
}

/// Handles available to a task during one step.
#[derive(Debug)]
pub struct StepContext {
    token: Arc<CancelToken>,
    signal: Arc<StepSignal>,
    poll_interval: Duration,
    step: u64,
}

impl StepContext {
    /// Zero-based index of the current step.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The loop is being cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Block until the host finishes an asynchronous step. Returns false if
    /// the loop was cancelled first.
    #[must_use]
    pub fn wait_for_finish(&self) -> bool {
        self.signal.wait(&self.token, self.poll_interval)
    }
}

/// Work performed once per real-time step.
pub trait RealtimeTask: Send + 'static {
    /// Perform one step. Returning false ends the loop.
    fn step(&mut self, ctx: &StepContext) -> bool;

    /// Called after a step that took longer than the period.
    fn overrun(&mut self, _elapsed: Duration, _period: Duration) {}
}

/// Absolute deadline pacing.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    next: Instant,
    period: Duration,
    policy: OverrunPolicy,
}

impl Pacer {
    /// First deadline at `start`.
    #[must_use]
    pub fn new(start: Instant, period: Duration, policy: OverrunPolicy) -> Self {
        Self {
            next: start,
            period,
            policy,
        }
    }

    /// Deadline of the next step.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Move to the following deadline. With [`OverrunPolicy::Warn`] missed
    /// deadlines are skipped; with [`OverrunPolicy::Ignore`] the grid is
    /// kept and late steps run back to back. Returns the number of skipped
    /// deadlines.
    pub fn advance(&mut self, now: Instant) -> u32 {
        self.next += self.period;
        let mut skipped = 0;
        if self.policy == OverrunPolicy::Warn && !self.period.is_zero() {
            while self.next < now {
                self.next += self.period;
                skipped += 1;
            }
        }
        skipped
    }
}

/// Convert a Unix start time in seconds to a monotonic instant. Zero and
/// past times mean now.
#[must_use]
pub fn start_instant(start_time: i64) -> Instant {
    let now = Instant::now();
    let Ok(secs) = u64::try_from(start_time) else {
        return now;
    };
    if secs == 0 {
        return now;
    }
    let target = UNIX_EPOCH + Duration::from_secs(secs);
    match target.duration_since(SystemTime::now()) {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}

/// Owner of the real-time stepping thread.
#[derive(Debug)]
pub struct RealtimeStepper {
    token: Arc<CancelToken>,
    signal: Arc<StepSignal>,
    metrics: Arc<Mutex<StepMetrics>>,
    config: RealtimeConfig,
}

impl RealtimeStepper {
    /// Create an idle stepper.
    #[must_use]
    pub fn new(config: &RealtimeConfig) -> Self {
        let token = CancelToken::new();
        token.cancel();
        Self {
            token: Arc::new(token),
            signal: Arc::new(StepSignal::default()),
            metrics: Arc::new(Mutex::new(StepMetrics::new(
                config.histogram_size,
                Duration::ZERO,
            ))),
            config: config.clone(),
        }
    }

    /// Cancel any previous loop and start stepping `task` every `period`
    /// from `start` on. The caller owns the returned thread handle.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Spawn`] if the thread cannot be created.
    pub fn start<T: RealtimeTask>(
        &mut self,
        start: Instant,
        period: Duration,
        mut task: T,
    ) -> SlaveResult<JoinHandle<()>> {
        self.token.cancel();
        self.token = Arc::new(CancelToken::new());
        self.signal = Arc::new(StepSignal::default());
        {
            let mut metrics = self.metrics.lock();
            metrics.reset();
            metrics.set_period(period);
        }

        info!(
            period_us = period.as_micros(),
            delay_ms = start.saturating_duration_since(Instant::now()).as_millis(),
            "Starting realtime stepping"
        );

        let token = Arc::clone(&self.token);
        let signal = Arc::clone(&self.signal);
        let metrics = Arc::clone(&self.metrics);
        let policy = self.config.on_overrun;
        let poll_interval = self.config.async_poll_interval;

        thread::Builder::new()
            .name("dcp-realtime".into())
            .spawn(move || {
                let mut pacer = Pacer::new(start, period, policy);
                if token.sleep_until(start) {
                    debug!("Realtime stepping cancelled before start");
                    return;
                }

                let mut step = 0u64;
                loop {
                    signal.reset();
                    let ctx = StepContext {
                        token: Arc::clone(&token),
                        signal: Arc::clone(&signal),
                        poll_interval,
                        step,
                    };
                    let began = Instant::now();
                    if !task.step(&ctx) {
                        break;
                    }
                    let elapsed = began.elapsed();

                    if metrics.lock().record(elapsed) {
                        if policy == OverrunPolicy::Warn {
                            warn!(
                                step,
                                elapsed_us = elapsed.as_micros(),
                                period_us = period.as_micros(),
                                "Realtime step overrun"
                            );
                        }
                        task.overrun(elapsed, period);
                    }
                    trace!(step, elapsed_us = elapsed.as_micros(), "Realtime step complete");

                    let skipped = pacer.advance(Instant::now());
                    if skipped > 0 {
                        debug!(skipped, "Skipped missed deadlines");
                    }
                    step += 1;
                    if token.sleep_until(pacer.deadline()) {
                        break;
                    }
                }
                debug!(steps = step, "Realtime stepping stopped");
            })
            .map_err(|e| SlaveError::Spawn {
                name: "dcp-realtime".into(),
                message: e.to_string(),
            })
    }

    /// Stop the loop after the current step. Does not wait for the thread.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A loop is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Complete an asynchronous step.
    pub fn finish_step(&self) {
        self.signal.finish();
    }

    /// Step timing figures of the current or last loop.
    #[must_use]
    pub fn metrics(&self) -> StepMetricsSnapshot {
        self.metrics.lock().snapshot()
    }
}

impl Drop for RealtimeStepper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
