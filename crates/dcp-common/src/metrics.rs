//! Step timing metrics for real-time stepping.
//!
//! A fixed ring buffer keeps the most recent step durations so that
//! percentiles can be reported without unbounded growth.

use serde::Serialize;
use std::time::Duration;

/// Step execution metrics with a ring buffer of recent durations.
#[derive(Debug)]
pub struct StepMetrics {
    samples: Box<[u64]>,
    write_pos: usize,
    sample_count: usize,
    total_steps: u64,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u64,
    overrun_count: u64,
    /// Step period in nanoseconds; longer steps count as overruns.
    period_ns: u64,
}

impl StepMetrics {
    /// Create a collector retaining `histogram_size` samples.
    ///
    /// Steps longer than `period` are counted as overruns.
    #[must_use]
    pub fn new(histogram_size: usize, period: Duration) -> Self {
        Self {
            samples: vec![0u64; histogram_size.max(1)].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_steps: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            overrun_count: 0,
            period_ns: duration_ns(period),
        }
    }

    /// Record one step duration. Returns true if the step overran.
    pub fn record(&mut self, duration: Duration) -> bool {
        let ns = duration_ns(duration);
        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = (self.sample_count + 1).min(self.samples.len());

        self.total_steps += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);

        let overrun = ns > self.period_ns;
        if overrun {
            self.overrun_count += 1;
        }
        overrun
    }

    /// Change the step period, e.g. after a new time resolution.
    pub fn set_period(&mut self, period: Duration) {
        self.period_ns = duration_ns(period);
    }

    /// Total number of recorded steps.
    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Number of steps that exceeded the period.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Percentile (0.0 to 100.0) over the retained samples.
    ///
    /// Returns `None` without samples or for an out-of-range percentile.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }
        let mut sorted = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Snapshot of the aggregate figures.
    #[must_use]
    pub fn snapshot(&self) -> StepMetricsSnapshot {
        let seen = self.total_steps > 0;
        StepMetricsSnapshot {
            total_steps: self.total_steps,
            min_ns: seen.then_some(self.min_ns),
            max_ns: seen.then_some(self.max_ns),
            mean_ns: seen.then(|| self.sum_ns / self.total_steps),
            overrun_count: self.overrun_count,
            period_ns: self.period_ns,
        }
    }

    /// Reset all figures, keeping the period.
    pub fn reset(&mut self) {
        self.samples.fill(0);
        self.write_pos = 0;
        self.sample_count = 0;
        self.total_steps = 0;
        self.min_ns = u64::MAX;
        self.max_ns = 0;
        self.sum_ns = 0;
        self.overrun_count = 0;
    }
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Immutable snapshot of step metrics for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepMetricsSnapshot {
    /// Steps executed.
    pub total_steps: u64,
    /// Shortest step in nanoseconds.
    pub min_ns: Option<u64>,
    /// Longest step in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean step in nanoseconds.
    pub mean_ns: Option<u64>,
    /// Steps longer than the period.
    pub overrun_count: u64,
    /// Configured step period in nanoseconds.
    pub period_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_recording() {
        let mut metrics = StepMetrics::new(16, Duration::from_millis(10));
        assert!(!metrics.record(Duration::from_millis(2)));
        assert!(!metrics.record(Duration::from_millis(4)));

        let snap = metrics.snapshot();
        assert_eq!(snap.total_steps, 2);
        assert_eq!(snap.min_ns, Some(2_000_000));
        assert_eq!(snap.max_ns, Some(4_000_000));
        assert_eq!(snap.mean_ns, Some(3_000_000));
    }

    #[test]
    fn test_overrun_counting() {
        let mut metrics = StepMetrics::new(16, Duration::from_millis(1));
        metrics.record(Duration::from_micros(900));
        assert!(metrics.record(Duration::from_micros(1_100)));
        assert_eq!(metrics.overrun_count(), 1);

        metrics.set_period(Duration::from_millis(2));
        assert!(!metrics.record(Duration::from_micros(1_500)));
        assert_eq!(metrics.overrun_count(), 1);
    }

    #[test]
    fn test_percentiles_and_wrapping() {
        let mut metrics = StepMetrics::new(10, Duration::from_secs(1));
        for i in 1..=25 {
            metrics.record(Duration::from_micros(i));
        }
        assert_eq!(metrics.total_steps(), 25);
        // only the last ten samples (16..=25) are retained
        assert_eq!(metrics.percentile(0.0), Some(Duration::from_micros(16)));
        assert_eq!(metrics.percentile(100.0), Some(Duration::from_micros(25)));
        assert!(metrics.percentile(101.0).is_none());
        assert!(metrics.percentile(f64::NAN).is_none());
    }

    #[test]
    fn test_reset() {
        let mut metrics = StepMetrics::new(4, Duration::from_millis(1));
        metrics.record(Duration::from_millis(3));
        metrics.reset();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_steps, 0);
        assert_eq!(snap.min_ns, None);
        assert_eq!(snap.period_ns, 1_000_000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = StepMetrics::new(4, Duration::from_millis(1));
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"total_steps\":0"));
    }
}
