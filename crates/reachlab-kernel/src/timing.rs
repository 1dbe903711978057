//! [`TimingMonitor`] – fixed-period pacing for the control loop.
//!
//! After each iteration the loop hands the monitor the time it spent
//! working and gets back how long to sleep: `max(0, period − elapsed)`. An
//! overrun is logged and the loop proceeds immediately without trying to
//! catch up, so the following interval is simply shorter.

use std::time::{Duration, Instant};

use reachlab_types::LabError;
use tracing::warn;

/// Aggregate loop timing, reported at session end.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingStats {
    pub iterations: u64,
    pub overruns: u64,
    /// Longest single iteration of work.
    pub worst_iteration: Duration,
    /// Mean interval between consecutive iteration starts.
    pub mean_period: Duration,
}

#[derive(Debug)]
pub struct TimingMonitor {
    period: Duration,
    iterations: u64,
    overruns: u64,
    worst: Duration,
    first_start: Option<Instant>,
    last_start: Option<Instant>,
}

impl TimingMonitor {
    /// # Errors
    ///
    /// Returns [`LabError::Config`] when `frequency_hz` is not a positive
    /// finite number.
    pub fn from_frequency(frequency_hz: f64) -> Result<Self, LabError> {
        if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
            return Err(LabError::Config(format!(
                "loop frequency must be > 0 Hz, got {frequency_hz}"
            )));
        }
        Ok(Self::new(Duration::from_nanos((1e9 / frequency_hz).round() as u64)))
    }

    pub fn new(period: Duration) -> Self {
        Self {
            period,
            iterations: 0,
            overruns: 0,
            worst: Duration::ZERO,
            first_start: None,
            last_start: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Mark the start of an iteration.
    pub fn begin(&mut self) -> Instant {
        let now = Instant::now();
        self.first_start.get_or_insert(now);
        self.last_start = Some(now);
        now
    }

    /// Record `elapsed` work time and return the sleep needed to hold the
    /// period.
    pub fn finish(&mut self, elapsed: Duration) -> Duration {
        self.iterations += 1;
        self.worst = self.worst.max(elapsed);
        match self.period.checked_sub(elapsed) {
            Some(sleep) => sleep,
            None => {
                self.overruns += 1;
                warn!(
                    elapsed_ms = elapsed.as_secs_f64() * 1e3,
                    period_ms = self.period.as_secs_f64() * 1e3,
                    iteration = self.iterations,
                    "loop overrun, continuing without catch-up"
                );
                Duration::ZERO
            }
        }
    }

    pub fn stats(&self) -> TimingStats {
        let mean_period = match (self.first_start, self.last_start) {
            (Some(first), Some(last)) if self.iterations > 1 => {
                let intervals = u32::try_from(self.iterations - 1).unwrap_or(u32::MAX);
                last.duration_since(first) / intervals
            }
            _ => self.period,
        };
        TimingStats {
            iterations: self.iterations,
            overruns: self.overruns,
            worst_iteration: self.worst,
            mean_period,
        }
    }
}
