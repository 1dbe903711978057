//! Standing calibration, run before a session.
//!
//! Both steps are built from *still recordings*: every tracked channel is
//! sampled for `duration` seconds of sensor time while the participant holds
//! a posture. A recording in which a checked channel spreads (largest
//! pairwise distance between its samples) beyond the step's limit is
//! rejected and recorded again.
//!
//! | Step | Checked channels | Limit | Result |
//! |---|---|---|---|
//! | [`Calibrator::stance`] | tracked point, named markers, centre of pressure | `stance_spread` | mean of every channel |
//! | [`Calibrator::stability_limits`] | tracked point | `lean_spread` | mean lean per direction; arithmetic and geometric mean over directions |
//!
//! Before the stance is recorded the operator checks the feet placement
//! against a first recording and may ask for another one.
//!
//! Stability limits visit every [`LeanDirection`] `repetitions` times; each
//! round is an independent shuffle of the six directions.

use std::collections::BTreeMap;
use std::fmt;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use reachlab_hal::{KinematicSource, acquire_frame};
use reachlab_kernel::TimingMonitor;
use reachlab_memory::SessionLog;
use reachlab_types::{LabError, Vec3};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control_loop::LoopConfig;

pub const STANCE_STEP: &str = "stance";
pub const STABILITY_STEP: &str = "stability_limits";
pub const TRACKED_CHANNEL: &str = "tracked_point";
pub const COP_CHANNEL: &str = "cop";

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationSettings {
    /// Seconds of sensor time per still recording.
    pub duration: f64,
    /// Visits per lean direction.
    pub repetitions: u32,
    /// Largest movement in metres tolerated on any channel while standing.
    pub stance_spread: f64,
    /// Largest movement of the tracked point while holding a lean.
    pub lean_spread: f64,
    /// Recordings allowed per posture before calibration gives up.
    pub max_attempts: u32,
    /// Seed for the direction order. Random when absent.
    pub seed: Option<u64>,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            duration: 2.0,
            repetitions: 2,
            stance_spread: 0.05,
            lean_spread: 0.02,
            max_attempts: 5,
            seed: Some(42),
        }
    }
}

impl CalibrationSettings {
    /// # Errors
    ///
    /// Returns [`LabError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), LabError> {
        let positive = [
            ("duration", self.duration),
            ("stance_spread", self.stance_spread),
            ("lean_spread", self.lean_spread),
        ];
        for (name, v) in positive {
            if !(v.is_finite() && v > 0.0) {
                return Err(LabError::Config(format!("calibration.{name} must be > 0, got {v}")));
            }
        }
        if self.repetitions == 0 {
            return Err(LabError::Config("calibration.repetitions must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(LabError::Config("calibration.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lean directions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeanDirection {
    Left,
    Right,
    Forward,
    Backward,
    Left45,
    Right45,
}

impl LeanDirection {
    pub const ALL: [LeanDirection; 6] = [
        LeanDirection::Left,
        LeanDirection::Right,
        LeanDirection::Forward,
        LeanDirection::Backward,
        LeanDirection::Left45,
        LeanDirection::Right45,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LeanDirection::Left => "left",
            LeanDirection::Right => "right",
            LeanDirection::Forward => "forward",
            LeanDirection::Backward => "backward",
            LeanDirection::Left45 => "left_45",
            LeanDirection::Right45 => "right_45",
        }
    }
}

impl fmt::Display for LeanDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `repetitions` rounds, each an independent shuffle of all six directions.
pub fn direction_order(rng: &mut StdRng, repetitions: u32) -> Vec<LeanDirection> {
    let mut order = Vec::with_capacity(LeanDirection::ALL.len() * repetitions as usize);
    for _ in 0..repetitions {
        let mut round = LeanDirection::ALL;
        round.shuffle(rng);
        order.extend(round);
    }
    order
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Largest distance between any two of `points`; zero for fewer than two.
pub fn max_spread(points: &[Vec3]) -> f64 {
    let mut widest = 0.0f64;
    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            widest = widest.max((*a - *b).norm());
        }
    }
    widest
}

pub fn mean(points: &[Vec3]) -> Option<Vec3> {
    if points.is_empty() {
        return None;
    }
    let sum = points.iter().fold(Vec3::ZERO, |acc, &p| acc + p);
    Some(sum * (1.0 / points.len() as f64))
}

/// NaN when empty or when any value is negative; zero when any value is
/// zero.
pub fn geometric_mean(values: &[f64]) -> f64 {
    if values.is_empty() || values.iter().any(|v| *v < 0.0 || v.is_nan()) {
        return f64::NAN;
    }
    let log_sum: f64 = values.iter().map(|v| v.ln()).sum();
    (log_sum / values.len() as f64).exp()
}

// ─────────────────────────────────────────────────────────────────────────────
// Recordings and results
// ─────────────────────────────────────────────────────────────────────────────

/// Samples of every channel over one still recording. Non-finite marker and
/// centre-of-pressure readings (occlusions) are left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StillRecording {
    pub tracked: Vec<Vec3>,
    pub markers: BTreeMap<String, Vec<Vec3>>,
    pub center_of_pressure: Vec<Vec3>,
}

impl StillRecording {
    /// Every non-empty channel by name.
    pub fn channels(&self) -> impl Iterator<Item = (&str, &[Vec3])> {
        std::iter::once((TRACKED_CHANNEL, self.tracked.as_slice()))
            .chain(self.markers.iter().map(|(name, v)| (name.as_str(), v.as_slice())))
            .chain(std::iter::once((COP_CHANNEL, self.center_of_pressure.as_slice())))
            .filter(|(_, samples)| !samples.is_empty())
    }

    /// The channel that moved the most, with its spread.
    pub fn widest_channel(&self) -> Option<(&str, f64)> {
        self.channels()
            .map(|(name, samples)| (name, max_spread(samples)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn means(&self) -> BTreeMap<String, Vec3> {
        self.channels()
            .filter_map(|(name, samples)| mean(samples).map(|m| (name.to_string(), m)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StanceCalibration {
    /// Still recordings taken, including rejected ones.
    pub attempts: u32,
    pub means: BTreeMap<String, Vec3>,
}

impl StanceCalibration {
    pub fn write_to(&self, log: &SessionLog) -> Result<(), LabError> {
        for (label, value) in &self.means {
            log.append_calibration(STANCE_STEP, label, *value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StabilityLimits {
    pub order: Vec<LeanDirection>,
    pub attempts: u32,
    /// Mean lean per direction over its accepted recordings.
    pub directions: BTreeMap<LeanDirection, Vec3>,
    pub arithmetic_mean: Vec3,
    /// Component-wise; see [`geometric_mean`].
    pub geometric_mean: Vec3,
}

impl StabilityLimits {
    fn from_leans(
        order: Vec<LeanDirection>,
        attempts: u32,
        leans: &BTreeMap<LeanDirection, Vec<Vec3>>,
    ) -> Self {
        let directions: BTreeMap<LeanDirection, Vec3> = leans
            .iter()
            .filter_map(|(d, means)| mean(means).map(|m| (*d, m)))
            .collect();
        let points: Vec<Vec3> = directions.values().copied().collect();
        let nan = Vec3::new(f64::NAN, f64::NAN, f64::NAN);
        let component = |axis: usize| -> Vec<f64> { points.iter().map(|p| p.to_array()[axis]).collect() };
        Self {
            order,
            attempts,
            arithmetic_mean: mean(&points).unwrap_or(nan),
            geometric_mean: Vec3::new(
                geometric_mean(&component(0)),
                geometric_mean(&component(1)),
                geometric_mean(&component(2)),
            ),
            directions,
        }
    }

    pub fn write_to(&self, log: &SessionLog) -> Result<(), LabError> {
        for (direction, value) in &self.directions {
            log.append_calibration(STABILITY_STEP, direction.as_str(), *value)?;
        }
        log.append_calibration(STABILITY_STEP, "arithmetic_mean", self.arithmetic_mean)?;
        log.append_calibration(STABILITY_STEP, "geometric_mean", self.geometric_mean)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator
// ─────────────────────────────────────────────────────────────────────────────

/// Prompts and go/no-go decisions during calibration.
pub trait CalibrationOperator {
    /// Wait until the participant holds the posture `label`. Returning
    /// `false` aborts the calibration.
    fn ready(&mut self, label: &str) -> bool;

    /// Show the channel means of a placement recording. Returning `false`
    /// records the placement again.
    fn accept_placement(&mut self, _means: &BTreeMap<String, Vec3>) -> bool {
        true
    }

    /// A recording of `label` was rejected because `channel` moved `spread`
    /// metres.
    fn rejected(&mut self, _label: &str, _channel: &str, _spread: f64) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Calibrator
// ─────────────────────────────────────────────────────────────────────────────

pub struct Calibrator<S: KinematicSource> {
    source: S,
    settings: CalibrationSettings,
    timing: TimingMonitor,
    retry_limit: u32,
    rng: StdRng,
}

impl<S: KinematicSource> Calibrator<S> {
    /// Sampling rate and frame retries follow `loop_config`.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Config`] for invalid settings or loop frequency.
    pub fn new(source: S, settings: CalibrationSettings, loop_config: &LoopConfig) -> Result<Self, LabError> {
        settings.validate()?;
        let timing = TimingMonitor::from_frequency(loop_config.frequency_hz)?;
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            source,
            settings,
            timing,
            retry_limit: loop_config.frame_retry_limit,
            rng,
        })
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Sample every channel until `duration` seconds of sensor time have
    /// passed since the first frame.
    ///
    /// # Errors
    ///
    /// [`LabError::Sensor`] when no frame arrives for a whole recording's
    /// worth of periods; non-sensor errors from the driver are forwarded.
    pub fn record_still(&mut self) -> Result<StillRecording, LabError> {
        let miss_limit = (self.settings.duration / self.timing.period().as_secs_f64()).ceil() as u64;
        let mut recording = StillRecording::default();
        let mut first: Option<f64> = None;
        let mut misses = 0u64;
        loop {
            let started = self.timing.begin();
            match acquire_frame(&mut self.source, self.retry_limit, None) {
                Ok(frame) => {
                    misses = 0;
                    recording.tracked.push(frame.position);
                    for (name, p) in self.source.marker_positions() {
                        if p.is_finite() {
                            recording.markers.entry(name).or_default().push(p);
                        }
                    }
                    if let Some(cop) = self.source.center_of_pressure().filter(|c| c.is_finite()) {
                        recording.center_of_pressure.push(cop);
                    }
                    let start = *first.get_or_insert(frame.timestamp);
                    if frame.timestamp - start >= self.settings.duration {
                        break;
                    }
                }
                Err(LabError::Sensor(reason)) => {
                    misses += 1;
                    if misses > miss_limit {
                        return Err(LabError::Sensor(format!("calibration recording stalled: {reason}")));
                    }
                }
                Err(e) => return Err(e),
            }
            let sleep = self.timing.finish(started.elapsed());
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }
        debug!(
            samples = recording.tracked.len(),
            markers = recording.markers.len(),
            "still recording done"
        );
        Ok(recording)
    }

    /// Check the feet placement, then record the quiet stance.
    ///
    /// # Errors
    ///
    /// [`LabError::ProtocolViolation`] when the operator aborts, rejects
    /// `max_attempts` placements, or the participant keeps moving.
    pub fn stance(&mut self, operator: &mut dyn CalibrationOperator) -> Result<StanceCalibration, LabError> {
        let mut placed = false;
        for attempt in 1..=self.settings.max_attempts {
            if !operator.ready("placement") {
                return Err(aborted("placement"));
            }
            let recording = self.record_still()?;
            if operator.accept_placement(&recording.means()) {
                placed = true;
                break;
            }
            debug!(attempt, "placement not accepted");
        }
        if !placed {
            return Err(LabError::ProtocolViolation(format!(
                "placement not accepted after {} recordings",
                self.settings.max_attempts
            )));
        }

        let limit = self.settings.stance_spread;
        let (recording, attempts) = self.hold_still(operator, STANCE_STEP, limit, false)?;
        let stance = StanceCalibration {
            attempts,
            means: recording.means(),
        };
        info!(attempts, channels = stance.means.len(), "stance calibrated");
        Ok(stance)
    }

    /// Record every lean direction in shuffled order.
    ///
    /// # Errors
    ///
    /// As for [`Calibrator::stance`].
    pub fn stability_limits(
        &mut self,
        operator: &mut dyn CalibrationOperator,
    ) -> Result<StabilityLimits, LabError> {
        let order = direction_order(&mut self.rng, self.settings.repetitions);
        info!(order = ?order.iter().map(|d| d.as_str()).collect::<Vec<_>>(), "lean order drawn");

        let limit = self.settings.lean_spread;
        let mut leans: BTreeMap<LeanDirection, Vec<Vec3>> = BTreeMap::new();
        let mut attempts = 0;
        for direction in &order {
            let (recording, n) = self.hold_still(operator, direction.as_str(), limit, true)?;
            attempts += n;
            if let Some(m) = mean(&recording.tracked) {
                leans.entry(*direction).or_default().push(m);
            }
        }
        let limits = StabilityLimits::from_leans(order, attempts, &leans);
        info!(
            attempts,
            mean_x = limits.arithmetic_mean.x,
            mean_y = limits.arithmetic_mean.y,
            "stability limits calibrated"
        );
        Ok(limits)
    }

    /// Record `label` until the checked channels stay within `limit`.
    fn hold_still(
        &mut self,
        operator: &mut dyn CalibrationOperator,
        label: &str,
        limit: f64,
        tracked_only: bool,
    ) -> Result<(StillRecording, u32), LabError> {
        for attempt in 1..=self.settings.max_attempts {
            if !operator.ready(label) {
                return Err(aborted(label));
            }
            let recording = self.record_still()?;
            let widest = if tracked_only {
                Some((TRACKED_CHANNEL.to_string(), max_spread(&recording.tracked)))
            } else {
                recording
                    .widest_channel()
                    .map(|(name, spread)| (name.to_string(), spread))
            };
            match widest {
                Some((channel, spread)) if spread > limit => {
                    warn!(label, %channel, spread, limit, attempt, "too much movement, recording again");
                    operator.rejected(label, &channel, spread);
                }
                _ => return Ok((recording, attempt)),
            }
        }
        Err(LabError::ProtocolViolation(format!(
            "{label}: still moving after {} recordings",
            self.settings.max_attempts
        )))
    }
}

fn aborted(label: &str) -> LabError {
    LabError::ProtocolViolation(format!("calibration aborted by the operator at {label}"))
}
