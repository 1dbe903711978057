//! Experiment data model: targets, trial counters, force-law parameters,
//! block configuration and the trial phase enumeration.

use std::collections::BTreeSet;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::LabError;
use crate::geometry::{Vec2, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Kinematics
// ────────────────────────────────────────────────────────────────────────────

/// One tracked-point sample, produced once per loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct KinematicSample {
    /// Position in metres.
    pub position: Vec3,
    /// Smoothed velocity in metres per second.
    pub velocity: Vec3,
    /// Acquisition time in seconds on the loop clock.
    pub timestamp: f64,
    /// Whole-body centre of mass, when an estimator is attached.
    pub com: Option<Vec3>,
    /// Centre of the base of support, when an estimator is attached.
    pub cbos: Option<Vec3>,
    /// Signed lateral distance in metres from the straight path between the
    /// side targets, measured in the calibrated workspace frame. Positive
    /// to the left of the left→right path.
    #[serde(default)]
    pub path_deviation: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// Targets
// ────────────────────────────────────────────────────────────────────────────

/// The two lateral reach targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Identity of a target circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetId {
    Middle,
    Left,
    Right,
}

impl From<Side> for TargetId {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => TargetId::Left,
            Side::Right => TargetId::Right,
        }
    }
}

/// Visual status of a target, consumed by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    #[default]
    Inactive,
    Approaching,
    Active,
    Success,
    Failure,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Inactive => "inactive",
            TargetStatus::Approaching => "approaching",
            TargetStatus::Active => "active",
            TargetStatus::Success => "success",
            TargetStatus::Failure => "failure",
        }
    }
}

/// A circular target in workspace coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetCircle {
    pub id: TargetId,
    pub center: Vec2,
    pub radius: f64,
    pub status: TargetStatus,
}

impl TargetCircle {
    pub fn new(id: TargetId, center: Vec2, radius: f64) -> Self {
        Self {
            id,
            center,
            radius,
            status: TargetStatus::Inactive,
        }
    }

    /// Distance from `point` to the circle centre.
    pub fn distance_to(&self, point: Vec2) -> f64 {
        point.distance(self.center)
    }

    /// Strictly inside the radius.
    pub fn contains(&self, point: Vec2) -> bool {
        self.distance_to(point) < self.radius
    }
}

/// The three targets of the reaching task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetSet {
    pub middle: TargetCircle,
    pub left: TargetCircle,
    pub right: TargetCircle,
}

impl TargetSet {
    pub fn get(&self, id: TargetId) -> &TargetCircle {
        match id {
            TargetId::Middle => &self.middle,
            TargetId::Left => &self.left,
            TargetId::Right => &self.right,
        }
    }

    pub fn get_mut(&mut self, id: TargetId) -> &mut TargetCircle {
        match id {
            TargetId::Middle => &mut self.middle,
            TargetId::Left => &mut self.left,
            TargetId::Right => &mut self.right,
        }
    }

    pub fn side(&self, side: Side) -> &TargetCircle {
        self.get(side.into())
    }

    pub fn side_mut(&mut self, side: Side) -> &mut TargetCircle {
        self.get_mut(side.into())
    }

    /// Set every target back to [`TargetStatus::Inactive`].
    pub fn reset_statuses(&mut self) {
        self.middle.status = TargetStatus::Inactive;
        self.left.status = TargetStatus::Inactive;
        self.right.status = TargetStatus::Inactive;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trial counters
// ────────────────────────────────────────────────────────────────────────────

/// Per-block trial bookkeeping plus the session score.
///
/// Fields are private so that `0 ≤ remaining ≤ total` holds by construction;
/// [`TrialCounters::consume`] is the only way to decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialCounters {
    total_trials: u32,
    remaining_trials: u32,
    score: u32,
}

impl TrialCounters {
    pub fn new(total_trials: u32) -> Self {
        Self {
            total_trials,
            remaining_trials: total_trials,
            score: 0,
        }
    }

    pub fn total_trials(&self) -> u32 {
        self.total_trials
    }

    pub fn remaining_trials(&self) -> u32 {
        self.remaining_trials
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    /// 0-based index of the trial currently in progress.
    pub fn current_trial_index(&self) -> u32 {
        self.total_trials - self.remaining_trials
    }

    /// Trials finished in the current block.
    pub fn completed(&self) -> u32 {
        self.total_trials - self.remaining_trials
    }

    /// Fraction of the block still to run, in `[0, 1]`.
    pub fn remaining_perc(&self) -> f64 {
        if self.total_trials == 0 {
            0.0
        } else {
            f64::from(self.remaining_trials) / f64::from(self.total_trials)
        }
    }

    /// Record one trial outcome: decrement `remaining` by exactly one and
    /// credit the score on success.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::ProtocolViolation`] when no trials remain; the
    /// counter would otherwise go negative.
    pub fn consume(&mut self, success: bool) -> Result<(), LabError> {
        if self.remaining_trials == 0 {
            return Err(LabError::ProtocolViolation(format!(
                "trial outcome recorded with no trials remaining (total {})",
                self.total_trials
            )));
        }
        self.remaining_trials -= 1;
        if success {
            self.score += 1;
        }
        Ok(())
    }

    /// Start a new block of `total_trials`, keeping the session score.
    pub fn reset_for_block(&mut self, total_trials: u32) {
        self.total_trials = total_trials;
        self.remaining_trials = total_trials;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Force-law parameters
// ────────────────────────────────────────────────────────────────────────────

/// Which force law is active for the current reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PerturbationMode {
    #[default]
    Free,
    VelocityProportional,
    PositionChannel,
}

impl PerturbationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PerturbationMode::Free => "free",
            PerturbationMode::VelocityProportional => "velocity_proportional",
            PerturbationMode::PositionChannel => "position_channel",
        }
    }
}

/// Sign applied to a force law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Positive,
    Negative,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }
}

/// Inputs of the force law besides the kinematic sample.
///
/// `amplification` and `mode` are rewritten by the state machine every
/// iteration; the rest is fixed per block or per session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForceParameters {
    pub amplification: f64,
    pub participant_weight: f64,
    pub max_velocity: f64,
    pub direction: Direction,
    pub mode: PerturbationMode,
    /// Sign of the channel restoring force (`-path_deviation` for `Positive`).
    pub channel_sign: Direction,
}

impl Default for ForceParameters {
    fn default() -> Self {
        Self {
            amplification: 0.0,
            participant_weight: 0.0,
            max_velocity: 1.0,
            direction: Direction::Positive,
            mode: PerturbationMode::Free,
            channel_sign: Direction::Positive,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Block configuration
// ────────────────────────────────────────────────────────────────────────────

/// A closed `[min, max]` interval in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TimeWindow {
    pub min: f64,
    pub max: f64,
}

impl TimeWindow {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Classify a movement time against the window.
    pub fn classify(&self, elapsed: f64) -> TimingFeedback {
        if elapsed < self.min {
            TimingFeedback::TooFast
        } else if elapsed > self.max {
            TimingFeedback::TooSlow
        } else {
            TimingFeedback::OnTime
        }
    }

    fn validate(&self, name: &str) -> Result<(), LabError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(LabError::Config(format!("{name} must be finite")));
        }
        if self.min < 0.0 {
            return Err(LabError::Config(format!("{name}.min must be >= 0")));
        }
        if self.min > self.max {
            return Err(LabError::Config(format!(
                "{name} is inverted: min {} > max {}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Parameters shared by every trial of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    /// Amplification of the standard perturbation.
    pub force_amplification: f64,
    /// Amplification used on channel trials.
    #[serde(default)]
    pub channel_amplification: f64,
    /// Number of trials in the block.
    pub total_trials: u32,
    /// Movement-time window used for "too fast" / "too slow" feedback.
    pub desired_trial_time: TimeWindow,
    /// Range of the random dwell drawn on every side-target hold.
    pub state_wait_time_range: TimeWindow,
    /// 0-based trial indices run without perturbation.
    #[serde(default)]
    pub catch_trial_indices: BTreeSet<u32>,
    /// 0-based trial indices run with the position channel.
    #[serde(default)]
    pub channel_trial_indices: BTreeSet<u32>,
    /// Rest pause after every `n` completed trials.
    #[serde(default)]
    pub pause_frequency: Option<u32>,
    #[serde(default)]
    pub direction: Direction,
    /// Force law of non-catch, non-channel trials.
    #[serde(default = "default_force_mode")]
    pub force_mode: PerturbationMode,
}

fn default_force_mode() -> PerturbationMode {
    PerturbationMode::VelocityProportional
}

impl BlockConfig {
    /// Check required ranges.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), LabError> {
        if self.total_trials == 0 {
            return Err(LabError::Config("total_trials must be > 0".to_string()));
        }
        if !self.force_amplification.is_finite() || self.force_amplification < 0.0 {
            return Err(LabError::Config(format!(
                "force_amplification must be a finite value >= 0, got {}",
                self.force_amplification
            )));
        }
        if !self.channel_amplification.is_finite() || self.channel_amplification < 0.0 {
            return Err(LabError::Config(format!(
                "channel_amplification must be a finite value >= 0, got {}",
                self.channel_amplification
            )));
        }
        self.desired_trial_time.validate("desired_trial_time")?;
        self.state_wait_time_range.validate("state_wait_time_range")?;
        if let Some(idx) = self
            .catch_trial_indices
            .iter()
            .chain(self.channel_trial_indices.iter())
            .find(|&&i| i >= self.total_trials)
        {
            return Err(LabError::Config(format!(
                "trial index {idx} is out of range for {} trials",
                self.total_trials
            )));
        }
        if self.pause_frequency == Some(0) {
            return Err(LabError::Config("pause_frequency must be > 0".to_string()));
        }
        Ok(())
    }

    /// Indices listed as both catch and channel trials (catch wins).
    pub fn overlapping_indices(&self) -> Vec<u32> {
        self.catch_trial_indices
            .intersection(&self.channel_trial_indices)
            .copied()
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trial phases and outcomes
// ────────────────────────────────────────────────────────────────────────────

/// The trial state machine's current state. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "phase", content = "side", rename_all = "snake_case")]
pub enum TrialPhase {
    /// Held here until the recording gate opens.
    AwaitStart,
    /// Waiting for the operator to confirm the start.
    Ready,
    ApproachCenter,
    HoldCenter,
    /// Moving onto a side target before its hold.
    ApproachAfterTrial(Side),
    /// Dwelling inside a side target.
    Hold(Side),
    /// Go cue shown; waiting for the cursor to leave the hold target.
    DepartHold(Side),
    /// Reaching toward the given target.
    Reach(Side),
    /// Inside the target; must stay for the confirm hold.
    ConfirmDwell(Side),
    TrialEnd,
    Pause,
    Exit,
}

impl TrialPhase {
    /// Stable snake-case name used in logs and records.
    pub fn name(&self) -> &'static str {
        match self {
            TrialPhase::AwaitStart => "await_start",
            TrialPhase::Ready => "ready",
            TrialPhase::ApproachCenter => "approach_center",
            TrialPhase::HoldCenter => "hold_center",
            TrialPhase::ApproachAfterTrial(Side::Left) => "approach_left_after_trial",
            TrialPhase::ApproachAfterTrial(Side::Right) => "approach_right_after_trial",
            TrialPhase::Hold(Side::Left) => "hold_left",
            TrialPhase::Hold(Side::Right) => "hold_right",
            TrialPhase::DepartHold(Side::Left) => "depart_left",
            TrialPhase::DepartHold(Side::Right) => "depart_right",
            TrialPhase::Reach(Side::Left) => "reach_left",
            TrialPhase::Reach(Side::Right) => "reach_right",
            TrialPhase::ConfirmDwell(Side::Left) => "confirm_left",
            TrialPhase::ConfirmDwell(Side::Right) => "confirm_right",
            TrialPhase::TrialEnd => "trial_end",
            TrialPhase::Pause => "pause",
            TrialPhase::Exit => "exit",
        }
    }

    /// Phases during which an exhausted block may be closed.
    ///
    /// Excluded: the pre-session phases, a reach being confirmed or scored,
    /// an ongoing pause, and the terminal state.
    pub fn permits_block_boundary(&self) -> bool {
        !matches!(
            self,
            TrialPhase::AwaitStart
                | TrialPhase::Ready
                | TrialPhase::ConfirmDwell(_)
                | TrialPhase::TrialEnd
                | TrialPhase::Pause
                | TrialPhase::Exit
        )
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a reach ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    /// Entered the target (and held it, when confirmation is enabled).
    Hit,
    /// Overshot, but the path crossed within the target radius.
    NearMiss,
    /// Overshot and the path stayed outside the radius.
    Miss,
    /// Movement-time ceiling exceeded.
    Timeout,
    /// Entered the target but left before the confirm hold elapsed.
    FlyThrough,
}

impl TrialOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, TrialOutcome::Hit | TrialOutcome::NearMiss)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialOutcome::Hit => "hit",
            TrialOutcome::NearMiss => "near_miss",
            TrialOutcome::Miss => "miss",
            TrialOutcome::Timeout => "timeout",
            TrialOutcome::FlyThrough => "fly_through",
        }
    }
}

/// Movement-time feedback; never affects counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingFeedback {
    TooFast,
    OnTime,
    TooSlow,
}

impl TimingFeedback {
    pub fn as_str(self) -> &'static str {
        match self {
            TimingFeedback::TooFast => "too_fast",
            TimingFeedback::OnTime => "on_time",
            TimingFeedback::TooSlow => "too_slow",
        }
    }
}

/// Summary of one scored trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub block_index: usize,
    /// 0-based index within the block.
    pub trial_index: u32,
    pub target: Side,
    pub outcome: TrialOutcome,
    /// Movement time in seconds.
    pub movement_time: f64,
    pub timing: TimingFeedback,
    pub catch_trial: bool,
    pub channel_trial: bool,
    /// Amplification armed for the reach.
    pub amplification: f64,
    pub score: u32,
    pub remaining_trials: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> BlockConfig {
        BlockConfig {
            force_amplification: 1.0,
            channel_amplification: 2.0,
            total_trials: 5,
            desired_trial_time: TimeWindow::new(0.4, 0.8),
            state_wait_time_range: TimeWindow::new(0.5, 1.0),
            catch_trial_indices: BTreeSet::from([1]),
            channel_trial_indices: BTreeSet::from([2]),
            pause_frequency: None,
            direction: Direction::Positive,
            force_mode: PerturbationMode::VelocityProportional,
        }
    }

    #[test]
    fn counters_consume_decrements_once() {
        let mut c = TrialCounters::new(2);
        c.consume(true).unwrap();
        assert_eq!(c.remaining_trials(), 1);
        assert_eq!(c.score(), 1);
        c.consume(false).unwrap();
        assert_eq!(c.remaining_trials(), 0);
        assert_eq!(c.score(), 1);
        assert!(matches!(
            c.consume(true),
            Err(LabError::ProtocolViolation(_))
        ));
        assert_eq!(c.remaining_trials(), 0);
    }

    #[test]
    fn counters_reset_keeps_score() {
        let mut c = TrialCounters::new(1);
        c.consume(true).unwrap();
        c.reset_for_block(4);
        assert_eq!(c.score(), 1);
        assert_eq!(c.remaining_trials(), 4);
        assert_eq!(c.current_trial_index(), 0);
        assert!((c.remaining_perc() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn time_window_classification() {
        let w = TimeWindow::new(0.4, 0.8);
        assert_eq!(w.classify(0.3), TimingFeedback::TooFast);
        assert_eq!(w.classify(0.4), TimingFeedback::OnTime);
        assert_eq!(w.classify(0.8), TimingFeedback::OnTime);
        assert_eq!(w.classify(0.81), TimingFeedback::TooSlow);
    }

    #[test]
    fn valid_block_passes() {
        assert!(block().validate().is_ok());
    }

    #[test]
    fn zero_trials_rejected() {
        let mut b = block();
        b.total_trials = 0;
        b.catch_trial_indices.clear();
        b.channel_trial_indices.clear();
        assert!(matches!(b.validate(), Err(LabError::Config(_))));
    }

    #[test]
    fn out_of_range_catch_index_rejected() {
        let mut b = block();
        b.catch_trial_indices.insert(5);
        assert!(matches!(b.validate(), Err(LabError::Config(msg)) if msg.contains("index 5")));
    }

    #[test]
    fn inverted_window_rejected() {
        let mut b = block();
        b.state_wait_time_range = TimeWindow::new(2.0, 1.0);
        assert!(b.validate().is_err());
    }

    #[test]
    fn negative_amplification_rejected() {
        let mut b = block();
        b.force_amplification = -0.1;
        assert!(b.validate().is_err());
    }

    #[test]
    fn zero_pause_frequency_rejected() {
        let mut b = block();
        b.pause_frequency = Some(0);
        assert!(b.validate().is_err());
    }

    #[test]
    fn overlapping_indices_reported() {
        let mut b = block();
        b.channel_trial_indices.insert(1);
        assert_eq!(b.overlapping_indices(), vec![1]);
    }

    #[test]
    fn block_config_json_defaults() {
        let json = r#"{
            "force_amplification": 3.0,
            "total_trials": 10,
            "desired_trial_time": {"min": 0.4, "max": 0.8},
            "state_wait_time_range": {"min": 1.0, "max": 2.0}
        }"#;
        let b: BlockConfig = serde_json::from_str(json).unwrap();
        assert_eq!(b.force_mode, PerturbationMode::VelocityProportional);
        assert_eq!(b.direction, Direction::Positive);
        assert!(b.catch_trial_indices.is_empty());
        assert_eq!(b.pause_frequency, None);
    }

    #[test]
    fn block_config_rejects_unknown_fields() {
        let json = r#"{
            "force_amplification": 3.0,
            "total_trials": 10,
            "desired_trial_time": {"min": 0.4, "max": 0.8},
            "state_wait_time_range": {"min": 1.0, "max": 2.0},
            "amplificaton": 1.0
        }"#;
        assert!(serde_json::from_str::<BlockConfig>(json).is_err());
    }

    #[test]
    fn phase_names_are_unique_per_side() {
        assert_eq!(TrialPhase::Reach(Side::Left).name(), "reach_left");
        assert_eq!(TrialPhase::Reach(Side::Right).name(), "reach_right");
        assert_eq!(TrialPhase::Exit.to_string(), "exit");
    }

    #[test]
    fn block_boundary_not_permitted_mid_confirmation() {
        assert!(!TrialPhase::ConfirmDwell(Side::Right).permits_block_boundary());
        assert!(!TrialPhase::TrialEnd.permits_block_boundary());
        assert!(TrialPhase::ApproachCenter.permits_block_boundary());
        assert!(TrialPhase::Reach(Side::Left).permits_block_boundary());
    }

    #[test]
    fn target_contains_is_strict() {
        let t = TargetCircle::new(TargetId::Right, Vec2::new(0.05, 0.0), 0.01);
        assert!(t.contains(Vec2::new(0.055, 0.0)));
        assert!(!t.contains(Vec2::new(0.06, 0.0)));
    }
}
