//! [`TrialStateMachine`] – the reaching protocol.
//!
//! The machine is stepped once per loop iteration with the current cursor,
//! the operator's confirm input and the recording gate. It mutates the
//! [`ExperimentState`] owned by the loop driver and reports what happened in
//! a [`StepOutcome`]; it never reads a clock or a socket itself, so a trace of
//! [`StepInput`]s replays deterministically given the same RNG seed.
//!
//! # Phases
//!
//! ```text
//! AwaitStart ─rec─▶ Ready ─confirm─▶ ApproachCenter ◀──────────────┐
//!                                         │ enter middle           │ leave
//!                                         ▼                        │
//!                                    HoldCenter ──────────────────┘
//!                                         │ center_hold elapsed
//!                                         ▼
//!              ┌────────────▶ ApproachAfterTrial(s) ◀──── leave ───┐
//!              │                          │ enter s                │
//!              │                          ▼                        │
//!              │                       Hold(s) ────────────────────┘
//!              │                          │ random dwell elapsed
//!              │                          ▼
//!              │                    DepartHold(s)
//!              │                          │ cursor clears s  (amplification armed)
//!              │                          ▼
//!              │                  Reach(opposite s) ──hit──▶ ConfirmDwell
//!              │                          │ overshoot / timeout     │
//!              │                          ▼                         │
//!              └──── reversal ─────── TrialEnd ◀────────────────────┘
//!                                         │ block exhausted / pause_frequency
//!                                         ▼
//!                                  Pause ──▶ ApproachCenter      Exit
//! ```
//!
//! The block-boundary check runs before the per-phase rules on every step
//! whose phase [permits it](TrialPhase::permits_block_boundary).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reachlab_perception::geometry::line_distance_to_point;
use reachlab_types::{
    BlockConfig, Direction, ForceParameters, LabError, PerturbationMode, Side, TargetCircle,
    TargetId, TargetSet, TargetStatus, TimingFeedback, TrialCounters, TrialOutcome, TrialPhase,
    TrialReport, Vec2,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sequencer::BlockSequencer;

pub const AWAIT_RECORDING_MESSAGE: &str = "Waiting for recording to start.";
pub const READY_MESSAGE: &str = "Press <Enter> when ready.";
pub const PAUSE_MESSAGE: &str = "Pause";
pub const EXIT_MESSAGE: &str = "Press <Enter> to exit.";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CircleSpec {
    pub center: Vec2,
    pub radius: f64,
}

impl CircleSpec {
    pub const fn new(x: f64, y: f64, radius: f64) -> Self {
        Self {
            center: Vec2::new(x, y),
            radius,
        }
    }
}

/// Target geometry in cursor units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct TargetLayout {
    pub middle: CircleSpec,
    pub left: CircleSpec,
    pub right: CircleSpec,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self {
            middle: CircleSpec::new(0.0, 0.0, 0.01),
            left: CircleSpec::new(-0.05, 0.0, 0.01),
            right: CircleSpec::new(0.05, 0.0, 0.01),
        }
    }
}

impl TargetLayout {
    pub fn target_set(&self) -> TargetSet {
        TargetSet {
            middle: TargetCircle::new(TargetId::Middle, self.middle.center, self.middle.radius),
            left: TargetCircle::new(TargetId::Left, self.left.center, self.left.radius),
            right: TargetCircle::new(TargetId::Right, self.right.center, self.right.radius),
        }
    }

    fn validate(&self) -> Result<(), LabError> {
        for (name, circle) in [
            ("middle", &self.middle),
            ("left", &self.left),
            ("right", &self.right),
        ] {
            if !circle.center.is_finite() {
                return Err(LabError::Config(format!("target {name} centre must be finite")));
            }
            if !(circle.radius.is_finite() && circle.radius > 0.0) {
                return Err(LabError::Config(format!(
                    "target {name} radius must be > 0, got {}",
                    circle.radius
                )));
            }
        }
        if self.left.center.x >= self.right.center.x {
            return Err(LabError::Config(
                "left target must lie left of the right target".to_string(),
            ));
        }
        Ok(())
    }
}

/// What follows a trial's feedback wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrialLoop {
    /// Hold at the reached target, then reach back.
    #[default]
    Reversal,
    /// Re-centre on the middle target before the next hold.
    CenterOut,
}

/// Protocol settings that do not change between blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    pub targets: TargetLayout,
    /// Seconds inside the middle target before the first hold.
    pub center_hold: f64,
    /// Require the cursor to stay in the reached target for `confirm_hold`.
    pub confirm_dwell: bool,
    pub confirm_hold: f64,
    /// Ceiling on a single reach, in seconds.
    pub max_movement_time: f64,
    pub pause_duration: f64,
    /// Feedback wait after each trial. Defaults to the span of the block's
    /// `state_wait_time_range`.
    pub feedback_duration: Option<f64>,
    /// Side the first hold takes place on; the first reach goes the other way.
    pub first_side: Side,
    pub trial_loop: TrialLoop,
    /// Seed for the dwell-time generator. Random when absent.
    pub seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            targets: TargetLayout::default(),
            center_hold: 2.0,
            confirm_dwell: true,
            confirm_hold: 0.2,
            max_movement_time: 2.0,
            pause_duration: 30.0,
            feedback_duration: None,
            first_side: Side::Left,
            trial_loop: TrialLoop::Reversal,
            seed: None,
        }
    }
}

impl ProtocolConfig {
    /// # Errors
    ///
    /// Returns [`LabError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), LabError> {
        self.targets.validate()?;
        let durations = [
            ("center_hold", Some(self.center_hold)),
            ("confirm_hold", Some(self.confirm_hold)),
            ("pause_duration", Some(self.pause_duration)),
            ("feedback_duration", self.feedback_duration),
        ];
        for (name, value) in durations {
            if let Some(v) = value {
                if !(v.is_finite() && v >= 0.0) {
                    return Err(LabError::Config(format!("{name} must be >= 0, got {v}")));
                }
            }
        }
        if !(self.max_movement_time.is_finite() && self.max_movement_time > 0.0) {
            return Err(LabError::Config(format!(
                "max_movement_time must be > 0, got {}",
                self.max_movement_time
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-iteration state and I/O
// ────────────────────────────────────────────────────────────────────────────

/// Everything the loop driver, the force law and the presentation layer read
/// from the protocol. Owned by the loop driver; only the state machine writes
/// it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentState {
    pub phase: TrialPhase,
    pub targets: TargetSet,
    pub counters: TrialCounters,
    /// `amplification` and `mode` are armed at reach start and zeroed at
    /// trial end.
    pub force: ForceParameters,
    pub block_index: usize,
    pub cursor: Vec2,
    pub previous_cursor: Option<Vec2>,
    pub phase_started_at: f64,
    /// Dwell required in the current phase, if it has one.
    pub wait_time: Option<f64>,
    pub reach_started_at: Option<f64>,
    pub catch_trial: bool,
    pub channel_trial: bool,
    /// Set at a block boundary; the next block is loaded when the pause ends.
    pub reload_pending: bool,
    pub timing_feedback: Option<TimingFeedback>,
    /// Operator-facing text.
    pub message: String,
    pub show_progress: bool,
    pub last_report: Option<TrialReport>,
}

impl ExperimentState {
    /// Seconds spent in the current phase at `now`.
    pub fn elapsed_in_phase(&self, now: f64) -> f64 {
        now - self.phase_started_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInput {
    /// Seconds on the loop clock.
    pub now: f64,
    pub cursor: Vec2,
    /// Level of the operator's confirm input; edges are detected internally.
    pub confirm: bool,
    pub recording: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// `false` once the operator confirms on the exit screen.
    pub continue_loop: bool,
    pub transition: Option<(TrialPhase, TrialPhase)>,
    pub trial: Option<TrialReport>,
    /// The cursor offset should be re-derived from the current resting
    /// position.
    pub recenter_cursor: bool,
    pub block_started: Option<usize>,
    pub session_finished: bool,
}

impl Default for StepOutcome {
    fn default() -> Self {
        Self {
            continue_loop: true,
            transition: None,
            trial: None,
            recenter_cursor: false,
            block_started: None,
            session_finished: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TrialStateMachine
// ────────────────────────────────────────────────────────────────────────────

pub struct TrialStateMachine<R = StdRng> {
    config: ProtocolConfig,
    sequencer: BlockSequencer,
    rng: R,
    confirm_held: bool,
    recording: bool,
    /// Side the next reach starts from.
    hold_side: Side,
    /// Movement time at target entry, while the hit is being confirmed.
    pending_hit: Option<f64>,
}

impl TrialStateMachine<StdRng> {
    /// Build a machine whose dwell generator is seeded from
    /// `config.seed`, or from the OS when no seed is configured.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Config`] when the protocol or any block is invalid.
    pub fn from_config(config: ProtocolConfig, blocks: Vec<BlockConfig>) -> Result<Self, LabError> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::new(config, blocks, rng)
    }
}

impl<R: Rng> TrialStateMachine<R> {
    /// # Errors
    ///
    /// Returns [`LabError::Config`] when the protocol or any block is invalid.
    pub fn new(config: ProtocolConfig, blocks: Vec<BlockConfig>, rng: R) -> Result<Self, LabError> {
        config.validate()?;
        let sequencer = BlockSequencer::new(blocks)?;
        Ok(Self {
            hold_side: config.first_side,
            config,
            sequencer,
            rng,
            confirm_held: false,
            recording: false,
            pending_hit: None,
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn sequencer(&self) -> &BlockSequencer {
        &self.sequencer
    }

    pub fn current_block(&self) -> &BlockConfig {
        self.sequencer.current()
    }

    /// The state a session starts from. Session-wide force settings
    /// (weight, velocity clamp, channel sign) come from `base`; amplification
    /// and mode start at zero / [`PerturbationMode::Free`].
    pub fn initial_state(&self, base: ForceParameters) -> ExperimentState {
        let block = self.sequencer.current();
        ExperimentState {
            phase: TrialPhase::AwaitStart,
            targets: self.config.targets.target_set(),
            counters: TrialCounters::new(block.total_trials),
            force: ForceParameters {
                amplification: 0.0,
                mode: PerturbationMode::Free,
                direction: block.direction,
                ..base
            },
            block_index: self.sequencer.index(),
            cursor: Vec2::ZERO,
            previous_cursor: None,
            phase_started_at: 0.0,
            wait_time: None,
            reach_started_at: None,
            catch_trial: false,
            channel_trial: false,
            reload_pending: false,
            timing_feedback: None,
            message: AWAIT_RECORDING_MESSAGE.to_string(),
            show_progress: false,
            last_report: None,
        }
    }

    /// Advance the protocol by one iteration.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::ProtocolViolation`] if a trial outcome is recorded
    /// with no trials remaining in the block.
    pub fn step(
        &mut self,
        state: &mut ExperimentState,
        input: &StepInput,
    ) -> Result<StepOutcome, LabError> {
        let confirm_edge = input.confirm && !self.confirm_held;
        self.confirm_held = input.confirm;
        self.track_recording(state.phase, input.recording);

        let now = input.now;
        let cursor = input.cursor;
        state.cursor = cursor;
        let from = state.phase;
        let mut out = StepOutcome::default();

        if from.permits_block_boundary() && state.counters.remaining_trials() == 0 {
            self.close_block(state, now, &mut out);
        } else {
            match from {
                TrialPhase::AwaitStart => {
                    if input.recording {
                        enter(state, TrialPhase::Ready, now);
                        state.message = READY_MESSAGE.to_string();
                    }
                }
                TrialPhase::Ready => {
                    if confirm_edge {
                        self.start_session(state, now, &mut out);
                    }
                }
                TrialPhase::ApproachCenter => {
                    if state.targets.middle.contains(cursor) {
                        state.targets.middle.status = TargetStatus::Active;
                        enter(state, TrialPhase::HoldCenter, now);
                        state.wait_time = Some(self.config.center_hold);
                    }
                }
                TrialPhase::HoldCenter => {
                    if wait_elapsed(state, now) {
                        self.approach_hold(state, now);
                    } else if outside(&state.targets.middle, cursor) {
                        state.targets.middle.status = TargetStatus::Approaching;
                        enter(state, TrialPhase::ApproachCenter, now);
                    }
                }
                TrialPhase::ApproachAfterTrial(side) => {
                    if state.targets.side(side).contains(cursor) {
                        let range = self.sequencer.current().state_wait_time_range;
                        let dwell = self.rng.random_range(range.min..=range.max);
                        enter(state, TrialPhase::Hold(side), now);
                        state.wait_time = Some(dwell);
                    }
                }
                TrialPhase::Hold(side) => {
                    if wait_elapsed(state, now) {
                        state.targets.side_mut(side).status = TargetStatus::Approaching;
                        state.targets.side_mut(side.opposite()).status = TargetStatus::Active;
                        enter(state, TrialPhase::DepartHold(side), now);
                    } else if outside(state.targets.side(side), cursor) {
                        enter(state, TrialPhase::ApproachAfterTrial(side), now);
                    }
                }
                TrialPhase::DepartHold(side) => {
                    if state.targets.side(side).distance_to(cursor) >= state.targets.side(side).radius {
                        self.begin_reach(state, side.opposite(), now);
                    }
                }
                TrialPhase::Reach(target) => self.update_reach(state, target, now, &mut out)?,
                TrialPhase::ConfirmDwell(target) => {
                    let movement_time = self
                        .pending_hit
                        .unwrap_or_else(|| now - state.reach_started_at.unwrap_or(now));
                    if outside(state.targets.side(target), cursor) {
                        self.finish_trial(state, target, TrialOutcome::FlyThrough, movement_time, now, &mut out)?;
                    } else if wait_elapsed(state, now) {
                        self.finish_trial(state, target, TrialOutcome::Hit, movement_time, now, &mut out)?;
                    }
                }
                TrialPhase::TrialEnd => {
                    if wait_elapsed(state, now) {
                        self.after_trial(state, now, &mut out);
                    }
                }
                TrialPhase::Pause => {
                    if wait_elapsed(state, now) {
                        self.resume(state, now, &mut out);
                    }
                }
                TrialPhase::Exit => {
                    if confirm_edge {
                        info!("exit confirmed by operator");
                        out.continue_loop = false;
                    }
                }
            }
        }

        state.previous_cursor = Some(cursor);
        if state.phase != from {
            out.transition = Some((from, state.phase));
        }
        Ok(out)
    }

    // ── transitions ─────────────────────────────────────────────────────────

    fn start_session(&mut self, state: &mut ExperimentState, now: f64, out: &mut StepOutcome) {
        info!(
            blocks = self.sequencer.len(),
            total_trials = self.sequencer.total_trials(),
            "session started"
        );
        state.message.clear();
        state.show_progress = true;
        state.targets.reset_statuses();
        state.targets.middle.status = TargetStatus::Approaching;
        out.recenter_cursor = true;
        out.block_started = Some(state.block_index);
        enter(state, TrialPhase::ApproachCenter, now);
    }

    /// Head for the side target the next reach starts from.
    fn approach_hold(&mut self, state: &mut ExperimentState, now: f64) {
        let side = self.hold_side;
        state.targets.middle.status = TargetStatus::Inactive;
        // A target still showing the last result keeps it until the hold ends.
        let hold = state.targets.side_mut(side);
        if hold.status == TargetStatus::Inactive {
            hold.status = TargetStatus::Active;
        }
        state.targets.side_mut(side.opposite()).status = TargetStatus::Approaching;
        enter(state, TrialPhase::ApproachAfterTrial(side), now);
    }

    fn begin_reach(&mut self, state: &mut ExperimentState, target: Side, now: f64) {
        let block = self.sequencer.current();
        let trial_index = state.counters.current_trial_index();
        let catch = block.catch_trial_indices.contains(&trial_index);
        let channel = !catch && block.channel_trial_indices.contains(&trial_index);
        let (amplification, mode) = if catch {
            (0.0, PerturbationMode::Free)
        } else if channel {
            (block.channel_amplification, PerturbationMode::PositionChannel)
        } else {
            (block.force_amplification, block.force_mode)
        };
        state.force.amplification = amplification;
        state.force.mode = mode;
        state.force.direction = block.direction;
        state.catch_trial = catch;
        state.channel_trial = channel;
        state.reach_started_at = Some(now);
        debug!(
            trial = trial_index,
            target = target.as_str(),
            amplification,
            mode = mode.as_str(),
            catch,
            channel,
            "reach armed"
        );
        enter(state, TrialPhase::Reach(target), now);
    }

    fn update_reach(
        &mut self,
        state: &mut ExperimentState,
        target: Side,
        now: f64,
        out: &mut StepOutcome,
    ) -> Result<(), LabError> {
        let circle = *state.targets.side(target);
        let cursor = state.cursor;
        let elapsed = now - state.reach_started_at.unwrap_or(now);

        if circle.contains(cursor) {
            if self.config.confirm_dwell {
                self.pending_hit = Some(elapsed);
                enter(state, TrialPhase::ConfirmDwell(target), now);
                state.wait_time = Some(self.config.confirm_hold);
                return Ok(());
            }
            return self.finish_trial(state, target, TrialOutcome::Hit, elapsed, now, out);
        }

        let overshot = match target {
            Side::Right => cursor.x > circle.center.x + circle.radius,
            Side::Left => cursor.x < circle.center.x - circle.radius,
        };
        if overshot {
            let from = state.previous_cursor.unwrap_or(cursor);
            let miss_distance = line_distance_to_point(from, cursor, circle.center);
            let outcome = if miss_distance < circle.radius {
                TrialOutcome::NearMiss
            } else {
                TrialOutcome::Miss
            };
            debug!(miss_distance, radius = circle.radius, outcome = outcome.as_str(), "overshoot");
            return self.finish_trial(state, target, outcome, elapsed, now, out);
        }

        if elapsed > self.config.max_movement_time {
            return self.finish_trial(state, target, TrialOutcome::Timeout, elapsed, now, out);
        }
        Ok(())
    }

    fn finish_trial(
        &mut self,
        state: &mut ExperimentState,
        target: Side,
        outcome: TrialOutcome,
        movement_time: f64,
        now: f64,
        out: &mut StepOutcome,
    ) -> Result<(), LabError> {
        let block = self.sequencer.current();
        let desired = block.desired_trial_time;
        let feedback_wait = self
            .config
            .feedback_duration
            .unwrap_or_else(|| block.state_wait_time_range.span());

        let trial_index = state.counters.current_trial_index();
        state.counters.consume(outcome.is_success())?;

        let timing = desired.classify(movement_time);
        let armed = state.force.amplification;
        state.force.amplification = 0.0;
        state.force.mode = PerturbationMode::Free;
        state.targets.side_mut(target).status = if outcome.is_success() {
            TargetStatus::Success
        } else {
            TargetStatus::Failure
        };
        state.timing_feedback = Some(timing);
        state.message = match timing {
            TimingFeedback::TooFast => "too fast".to_string(),
            TimingFeedback::TooSlow => "too slow".to_string(),
            TimingFeedback::OnTime => String::new(),
        };

        let report = TrialReport {
            block_index: state.block_index,
            trial_index,
            target,
            outcome,
            movement_time,
            timing,
            catch_trial: state.catch_trial,
            channel_trial: state.channel_trial,
            amplification: armed,
            score: state.counters.score(),
            remaining_trials: state.counters.remaining_trials(),
        };
        info!(
            block = report.block_index,
            trial = report.trial_index,
            target = target.as_str(),
            outcome = outcome.as_str(),
            movement_time,
            timing = timing.as_str(),
            score = report.score,
            remaining = report.remaining_trials,
            "trial complete"
        );

        self.hold_side = target;
        self.pending_hit = None;
        state.reach_started_at = None;
        state.last_report = Some(report);
        out.trial = Some(report);
        enter(state, TrialPhase::TrialEnd, now);
        state.wait_time = Some(feedback_wait);
        Ok(())
    }

    fn after_trial(&mut self, state: &mut ExperimentState, now: f64, out: &mut StepOutcome) {
        state.timing_feedback = None;
        state.message.clear();
        if state.counters.remaining_trials() == 0 {
            self.close_block(state, now, out);
            return;
        }
        if let Some(every) = self.sequencer.current().pause_frequency {
            if state.counters.completed() % every == 0 {
                info!(completed = state.counters.completed(), "rest pause");
                self.enter_pause(state, now);
                return;
            }
        }
        match self.config.trial_loop {
            TrialLoop::Reversal => self.approach_hold(state, now),
            TrialLoop::CenterOut => {
                state.targets.reset_statuses();
                state.targets.middle.status = TargetStatus::Approaching;
                enter(state, TrialPhase::ApproachCenter, now);
            }
        }
    }

    fn close_block(&mut self, state: &mut ExperimentState, now: f64, out: &mut StepOutcome) {
        state.force.amplification = 0.0;
        state.force.mode = PerturbationMode::Free;
        info!(block = state.block_index, score = state.counters.score(), "block complete");
        if self.sequencer.advance() {
            state.reload_pending = true;
            self.enter_pause(state, now);
        } else {
            state.targets.reset_statuses();
            state.message = EXIT_MESSAGE.to_string();
            state.show_progress = false;
            out.session_finished = true;
            info!(score = state.counters.score(), "session finished");
            enter(state, TrialPhase::Exit, now);
        }
    }

    fn enter_pause(&self, state: &mut ExperimentState, now: f64) {
        state.force.amplification = 0.0;
        state.force.mode = PerturbationMode::Free;
        state.message = PAUSE_MESSAGE.to_string();
        enter(state, TrialPhase::Pause, now);
        state.wait_time = Some(self.config.pause_duration);
    }

    fn resume(&mut self, state: &mut ExperimentState, now: f64, out: &mut StepOutcome) {
        if state.reload_pending {
            let block = self.sequencer.current();
            state.counters.reset_for_block(block.total_trials);
            state.force.direction = block.direction;
            state.block_index = self.sequencer.index();
            state.reload_pending = false;
            out.block_started = Some(state.block_index);
            out.recenter_cursor = true;
            info!(
                block = state.block_index,
                total_trials = block.total_trials,
                "block loaded"
            );
        }
        state.message.clear();
        state.targets.reset_statuses();
        state.targets.middle.status = TargetStatus::Approaching;
        enter(state, TrialPhase::ApproachCenter, now);
    }

    fn track_recording(&mut self, phase: TrialPhase, recording: bool) {
        if self.recording && !recording && phase != TrialPhase::AwaitStart {
            warn!(phase = %phase, "recording stopped mid-session");
        }
        self.recording = recording;
    }
}

fn enter(state: &mut ExperimentState, phase: TrialPhase, now: f64) {
    debug!(from = %state.phase, to = %phase, t = now, "phase transition");
    state.phase = phase;
    state.phase_started_at = now;
    state.wait_time = None;
}

fn wait_elapsed(state: &ExperimentState, now: f64) -> bool {
    state
        .wait_time
        .is_some_and(|wait| state.elapsed_in_phase(now) >= wait)
}

/// Strictly beyond the radius. The boundary itself counts as neither inside
/// nor outside.
fn outside(circle: &TargetCircle, point: Vec2) -> bool {
    circle.distance_to(point) > circle.radius
}

/// Force settings shared by every block of a session.
pub fn session_force(participant_weight: f64, max_velocity: f64, channel_sign: Direction) -> ForceParameters {
    ForceParameters {
        participant_weight,
        max_velocity,
        channel_sign,
        ..ForceParameters::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachlab_types::TimeWindow;
    use std::collections::BTreeSet;

    const LEFT: Vec2 = Vec2::new(-0.05, 0.0);
    const RIGHT: Vec2 = Vec2::new(0.05, 0.0);
    const FAR: Vec2 = Vec2::new(0.0, 0.5);

    fn block(trials: u32) -> BlockConfig {
        BlockConfig {
            force_amplification: 5.0,
            channel_amplification: 2.0,
            total_trials: trials,
            desired_trial_time: TimeWindow::new(0.25, 1.0),
            state_wait_time_range: TimeWindow::new(0.5, 0.5),
            catch_trial_indices: BTreeSet::new(),
            channel_trial_indices: BTreeSet::new(),
            pause_frequency: None,
            direction: Direction::Positive,
            force_mode: PerturbationMode::VelocityProportional,
        }
    }

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            center_hold: 1.0,
            confirm_dwell: false,
            pause_duration: 2.0,
            feedback_duration: Some(0.5),
            seed: Some(7),
            ..ProtocolConfig::default()
        }
    }

    struct Rig {
        sm: TrialStateMachine,
        state: ExperimentState,
        now: f64,
        outcomes: Vec<StepOutcome>,
    }

    impl Rig {
        fn new(config: ProtocolConfig, blocks: Vec<BlockConfig>) -> Self {
            let sm = TrialStateMachine::from_config(config, blocks).unwrap();
            let state = sm.initial_state(session_force(70.0, 1.0, Direction::Positive));
            Self {
                sm,
                state,
                now: 0.0,
                outcomes: Vec::new(),
            }
        }

        fn step_with(&mut self, cursor: Vec2, confirm: bool, dt: f64) -> &StepOutcome {
            self.now += dt;
            let input = StepInput {
                now: self.now,
                cursor,
                confirm,
                recording: true,
            };
            let out = self.sm.step(&mut self.state, &input).unwrap();
            self.outcomes.push(out);
            self.outcomes.last().unwrap()
        }

        fn step(&mut self, cursor: Vec2, dt: f64) -> &StepOutcome {
            self.step_with(cursor, false, dt)
        }

        /// AwaitStart → Ready → ApproachCenter.
        fn start(&mut self) {
            self.step(Vec2::ZERO, 0.0);
            assert_eq!(self.state.phase, TrialPhase::Ready);
            let out = self.step_with(Vec2::ZERO, true, 0.125).clone();
            assert!(out.recenter_cursor);
            assert_eq!(out.block_started, Some(0));
            assert_eq!(self.state.phase, TrialPhase::ApproachCenter);
            self.step_with(Vec2::ZERO, false, 0.125);
        }

        /// From the first side hold through to a right-side reach.
        fn reach_right_from_left(&mut self) {
            self.step(LEFT, 0.125);
            assert_eq!(self.state.phase, TrialPhase::Hold(Side::Left));
            self.step(LEFT, 0.5);
            assert_eq!(self.state.phase, TrialPhase::DepartHold(Side::Left));
            self.step(Vec2::new(-0.03, 0.0), 0.125);
            assert_eq!(self.state.phase, TrialPhase::Reach(Side::Right));
        }
    }

    #[test]
    fn waits_for_recording_then_confirm_edge() {
        let mut rig = Rig::new(config(), vec![block(2)]);
        let quiet = StepInput {
            now: 0.0,
            cursor: Vec2::ZERO,
            confirm: true,
            recording: false,
        };
        rig.sm.step(&mut rig.state, &quiet).unwrap();
        assert_eq!(rig.state.phase, TrialPhase::AwaitStart);
        assert_eq!(rig.state.message, AWAIT_RECORDING_MESSAGE);

        // Confirm held down across the gate opening is not a fresh press.
        rig.step_with(Vec2::ZERO, true, 0.125);
        assert_eq!(rig.state.phase, TrialPhase::Ready);
        assert_eq!(rig.state.message, READY_MESSAGE);
        rig.step_with(Vec2::ZERO, true, 0.125);
        assert_eq!(rig.state.phase, TrialPhase::Ready);
        rig.step_with(Vec2::ZERO, false, 0.125);
        rig.step_with(Vec2::ZERO, true, 0.125);
        assert_eq!(rig.state.phase, TrialPhase::ApproachCenter);
    }

    #[test]
    fn center_hold_advances_exactly_at_wait() {
        let mut rig = Rig::new(config(), vec![block(2)]);
        rig.start();
        assert_eq!(rig.state.phase, TrialPhase::HoldCenter);
        assert_eq!(rig.state.targets.middle.status, TargetStatus::Active);

        rig.step(Vec2::ZERO, 0.5);
        rig.step(Vec2::ZERO, 0.25);
        assert_eq!(rig.state.phase, TrialPhase::HoldCenter, "0.75 s < 1.0 s");
        rig.step(Vec2::ZERO, 0.25);
        assert_eq!(rig.state.phase, TrialPhase::ApproachAfterTrial(Side::Left));
        assert_eq!(rig.state.targets.left.status, TargetStatus::Active);
        assert_eq!(rig.state.targets.right.status, TargetStatus::Approaching);
        assert_eq!(rig.state.targets.middle.status, TargetStatus::Inactive);
    }

    #[test]
    fn leaving_center_restarts_hold() {
        let mut rig = Rig::new(config(), vec![block(2)]);
        rig.start();
        rig.step(Vec2::ZERO, 0.75);
        rig.step(FAR, 0.125);
        assert_eq!(rig.state.phase, TrialPhase::ApproachCenter);
        rig.step(Vec2::ZERO, 0.125);
        assert_eq!(rig.state.phase, TrialPhase::HoldCenter);
        rig.step(Vec2::ZERO, 0.75);
        assert_eq!(rig.state.phase, TrialPhase::HoldCenter, "timer restarted");
        rig.step(Vec2::ZERO, 0.25);
        assert!(matches!(rig.state.phase, TrialPhase::ApproachAfterTrial(_)));
    }

    #[test]
    fn side_hold_draws_within_range_every_visit() {
        let mut cfg = config();
        cfg.seed = Some(99);
        let mut b = block(4);
        b.state_wait_time_range = TimeWindow::new(0.5, 1.5);
        let mut rig = Rig::new(cfg, vec![b]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);

        let mut draws = Vec::new();
        for _ in 0..5 {
            rig.step(LEFT, 0.125);
            assert_eq!(rig.state.phase, TrialPhase::Hold(Side::Left));
            draws.push(rig.state.wait_time.unwrap());
            rig.step(FAR, 0.125);
            assert_eq!(rig.state.phase, TrialPhase::ApproachAfterTrial(Side::Left));
        }
        assert!(draws.iter().all(|d| (0.5..=1.5).contains(d)), "{draws:?}");
        assert!(draws.windows(2).any(|w| w[0] != w[1]), "fresh draw per visit: {draws:?}");
    }

    #[test]
    fn direct_hit_scores_and_reverses() {
        let mut rig = Rig::new(config(), vec![block(3)]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        assert_eq!(rig.state.force.amplification, 5.0);
        assert_eq!(rig.state.force.mode, PerturbationMode::VelocityProportional);

        let out = rig.step(RIGHT, 0.5).clone();
        let report = out.trial.expect("trial report");
        assert_eq!(report.outcome, TrialOutcome::Hit);
        assert_eq!(report.trial_index, 0);
        assert_eq!(report.movement_time, 0.5);
        assert_eq!(report.timing, TimingFeedback::OnTime);
        assert_eq!(rig.state.phase, TrialPhase::TrialEnd);
        assert_eq!(rig.state.counters.score(), 1);
        assert_eq!(rig.state.counters.remaining_trials(), 2);
        assert_eq!(rig.state.force.amplification, 0.0);
        assert_eq!(rig.state.targets.right.status, TargetStatus::Success);

        rig.step(RIGHT, 0.5);
        assert_eq!(rig.state.phase, TrialPhase::ApproachAfterTrial(Side::Right));
        assert_eq!(rig.state.targets.right.status, TargetStatus::Success, "result stays visible");
        rig.step(RIGHT, 0.125);
        assert_eq!(rig.state.phase, TrialPhase::Hold(Side::Right));
    }

    #[test]
    fn confirm_dwell_then_hit() {
        let mut cfg = config();
        cfg.confirm_dwell = true;
        cfg.confirm_hold = 0.25;
        let mut rig = Rig::new(cfg, vec![block(2)]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();

        rig.step(RIGHT, 0.5);
        assert_eq!(rig.state.phase, TrialPhase::ConfirmDwell(Side::Right));
        assert_eq!(rig.state.counters.remaining_trials(), 2, "not consumed yet");
        rig.step(RIGHT, 0.125);
        assert_eq!(rig.state.phase, TrialPhase::ConfirmDwell(Side::Right));
        let report = rig.step(RIGHT, 0.125).trial.unwrap();
        assert_eq!(report.outcome, TrialOutcome::Hit);
        assert_eq!(report.movement_time, 0.5, "time to target entry");
        assert_eq!(rig.state.counters.score(), 1);
    }

    #[test]
    fn fly_through_is_a_failure() {
        let mut cfg = config();
        cfg.confirm_dwell = true;
        let mut rig = Rig::new(cfg, vec![block(2)]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        rig.step(RIGHT, 0.5);
        let report = rig.step(Vec2::new(0.05, 0.05), 0.125).trial.unwrap();
        assert_eq!(report.outcome, TrialOutcome::FlyThrough);
        assert_eq!(rig.state.counters.score(), 0);
        assert_eq!(rig.state.counters.remaining_trials(), 1);
        assert_eq!(rig.state.targets.right.status, TargetStatus::Failure);
    }

    #[test]
    fn overshoot_line_crossing_near_miss_and_miss() {
        // Crossing 0.008 from the centre counts.
        let mut rig = Rig::new(config(), vec![block(2)]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        rig.step(Vec2::new(0.03, 0.008), 0.25);
        let report = rig.step(Vec2::new(0.07, 0.008), 0.25).trial.unwrap();
        assert_eq!(report.outcome, TrialOutcome::NearMiss);
        assert_eq!(rig.state.counters.score(), 1);

        // Crossing 0.02 away does not.
        let mut rig = Rig::new(config(), vec![block(2)]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        rig.step(Vec2::new(0.03, 0.02), 0.25);
        let report = rig.step(Vec2::new(0.07, 0.02), 0.25).trial.unwrap();
        assert_eq!(report.outcome, TrialOutcome::Miss);
        assert_eq!(rig.state.counters.score(), 0);
        assert_eq!(rig.state.counters.remaining_trials(), 1);
    }

    #[test]
    fn slow_reach_times_out_and_consumes_the_trial() {
        let mut rig = Rig::new(config(), vec![block(2)]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        rig.step(Vec2::ZERO, 1.0);
        rig.step(Vec2::ZERO, 1.0);
        assert_eq!(rig.state.phase, TrialPhase::Reach(Side::Right), "2.0 s is not over");
        let report = rig.step(Vec2::ZERO, 0.125).trial.unwrap();
        assert_eq!(report.outcome, TrialOutcome::Timeout);
        assert_eq!(report.timing, TimingFeedback::TooSlow);
        assert_eq!(rig.state.message, "too slow");
        assert_eq!(rig.state.counters.remaining_trials(), 1);
    }

    #[test]
    fn catch_trial_disarms_and_catch_beats_channel() {
        let mut b = block(2);
        b.catch_trial_indices = BTreeSet::from([0]);
        b.channel_trial_indices = BTreeSet::from([0, 1]);
        let mut rig = Rig::new(config(), vec![b]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        assert_eq!(rig.state.force.amplification, 0.0);
        assert_eq!(rig.state.force.mode, PerturbationMode::Free);
        assert!(rig.state.catch_trial);
        assert!(!rig.state.channel_trial);

        let report = rig.step(RIGHT, 0.5).trial.unwrap();
        assert!(report.catch_trial);
        assert_eq!(report.amplification, 0.0);

        // Trial 1: channel only, reaching back to the left.
        rig.step(RIGHT, 0.5);
        rig.step(RIGHT, 0.125);
        rig.step(RIGHT, 0.5);
        assert_eq!(rig.state.phase, TrialPhase::DepartHold(Side::Right));
        rig.step(Vec2::new(0.03, 0.0), 0.125);
        assert_eq!(rig.state.phase, TrialPhase::Reach(Side::Left));
        assert_eq!(rig.state.force.mode, PerturbationMode::PositionChannel);
        assert_eq!(rig.state.force.amplification, 2.0);
        assert!(rig.state.channel_trial);
    }

    #[test]
    fn pause_frequency_rests_without_reload() {
        let mut b = block(4);
        b.pause_frequency = Some(1);
        let mut rig = Rig::new(config(), vec![b]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        rig.step(RIGHT, 0.5);
        rig.step(RIGHT, 0.5);
        assert_eq!(rig.state.phase, TrialPhase::Pause);
        assert_eq!(rig.state.message, PAUSE_MESSAGE);
        assert!(!rig.state.reload_pending);

        rig.step(RIGHT, 1.0);
        assert_eq!(rig.state.phase, TrialPhase::Pause);
        let out = rig.step(RIGHT, 1.0).clone();
        assert_eq!(rig.state.phase, TrialPhase::ApproachCenter);
        assert_eq!(out.block_started, None);
        assert_eq!(rig.state.counters.remaining_trials(), 3, "counters untouched");
    }

    #[test]
    fn block_boundary_reloads_and_last_block_exits() {
        let mut second = block(1);
        second.force_amplification = 9.0;
        second.direction = Direction::Negative;
        let mut rig = Rig::new(config(), vec![block(1), second]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        rig.step(RIGHT, 0.5);
        rig.step(RIGHT, 0.5);
        assert_eq!(rig.state.phase, TrialPhase::Pause);
        assert!(rig.state.reload_pending);
        assert_eq!(rig.sm.sequencer().index(), 1);

        let out = rig.step(RIGHT, 2.0).clone();
        assert_eq!(rig.state.phase, TrialPhase::ApproachCenter);
        assert_eq!(out.block_started, Some(1));
        assert!(out.recenter_cursor);
        assert_eq!(rig.state.block_index, 1);
        assert_eq!(rig.state.counters.remaining_trials(), 1);
        assert_eq!(rig.state.counters.score(), 1, "score carries over");
        assert_eq!(rig.state.force.direction, Direction::Negative);
        assert!(rig.state.targets.right.status != TargetStatus::Success);

        // Second block: centre hold, then hold on the right and reach left.
        rig.step(Vec2::ZERO, 0.125);
        rig.step(Vec2::ZERO, 1.0);
        assert_eq!(rig.state.phase, TrialPhase::ApproachAfterTrial(Side::Right));
        rig.step(RIGHT, 0.125);
        rig.step(RIGHT, 0.5);
        rig.step(Vec2::new(0.03, 0.0), 0.125);
        assert_eq!(rig.state.phase, TrialPhase::Reach(Side::Left));
        assert_eq!(rig.state.force.amplification, 9.0);
        rig.step(LEFT, 0.5);
        let out = rig.step(LEFT, 0.5).clone();
        assert_eq!(rig.state.phase, TrialPhase::Exit);
        assert!(out.session_finished);
        assert_eq!(rig.state.message, EXIT_MESSAGE);

        // Exit holds until a confirm edge.
        assert!(rig.step(LEFT, 5.0).continue_loop);
        assert!(!rig.step_with(LEFT, true, 0.125).continue_loop);
    }

    #[test]
    fn center_out_returns_to_middle() {
        let mut cfg = config();
        cfg.trial_loop = TrialLoop::CenterOut;
        let mut rig = Rig::new(cfg, vec![block(3)]);
        rig.start();
        rig.step(Vec2::ZERO, 1.0);
        rig.reach_right_from_left();
        rig.step(RIGHT, 0.5);
        rig.step(RIGHT, 0.5);
        assert_eq!(rig.state.phase, TrialPhase::ApproachCenter);
        rig.step(Vec2::ZERO, 0.125);
        rig.step(Vec2::ZERO, 1.0);
        assert_eq!(rig.state.phase, TrialPhase::ApproachAfterTrial(Side::Right));
    }

    #[test]
    fn transitions_are_reported() {
        let mut rig = Rig::new(config(), vec![block(1)]);
        let out = rig.step(Vec2::ZERO, 0.0).clone();
        assert_eq!(out.transition, Some((TrialPhase::AwaitStart, TrialPhase::Ready)));
        let out = rig.step(Vec2::ZERO, 0.125).clone();
        assert_eq!(out.transition, None);
    }

    #[test]
    fn invalid_protocol_rejected() {
        let mut cfg = config();
        cfg.targets.left.center.x = 0.1;
        assert!(TrialStateMachine::<StdRng>::from_config(cfg, vec![block(1)]).is_err());

        let mut cfg = config();
        cfg.max_movement_time = 0.0;
        assert!(TrialStateMachine::<StdRng>::from_config(cfg, vec![block(1)]).is_err());

        assert!(TrialStateMachine::<StdRng>::from_config(config(), vec![]).is_err());
    }
}
