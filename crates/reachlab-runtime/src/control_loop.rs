//! [`ControlLoop`] – the fixed-rate experiment loop.
//!
//! One iteration, in order:
//!
//! 1. **Acquire** – poll the [`KinematicSource`] with a bounded retry,
//!    reusing the previous frame when every retry misses.
//! 2. **Derive** – finite-difference velocity and the smoothed workspace
//!    cursor. A stale frame restarts the velocity window.
//! 3. **Step** – drain the recording gate, read the operator input and step
//!    the [`TrialStateMachine`] on the shared [`ExperimentState`].
//! 4. **Act** – measure the hand's deviation from the left–right path in
//!    the (possibly just recalibrated) workspace frame, evaluate the force
//!    law with the amplification the state machine just set, pass it
//!    through the [`ForceGate`] and send it.
//! 5. **Record** – append the iteration (and any trial report) to the
//!    session log and publish protocol events on the bus.
//!
//! [`ControlLoop::run`] repeats this and sleeps out the rest of each period.
//! The loop clock is the sensor timestamp, so a trace replayed through
//! [`ControlLoop::tick`] behaves exactly as it did live.
//!
//! # Stopping
//!
//! The loop ends when the operator confirms on the exit screen, when the
//! shutdown flag is raised (Ctrl-C), or on the first fatal error. In every
//! case the actuator is commanded to zero before `run` returns, and the
//! [`ActuatorGuard`] zeroes it again when the loop is dropped.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use reachlab_hal::{ActuatorGuard, ForceActuator, KinematicSource, acquire_frame, compute_force};
use reachlab_kernel::{ForceGate, TimingMonitor, TimingStats};
use reachlab_memory::SessionLog;
use reachlab_middleware::{EventBus, RecordingGate, Topic};
use reachlab_perception::cursor::CursorMapper;
use reachlab_perception::geometry::signed_line_offset;
use reachlab_perception::velocity::VelocityEstimator;
use reachlab_types::{Event, EventPayload, KinematicSample, LabError, TrialPhase, Vec3};
use tracing::{debug, error, info, warn};

use crate::record::{IterationSample, iteration_record};
use crate::state_machine::{ExperimentState, StepInput, StepOutcome, TrialStateMachine};

const SOURCE: &str = "reachlab-runtime::control_loop";
const HAND_CHANNEL: &str = "hand";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Loop-level settings. Protocol settings live in
/// [`ProtocolConfig`](crate::state_machine::ProtocolConfig).
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub frequency_hz: f64,
    /// Extra polls allowed when a frame is missing.
    pub frame_retry_limit: u32,
    /// Samples in the velocity window.
    pub velocity_window: usize,
    pub cursor_gain: f64,
    /// Samples in the cursor moving average.
    pub cursor_smoothing: usize,
    /// Hold the protocol in `AwaitStart` until the capture system reports
    /// that it is recording.
    pub require_recording: bool,
    /// Magnitude cap applied by the force gate, in newtons.
    pub max_force: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100.0,
            frame_retry_limit: 3,
            velocity_window: 5,
            cursor_gain: 1.0,
            cursor_smoothing: 1,
            require_recording: false,
            max_force: 50.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator input
// ─────────────────────────────────────────────────────────────────────────────

/// The operator's confirm button.
pub trait OperatorInput: Send {
    /// Level of the confirm input at loop time `now`.
    fn confirm(&mut self, now: f64) -> bool;
}

/// A confirm press latched by another thread (a stdin reader, a UI) and
/// consumed by the first iteration that reads it.
#[derive(Debug, Clone, Default)]
pub struct ConfirmLatch(Arc<AtomicBool>);

impl ConfirmLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl OperatorInput for ConfirmLatch {
    fn confirm(&mut self, _now: f64) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// What one [`ControlLoop::tick`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub continue_loop: bool,
    pub phase: TrialPhase,
    /// Command sent to the actuator.
    pub force: f64,
    /// No frame has arrived yet; the protocol was not stepped.
    pub idle: bool,
    pub stale_frame: bool,
    pub outcome: StepOutcome,
}

/// End-of-session summary returned by [`ControlLoop::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub score: u32,
    pub trials_completed: u32,
    pub total_trials: u32,
    /// `true` when the protocol reached `Exit`.
    pub finished: bool,
    pub timing: TimingStats,
    pub force_interventions: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct ControlLoop<S, A, R = StdRng>
where
    S: KinematicSource,
    A: ForceActuator,
{
    source: S,
    actuator: ActuatorGuard<A>,
    operator: Box<dyn OperatorInput>,
    machine: TrialStateMachine<R>,
    state: ExperimentState,
    velocity: VelocityEstimator,
    cursor: CursorMapper,
    gate: ForceGate,
    timing: TimingMonitor,
    recording: Option<RecordingGate>,
    bus: EventBus,
    log: Option<SessionLog>,
    shutdown: Arc<AtomicBool>,
    retry_limit: u32,
    last_frame: Option<(Vec3, f64)>,
    iteration: u64,
    trials_completed: u32,
}

impl<S, A, R> ControlLoop<S, A, R>
where
    S: KinematicSource,
    A: ForceActuator,
    R: Rng,
{
    /// Wire a loop. `state` is normally
    /// [`TrialStateMachine::initial_state`].
    ///
    /// The recording gate subscribes to `bus` here, so capture notifications
    /// published after construction are seen by the first iteration.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Config`] for a non-positive loop frequency or an
    /// invalid cursor gain.
    pub fn new(
        config: &LoopConfig,
        source: S,
        actuator: A,
        machine: TrialStateMachine<R>,
        state: ExperimentState,
        bus: EventBus,
    ) -> Result<Self, LabError> {
        if !(config.max_force.is_finite() && config.max_force > 0.0) {
            return Err(LabError::Config(format!(
                "max_force must be > 0, got {}",
                config.max_force
            )));
        }
        let timing = TimingMonitor::from_frequency(config.frequency_hz)?;
        let cursor = CursorMapper::new(config.cursor_gain, config.cursor_smoothing)?;
        let recording = config.require_recording.then(|| RecordingGate::new(&bus));
        Ok(Self {
            source,
            actuator: ActuatorGuard::new(actuator),
            operator: Box::new(ConfirmLatch::new()),
            machine,
            state,
            velocity: VelocityEstimator::new(config.velocity_window),
            cursor,
            gate: ForceGate::with_cap(config.max_force),
            timing,
            recording,
            bus,
            log: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            retry_limit: config.frame_retry_limit,
            last_frame: None,
            iteration: 0,
            trials_completed: 0,
        })
    }

    pub fn with_operator(mut self, operator: Box<dyn OperatorInput>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_log(mut self, log: SessionLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Share an externally owned shutdown flag (e.g. set by a Ctrl-C handler).
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> &ExperimentState {
        &self.state
    }

    pub fn machine(&self) -> &TrialStateMachine<R> {
        &self.machine
    }

    pub fn log(&self) -> Option<&SessionLog> {
        self.log.as_ref()
    }

    pub fn period(&self) -> Duration {
        self.timing.period()
    }

    /// Run one iteration. On error the actuator has already been commanded
    /// to zero.
    ///
    /// # Errors
    ///
    /// Forwards protocol violations, log schema changes, storage failures,
    /// actuator faults and non-transient sensor errors. All of them are
    /// fatal to the session.
    pub fn tick(&mut self) -> Result<TickReport, LabError> {
        match self.tick_inner() {
            Ok(report) => Ok(report),
            Err(e) => {
                self.zero_actuator();
                Err(e)
            }
        }
    }

    fn tick_inner(&mut self) -> Result<TickReport, LabError> {
        self.iteration += 1;

        let frame = match acquire_frame(&mut self.source, self.retry_limit, self.last_frame) {
            Ok(frame) => frame,
            Err(LabError::Sensor(reason)) => {
                debug!(%reason, "no frame yet, holding force at zero");
                self.actuator.send(0.0)?;
                return Ok(TickReport {
                    continue_loop: true,
                    phase: self.state.phase,
                    force: 0.0,
                    idle: true,
                    stale_frame: false,
                    outcome: StepOutcome::default(),
                });
            }
            Err(e) => return Err(e),
        };
        self.last_frame = Some((frame.position, frame.timestamp));
        let now = frame.timestamp;

        let cbos = self.source.center_of_pressure();
        let velocity = if frame.stale {
            self.velocity.reset();
            Vec3::ZERO
        } else {
            self.velocity.update(HAND_CHANNEL, frame.position, now)
        };
        let cursor = self.cursor.map(frame.position, cbos);
        let recording = match self.recording.as_mut() {
            Some(gate) => gate.poll(),
            None => true,
        };
        let confirm = self.operator.confirm(now);

        let input = StepInput {
            now,
            cursor,
            confirm,
            recording,
        };
        let outcome = self.machine.step(&mut self.state, &input)?;
        if outcome.recenter_cursor {
            self.cursor
                .recalibrate(frame.position, cbos, self.state.targets.middle.center);
        }
        if outcome.trial.is_some() {
            self.trials_completed += 1;
        }

        let kinematics = KinematicSample {
            position: frame.position,
            velocity,
            timestamp: now,
            com: None,
            cbos,
            path_deviation: self.path_deviation(frame.position, cbos),
        };
        let force = self.gate.filter(compute_force(&kinematics, &self.state.force));
        self.actuator.send(force)?;

        if let Some(log) = self.log.as_mut() {
            let sample = IterationSample {
                iteration: self.iteration,
                kinematics: &kinematics,
                cursor,
                force,
                recording,
                stale_frame: frame.stale,
            };
            log.append(&iteration_record(&sample, &self.state))?;
            if let Some(report) = &outcome.trial {
                log.append_trial(report)?;
            }
        }
        self.publish(&outcome);

        Ok(TickReport {
            continue_loop: outcome.continue_loop,
            phase: self.state.phase,
            force,
            idle: false,
            stale_frame: frame.stale,
            outcome,
        })
    }

    /// Iterate at the configured rate until the operator leaves the exit
    /// screen or shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error from [`ControlLoop::tick`], after the
    /// actuator has been zeroed and a fault published on
    /// [`Topic::Alerts`].
    pub fn run(&mut self) -> Result<SessionSummary, LabError> {
        info!(
            period_ms = self.timing.period().as_secs_f64() * 1e3,
            source = self.source.id(),
            actuator = self.actuator.id(),
            "control loop started"
        );
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                warn!(phase = %self.state.phase, "shutdown requested, stopping loop");
                break;
            }
            let started = self.timing.begin();
            match self.tick() {
                Ok(report) if !report.continue_loop => break,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, phase = %self.state.phase, "fatal loop error");
                    self.raise_fault(&e);
                    return Err(e);
                }
            }
            let sleep = self.timing.finish(started.elapsed());
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }
        self.zero_actuator();

        let summary = self.summary();
        info!(
            score = summary.score,
            trials = summary.trials_completed,
            total = summary.total_trials,
            finished = summary.finished,
            overruns = summary.timing.overruns,
            interventions = summary.force_interventions,
            "control loop stopped"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            score: self.state.counters.score(),
            trials_completed: self.trials_completed,
            total_trials: self.machine.sequencer().total_trials(),
            finished: self.state.phase == TrialPhase::Exit,
            timing: self.timing.stats(),
            force_interventions: self.gate.interventions(),
        }
    }

    /// Signed distance of the hand from the left→right target path, in
    /// metres of hand travel.
    fn path_deviation(&self, position: Vec3, cbos: Option<Vec3>) -> f64 {
        let targets = &self.state.targets;
        let workspace = self.cursor.workspace(position, cbos);
        signed_line_offset(targets.left.center, targets.right.center, workspace) / self.cursor.gain()
    }

    fn zero_actuator(&mut self) {
        if let Err(e) = self.actuator.send(0.0) {
            error!(error = %e, "failed to zero actuator");
        }
    }

    fn publish(&self, outcome: &StepOutcome) {
        if self.bus.receiver_count(Topic::Protocol) == 0 {
            return;
        }
        let mut payloads = Vec::new();
        if let Some((from, to)) = outcome.transition {
            payloads.push(EventPayload::PhaseChanged { from, to });
        }
        if let Some(block_index) = outcome.block_started {
            payloads.push(EventPayload::BlockStarted {
                block_index,
                total_trials: self.state.counters.total_trials(),
            });
        }
        if let Some(report) = outcome.trial {
            payloads.push(EventPayload::TrialCompleted(report));
        }
        if outcome.session_finished {
            payloads.push(EventPayload::SessionFinished {
                score: self.state.counters.score(),
                total_trials: self.machine.sequencer().total_trials(),
            });
        }
        for payload in payloads {
            if let Err(e) = self.bus.publish_to(Topic::Protocol, Event::new(SOURCE, payload)) {
                debug!(error = %e, "protocol event dropped");
            }
        }
    }

    fn raise_fault(&self, err: &LabError) {
        if self.bus.receiver_count(Topic::Alerts) == 0 {
            return;
        }
        let payload = EventPayload::Fault {
            component: SOURCE.to_string(),
            message: err.to_string(),
        };
        if let Err(e) = self.bus.publish_to(Topic::Alerts, Event::new(SOURCE, payload)) {
            debug!(error = %e, "fault alert dropped");
        }
    }
}
