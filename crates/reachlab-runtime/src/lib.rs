//! `reachlab-runtime` – the experiment engine.
//!
//! Ties the hardware edge, derived kinematics, safety gate, event bus and
//! session log together into one fixed-rate loop driven by the trial
//! protocol.
//!
//! # Modules
//!
//! - [`state_machine`] – [`TrialStateMachine`]: the reaching protocol over an
//!   explicit [`ExperimentState`], with seedable dwell draws, catch/channel
//!   trial overrides and block boundaries.
//! - [`sequencer`] – [`BlockSequencer`]: the ordered, validated block list.
//! - [`control_loop`] – [`ControlLoop`]: acquire → derive → step → act →
//!   record, paced by the kernel's timing monitor.
//! - [`record`] – the fixed-column per-iteration log record.
//! - [`calibration`] – [`Calibrator`]: standing calibration from still
//!   recordings (quiet stance and stability limits) with movement
//!   rejection.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with optional
//!   OTLP export.
//!
//! # Force path
//!
//! Every command leaves through [`ForceGate`] and an
//! [`ActuatorGuard`](reachlab_hal::ActuatorGuard): non-finite values become
//! zero, magnitudes are capped, and the actuator is zeroed on exit, on a
//! fatal error and on drop.

pub mod calibration;
pub mod control_loop;
pub mod record;
pub mod sequencer;
pub mod state_machine;
pub mod telemetry;

pub use calibration::{
    CalibrationOperator, CalibrationSettings, Calibrator, LeanDirection, StabilityLimits,
    StanceCalibration,
};
pub use control_loop::{
    ConfirmLatch, ControlLoop, LoopConfig, OperatorInput, SessionSummary, TickReport,
};
pub use sequencer::BlockSequencer;
pub use state_machine::{
    ExperimentState, ProtocolConfig, StepInput, StepOutcome, TargetLayout, TrialLoop,
    TrialStateMachine, session_force,
};
pub use telemetry::{TracerProviderGuard, init_tracing};

pub use reachlab_kernel::ForceGate;
