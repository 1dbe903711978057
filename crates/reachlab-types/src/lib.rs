//! `reachlab-types` – shared data model for the ReachLab workspace.
//!
//! Every other crate speaks in these types: kinematic samples coming from the
//! sensor side, target geometry and trial bookkeeping owned by the trial state
//! machine, force-law parameters consumed by the controller, block
//! configuration loaded at session start, and the [`Event`] envelope routed
//! over the middleware bus.
//!
//! # Modules
//!
//! - [`geometry`] – [`Vec2`] / [`Vec3`] value types.
//! - [`experiment`] – targets, counters, force parameters, block config and
//!   the closed [`TrialPhase`] enumeration.
//! - [`event`] – bus envelope and payloads.

pub mod event;
pub mod experiment;
pub mod geometry;

pub use event::{Event, EventPayload};
pub use experiment::{
    BlockConfig, Direction, ForceParameters, KinematicSample, PerturbationMode, Side,
    TargetCircle, TargetId, TargetSet, TargetStatus, TimeWindow, TimingFeedback, TrialCounters,
    TrialOutcome, TrialPhase, TrialReport,
};
pub use geometry::{Vec2, Vec3};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workspace-wide error type.
///
/// Variants follow the failure classes of the experiment loop: configuration
/// problems stop the session before it starts, protocol and log-schema
/// violations are fatal mid-session, sensor and actuator faults come from the
/// hardware edge.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Sensor Error: {0}")]
    Sensor(String),

    #[error("Actuator Fault on {component}: {details}")]
    Actuator { component: String, details: String },

    #[error("Protocol Violation: {0}")]
    ProtocolViolation(String),

    #[error("Log column set changed: expected {expected:?}, found {found:?}")]
    LogSchema {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Channel Error: {0}")]
    Channel(String),
}

impl LabError {
    /// `true` for the failure classes that must stop data collection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LabError::Sensor(_) | LabError::Channel(_))
    }
}
