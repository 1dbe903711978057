//! In-process drivers for headless runs and tests.
//!
//! [`SimActuator`] records every command it receives; [`ScriptedSource`]
//! replays a fixed list of frames (with `None` entries standing for dropped
//! frames). Together they let the whole loop run without lab hardware.
//!
//! # Example
//!
//! ```rust
//! use reachlab_hal::ForceActuator;
//! use reachlab_hal::sim::SimActuator;
//!
//! let mut act = SimActuator::new("force_motor");
//! let history = act.history();
//! act.send(1.25).unwrap();
//! act.send(0.0).unwrap();
//! assert_eq!(history.snapshot(), vec![1.25, 0.0]);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use reachlab_types::{LabError, Vec3};

use crate::actuator::ForceActuator;
use crate::sensor::KinematicSource;

// ────────────────────────────────────────────────────────────────────────────
// Stub actuator
// ────────────────────────────────────────────────────────────────────────────

/// Shared, cloneable view of the commands a [`SimActuator`] received.
#[derive(Debug, Clone, Default)]
pub struct CommandHistory(Arc<Mutex<Vec<f64>>>);

impl CommandHistory {
    fn push(&self, force: f64) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(force);
    }

    /// Copy of every command sent so far, oldest first.
    pub fn snapshot(&self) -> Vec<f64> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<f64> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last()
            .copied()
    }
}

/// A simulated force actuator that records every command. Always succeeds.
#[derive(Debug)]
pub struct SimActuator {
    id: String,
    last: f64,
    history: CommandHistory,
}

impl SimActuator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last: 0.0,
            history: CommandHistory::default(),
        }
    }

    /// Handle that stays readable after the actuator is moved into a loop.
    pub fn history(&self) -> CommandHistory {
        self.history.clone()
    }
}

impl ForceActuator for SimActuator {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&mut self, force: f64) -> Result<(), LabError> {
        self.last = force;
        self.history.push(force);
        Ok(())
    }

    fn last_command(&self) -> f64 {
        self.last
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scripted kinematic source
// ────────────────────────────────────────────────────────────────────────────

/// Replays a queue of frames; an exhausted queue reports missed frames.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    frames: VecDeque<Option<(Vec3, f64)>>,
    center_of_pressure: Option<Vec3>,
}

impl ScriptedSource {
    pub fn new(frames: impl IntoIterator<Item = Option<(Vec3, f64)>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            center_of_pressure: None,
        }
    }

    /// Build a source from evenly spaced positions starting at `t = 0`.
    pub fn from_positions(positions: impl IntoIterator<Item = Vec3>, period: f64) -> Self {
        Self::new(
            positions
                .into_iter()
                .enumerate()
                .map(|(i, p)| Some((p, i as f64 * period))),
        )
    }

    pub fn with_center_of_pressure(mut self, cop: Vec3) -> Self {
        self.center_of_pressure = Some(cop);
        self
    }

    pub fn push(&mut self, frame: Option<(Vec3, f64)>) {
        self.frames.push_back(frame);
    }

    /// Frames not yet consumed.
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl KinematicSource for ScriptedSource {
    fn id(&self) -> &str {
        "scripted"
    }

    fn poll(&mut self) -> Result<Option<(Vec3, f64)>, LabError> {
        Ok(self.frames.pop_front().flatten())
    }

    fn center_of_pressure(&self) -> Option<Vec3> {
        self.center_of_pressure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_actuator_records_commands() {
        let mut act = SimActuator::new("force_motor");
        let history = act.history();
        act.send(2.0).unwrap();
        act.send(-1.0).unwrap();
        assert_eq!(act.id(), "force_motor");
        assert_eq!(act.last_command(), -1.0);
        assert_eq!(history.snapshot(), vec![2.0, -1.0]);
        assert_eq!(history.last(), Some(-1.0));
    }

    #[test]
    fn scripted_source_replays_then_misses() {
        let mut src = ScriptedSource::from_positions([Vec3::ZERO, Vec3::new(0.01, 0.0, 0.0)], 0.01);
        assert_eq!(src.poll().unwrap(), Some((Vec3::ZERO, 0.0)));
        assert_eq!(src.poll().unwrap(), Some((Vec3::new(0.01, 0.0, 0.0), 0.01)));
        assert_eq!(src.poll().unwrap(), None);
        assert_eq!(src.remaining(), 0);
    }
}
