//! The per-iteration log record.
//!
//! Every iteration writes the same columns, whatever the phase; values that
//! do not apply (no reference point, no trial in progress) are written as
//! NaN or zero rather than omitted, because the session log rejects a
//! changed column set.

use reachlab_memory::LogRecord;
use reachlab_types::{KinematicSample, Vec2};

use crate::state_machine::ExperimentState;

/// What the loop knows about one iteration besides the protocol state.
#[derive(Debug, Clone, Copy)]
pub struct IterationSample<'a> {
    pub iteration: u64,
    pub kinematics: &'a KinematicSample,
    pub cursor: Vec2,
    /// Command actually sent, after the safety gate.
    pub force: f64,
    pub recording: bool,
    pub stale_frame: bool,
}

pub fn iteration_record(sample: &IterationSample<'_>, state: &ExperimentState) -> LogRecord {
    let k = sample.kinematics;
    let mut record = LogRecord::new();
    record
        .integer("iteration", i64::try_from(sample.iteration).unwrap_or(i64::MAX))
        .real("time", k.timestamp)
        .text("phase", state.phase.name())
        .integer("block", i64::try_from(state.block_index).unwrap_or(i64::MAX))
        .integer("trial_index", i64::from(state.counters.current_trial_index()))
        .integer("remaining_trials", i64::from(state.counters.remaining_trials()))
        .real("remaining_perc", state.counters.remaining_perc())
        .integer("score", i64::from(state.counters.score()))
        .vec3("position", k.position)
        .vec3("velocity", k.velocity)
        .opt_vec3("com", k.com)
        .opt_vec3("cbos", k.cbos)
        .vec2("cursor", sample.cursor)
        .real("path_deviation", k.path_deviation)
        .real("amplification", state.force.amplification)
        .text("force_mode", state.force.mode.as_str())
        .real("force", sample.force)
        .flag("recording", sample.recording)
        .flag("stale_frame", sample.stale_frame)
        .flag("catch_trial", state.catch_trial)
        .flag("channel_trial", state.channel_trial)
        .text("middle_status", state.targets.middle.status.as_str())
        .text("left_status", state.targets.left.status.as_str())
        .text("right_status", state.targets.right.status.as_str())
        .text("message", state.message.as_str());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{ProtocolConfig, TrialStateMachine, session_force};
    use reachlab_memory::LogValue;
    use reachlab_types::{BlockConfig, Direction, PerturbationMode, TimeWindow, TrialPhase, Vec3};

    fn state() -> ExperimentState {
        let block = BlockConfig {
            force_amplification: 1.0,
            channel_amplification: 0.0,
            total_trials: 4,
            desired_trial_time: TimeWindow::new(0.4, 0.8),
            state_wait_time_range: TimeWindow::new(0.5, 1.0),
            catch_trial_indices: Default::default(),
            channel_trial_indices: Default::default(),
            pause_frequency: None,
            direction: Direction::Positive,
            force_mode: PerturbationMode::VelocityProportional,
        };
        let config = ProtocolConfig {
            seed: Some(1),
            ..ProtocolConfig::default()
        };
        let sm = TrialStateMachine::from_config(config, vec![block]).unwrap();
        sm.initial_state(session_force(60.0, 1.0, Direction::Positive))
    }

    #[test]
    fn column_set_is_independent_of_phase() {
        let kinematics = KinematicSample {
            position: Vec3::new(0.1, 0.2, 1.0),
            timestamp: 3.5,
            ..KinematicSample::default()
        };
        let sample = IterationSample {
            iteration: 7,
            kinematics: &kinematics,
            cursor: Vec2::new(0.01, 0.0),
            force: 0.0,
            recording: true,
            stale_frame: false,
        };
        let mut s = state();
        let first = iteration_record(&sample, &s);

        s.phase = TrialPhase::Pause;
        s.message = "Pause".into();
        let with_cbos = KinematicSample {
            cbos: Some(Vec3::new(0.0, 0.0, 0.0)),
            ..kinematics
        };
        let second = iteration_record(
            &IterationSample {
                kinematics: &with_cbos,
                ..sample
            },
            &s,
        );
        assert_eq!(first.columns(), second.columns());
    }

    #[test]
    fn values_follow_state() {
        let kinematics = KinematicSample::default();
        let s = state();
        let record = iteration_record(
            &IterationSample {
                iteration: 1,
                kinematics: &kinematics,
                cursor: Vec2::ZERO,
                force: 2.5,
                recording: false,
                stale_frame: true,
            },
            &s,
        );
        assert_eq!(record.get("phase"), Some(&LogValue::Text("await_start".into())));
        assert_eq!(record.get("remaining_trials"), Some(&LogValue::Integer(4)));
        assert_eq!(record.get("force"), Some(&LogValue::Real(2.5)));
        assert_eq!(record.get("stale_frame"), Some(&LogValue::Integer(1)));
        assert_eq!(record.get("path_deviation"), Some(&LogValue::Real(0.0)));
        assert!(matches!(record.get("cbos_0"), Some(LogValue::Real(v)) if v.is_nan()));
    }
}
