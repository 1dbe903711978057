//! Generic `ForceActuator` trait for the haptic/force device.
//!
//! Drivers implement this trait; the loop driver sends one scalar command per
//! iteration and never waits for an acknowledgement.

use reachlab_types::LabError;

/// A force-controlled device receiving one command per loop iteration.
pub trait ForceActuator: Send {
    /// Stable identifier for this actuator, e.g. `"force_motor"`.
    fn id(&self) -> &str;

    /// Emit `force` (newtons). Fire-and-forget: no acknowledgement, no retry.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Actuator`] when the command cannot be handed to
    /// the transport (e.g. the socket is closed).
    fn send(&mut self, force: f64) -> Result<(), LabError>;

    /// The most recently sent command.
    fn last_command(&self) -> f64;
}

impl<A: ForceActuator + ?Sized> ForceActuator for Box<A> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn send(&mut self, force: f64) -> Result<(), LabError> {
        (**self).send(force)
    }

    fn last_command(&self) -> f64 {
        (**self).last_command()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-process actuator used only for tests.
    struct MockActuator {
        last: f64,
    }

    impl ForceActuator for MockActuator {
        fn id(&self) -> &str {
            "mock"
        }

        fn send(&mut self, force: f64) -> Result<(), LabError> {
            self.last = force;
            Ok(())
        }

        fn last_command(&self) -> f64 {
            self.last
        }
    }

    #[test]
    fn boxed_actuator_forwards() {
        let mut act: Box<dyn ForceActuator> = Box::new(MockActuator { last: 0.0 });
        act.send(1.5).unwrap();
        assert_eq!(act.id(), "mock");
        assert!((act.last_command() - 1.5).abs() < f64::EPSILON);
    }
}
