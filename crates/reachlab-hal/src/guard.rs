//! [`ActuatorGuard`] – zero-on-drop ownership of a force actuator.
//!
//! Whatever way the owning scope ends (normal return, `?` error, panic
//! unwind) the guard sends a final `0.0` command before the actuator and its
//! socket are released.

use reachlab_types::LabError;
use tracing::{error, info};

use crate::actuator::ForceActuator;

pub struct ActuatorGuard<A: ForceActuator> {
    inner: Option<A>,
}

impl<A: ForceActuator> ActuatorGuard<A> {
    pub fn new(actuator: A) -> Self {
        Self {
            inner: Some(actuator),
        }
    }

    pub fn get_ref(&self) -> Option<&A> {
        self.inner.as_ref()
    }

    /// Send a zero command and hand the actuator back. The guard is consumed,
    /// so the drop path does not zero a second time.
    ///
    /// # Errors
    ///
    /// Returns the actuator's error when the zero command fails.
    pub fn release(mut self) -> Result<A, LabError> {
        let mut actuator = self.inner.take().ok_or_else(|| LabError::Actuator {
            component: "guard".to_string(),
            details: "actuator already released".to_string(),
        })?;
        actuator.send(0.0)?;
        info!(actuator = actuator.id(), "actuator released at zero force");
        Ok(actuator)
    }
}

impl<A: ForceActuator> ForceActuator for ActuatorGuard<A> {
    fn id(&self) -> &str {
        self.inner.as_ref().map_or("released", |a| a.id())
    }

    fn send(&mut self, force: f64) -> Result<(), LabError> {
        match self.inner.as_mut() {
            Some(actuator) => actuator.send(force),
            None => Err(LabError::Actuator {
                component: "guard".to_string(),
                details: "actuator already released".to_string(),
            }),
        }
    }

    fn last_command(&self) -> f64 {
        self.inner.as_ref().map_or(0.0, |a| a.last_command())
    }
}

impl<A: ForceActuator> Drop for ActuatorGuard<A> {
    fn drop(&mut self) {
        if let Some(actuator) = self.inner.as_mut() {
            if let Err(e) = actuator.send(0.0) {
                error!(actuator = actuator.id(), error = %e, "failed to zero actuator on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimActuator;

    #[test]
    fn drop_sends_zero() {
        let act = SimActuator::new("force_motor");
        let history = act.history();
        {
            let mut guard = ActuatorGuard::new(act);
            guard.send(3.0).unwrap();
        }
        assert_eq!(history.snapshot(), vec![3.0, 0.0]);
    }

    #[test]
    fn release_zeroes_once() {
        let act = SimActuator::new("force_motor");
        let history = act.history();
        let mut guard = ActuatorGuard::new(act);
        guard.send(-2.0).unwrap();
        let act = guard.release().unwrap();
        assert_eq!(act.last_command(), 0.0);
        drop(act);
        assert_eq!(history.snapshot(), vec![-2.0, 0.0]);
    }

    #[test]
    fn zero_sent_during_panic_unwind() {
        let act = SimActuator::new("force_motor");
        let history = act.history();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut guard = ActuatorGuard::new(act);
            guard.send(5.0).unwrap();
            panic!("control fault");
        }));
        assert!(result.is_err());
        assert_eq!(history.last(), Some(0.0));
    }
}
