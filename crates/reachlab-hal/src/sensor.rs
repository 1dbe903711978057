//! Kinematic source trait and bounded frame acquisition.
//!
//! A motion-capture driver may drop frames. [`acquire_frame`] retries a
//! missed frame immediately, a bounded number of times, and falls back to the
//! last good frame so one bad frame never stalls the fixed-rate loop.

use std::collections::HashMap;

use reachlab_types::{LabError, Vec3};
use tracing::{debug, warn};

/// A source of tracked-point positions (metres) stamped in seconds.
pub trait KinematicSource: Send {
    /// Stable identifier, e.g. `"mocap_relay"`.
    fn id(&self) -> &str;

    /// Non-blocking poll for the next frame. `Ok(None)` is a missed frame.
    ///
    /// # Errors
    ///
    /// [`LabError::Sensor`] is a transient fault and is retried; any other
    /// error aborts acquisition.
    fn poll(&mut self) -> Result<Option<(Vec3, f64)>, LabError>;

    /// All named markers of the last frame, when the driver exposes them.
    fn marker_positions(&self) -> HashMap<String, Vec3> {
        HashMap::new()
    }

    /// Centre of pressure from a force plate, when one is attached.
    fn center_of_pressure(&self) -> Option<Vec3> {
        None
    }
}

impl<S: KinematicSource + ?Sized> KinematicSource for Box<S> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn poll(&mut self) -> Result<Option<(Vec3, f64)>, LabError> {
        (**self).poll()
    }

    fn marker_positions(&self) -> HashMap<String, Vec3> {
        (**self).marker_positions()
    }

    fn center_of_pressure(&self) -> Option<Vec3> {
        (**self).center_of_pressure()
    }
}

/// Result of one [`acquire_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAcquisition {
    pub position: Vec3,
    pub timestamp: f64,
    /// Polls that came back empty before this frame.
    pub retries: u32,
    /// `true` when every retry failed and the previous frame was reused.
    pub stale: bool,
}

/// Poll `source` up to `1 + retry_limit` times.
///
/// # Errors
///
/// Returns [`LabError::Sensor`] when no frame arrived and there is no
/// previous frame to reuse, and forwards any non-sensor error from the
/// driver.
pub fn acquire_frame<S: KinematicSource + ?Sized>(
    source: &mut S,
    retry_limit: u32,
    last: Option<(Vec3, f64)>,
) -> Result<FrameAcquisition, LabError> {
    let mut retries = 0;
    loop {
        match source.poll() {
            Ok(Some((position, timestamp))) if position.is_finite() && timestamp.is_finite() => {
                return Ok(FrameAcquisition {
                    position,
                    timestamp,
                    retries,
                    stale: false,
                });
            }
            Ok(Some((position, _))) => {
                debug!(source = source.id(), ?position, "discarding non-finite frame");
            }
            Ok(None) => {}
            Err(LabError::Sensor(msg)) => {
                debug!(source = source.id(), error = %msg, "transient sensor fault");
            }
            Err(other) => return Err(other),
        }

        if retries >= retry_limit {
            break;
        }
        retries += 1;
    }

    match last {
        Some((position, timestamp)) => {
            warn!(source = source.id(), retries, "no fresh frame, reusing previous");
            Ok(FrameAcquisition {
                position,
                timestamp,
                retries,
                stale: true,
            })
        }
        None => Err(LabError::Sensor(format!(
            "{}: no frame after {} retries",
            source.id(),
            retries
        ))),
    }
}
