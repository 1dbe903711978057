//! The force law.
//!
//! [`compute_force`] is a pure function of one [`KinematicSample`] and the
//! current [`ForceParameters`]. It keeps no state between calls, so zeroing
//! `amplification` takes effect on the very next iteration.
//!
//! | Mode | Force |
//! |---|---|
//! | `Free` | `0` |
//! | `VelocityProportional` | `direction · |v.x| · amplification · weight` |
//! | `PositionChannel` | `−channel_sign · d · amplification · weight` |
//!
//! `d` is [`KinematicSample::path_deviation`], the distance from the straight
//! left–right path in the calibrated frame. The raw lab position never enters
//! the channel law, so where the participant stands does not bias it.
//!
//! Velocity and deviation are clamped to `[-max_velocity, max_velocity]`
//! first; any non-finite result is replaced with `0`.
//!
//! # Example
//!
//! ```rust
//! use reachlab_hal::force::compute_force;
//! use reachlab_types::{ForceParameters, KinematicSample, PerturbationMode, Vec3};
//!
//! let params = ForceParameters {
//!     amplification: 2.0,
//!     participant_weight: 70.0,
//!     max_velocity: 1.0,
//!     mode: PerturbationMode::VelocityProportional,
//!     ..ForceParameters::default()
//! };
//! let sample = KinematicSample {
//!     velocity: Vec3::new(-0.5, 0.0, 0.0),
//!     ..KinematicSample::default()
//! };
//! assert!((compute_force(&sample, &params) - 70.0).abs() < 1e-9);
//! ```

use reachlab_types::{ForceParameters, KinematicSample, PerturbationMode};
use tracing::warn;

/// Map the current kinematic state to a scalar force command.
pub fn compute_force(sample: &KinematicSample, params: &ForceParameters) -> f64 {
    if params.mode == PerturbationMode::Free {
        return 0.0;
    }
    // clamp() panics on a NaN bound.
    if !(params.max_velocity.is_finite() && params.max_velocity > 0.0) {
        warn!(max_velocity = params.max_velocity, "invalid velocity limit, emitting zero force");
        return 0.0;
    }

    let scale = params.amplification * params.participant_weight;
    let force = match params.mode {
        PerturbationMode::Free => 0.0,
        PerturbationMode::VelocityProportional => {
            let v = sample.velocity.clamp_components(params.max_velocity);
            params.direction.sign() * v.x.abs() * scale
        }
        PerturbationMode::PositionChannel => {
            let d = sample
                .path_deviation
                .clamp(-params.max_velocity, params.max_velocity);
            -d * scale * params.channel_sign.sign()
        }
    };

    if force.is_finite() {
        force
    } else {
        warn!(
            mode = params.mode.as_str(),
            amplification = params.amplification,
            "non-finite force replaced with zero"
        );
        0.0
    }
}
