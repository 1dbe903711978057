//! `reachlab-perception` – derived kinematic state.
//!
//! Turns raw tracked-point positions into what the trial state machine and
//! the force law consume.
//!
//! # Modules
//!
//! - [`velocity`] – [`VelocityEstimator`][velocity::VelocityEstimator]:
//!   finite-difference velocity over a short trailing window, one window per
//!   named channel.
//! - [`cursor`] – [`CursorMapper`][cursor::CursorMapper]: maps the tracked
//!   point to the workspace cursor with a calibration offset and a moving
//!   average.
//! - [`geometry`] – point-to-line distance used by the overshoot rule.

pub mod cursor;
pub mod geometry;
pub mod velocity;
