//! `reachlab-hal` – hardware edge of the experiment loop.
//!
//! The loop driver only ever talks to the [`ForceActuator`] and
//! [`KinematicSource`] traits, so the UDP drivers used in the lab and the
//! simulated drivers used in tests are interchangeable.
//!
//! # Modules
//!
//! - [`actuator`] – the [`ForceActuator`] trait.
//! - [`force`] – the force law, [`compute_force`].
//! - [`sensor`] – the [`KinematicSource`] trait and bounded frame acquisition.
//! - [`udp`] – datagram actuator and position relay.
//! - [`guard`] – [`ActuatorGuard`], which zeroes the force when dropped.
//! - [`sim`] – in-process drivers for headless runs.

pub mod actuator;
pub mod force;
pub mod guard;
pub mod sensor;
pub mod sim;
pub mod udp;

pub use actuator::ForceActuator;
pub use force::compute_force;
pub use guard::ActuatorGuard;
pub use sensor::{FrameAcquisition, KinematicSource, acquire_frame};
