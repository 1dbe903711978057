//! `reachlab-kernel` – safety and timing.
//!
//! It does not decide what force to apply; it enforces limits on what
//! reaches the actuator and keeps watch over the loop period.
//!
//! # Modules
//!
//! - [`force_gate`] – [`ForceGate`][force_gate::ForceGate]: a rule engine
//!   every force command passes through before it is sent. Violations are
//!   replaced with a safe value, never forwarded.
//! - [`timing`] – [`TimingMonitor`][timing::TimingMonitor]: computes the
//!   sleep that keeps the loop at its fixed rate, logs overruns, and keeps
//!   period statistics for the end-of-session report.

pub mod force_gate;
pub mod timing;

pub use force_gate::{FiniteForceRule, ForceCapRule, ForceGate, ForceRule, RuleVerdict};
pub use timing::{TimingMonitor, TimingStats};
