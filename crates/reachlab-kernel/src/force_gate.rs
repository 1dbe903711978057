//! [`ForceGate`] – last check before a command leaves the process.
//!
//! Every registered [`ForceRule`] sees the command in insertion order and
//! may substitute a safe value. The gate never fails: a degenerate command
//! becomes a safe one and the intervention is logged.
//!
//! Two built-in rules are provided:
//! - [`FiniteForceRule`] – replaces NaN/∞ with `0`.
//! - [`ForceCapRule`] – clamps the magnitude to a configured cap.

use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of one rule on one command.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleVerdict {
    Pass,
    Substitute { value: f64, reason: String },
}

/// A single invariant a force command must satisfy.
pub trait ForceRule: Send + Sync {
    /// Human-readable name used in log messages.
    fn name(&self) -> &str;

    fn apply(&self, force: f64) -> RuleVerdict;
}

// ────────────────────────────────────────────────────────────────────────────
// ForceGate
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use reachlab_kernel::force_gate::{FiniteForceRule, ForceCapRule, ForceGate};
///
/// let mut gate = ForceGate::new();
/// gate.add_rule(Box::new(FiniteForceRule));
/// gate.add_rule(Box::new(ForceCapRule { max_abs_force: 40.0 }));
///
/// assert_eq!(gate.filter(12.0), 12.0);
/// assert_eq!(gate.filter(f64::NAN), 0.0);
/// assert_eq!(gate.filter(-90.0), -40.0);
/// assert_eq!(gate.interventions(), 2);
/// ```
#[derive(Default)]
pub struct ForceGate {
    rules: Vec<Box<dyn ForceRule>>,
    interventions: u64,
}

impl ForceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finite check followed by a magnitude cap.
    pub fn with_cap(max_abs_force: f64) -> Self {
        let mut gate = Self::new();
        gate.add_rule(Box::new(FiniteForceRule));
        gate.add_rule(Box::new(ForceCapRule { max_abs_force }));
        gate
    }

    /// Register a new [`ForceRule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn ForceRule>) {
        self.rules.push(rule);
    }

    /// Pass `force` through every rule and return the value to send.
    pub fn filter(&mut self, force: f64) -> f64 {
        let mut out = force;
        let mut intervened = false;
        for rule in &self.rules {
            if let RuleVerdict::Substitute { value, reason } = rule.apply(out) {
                warn!(rule = rule.name(), requested = out, applied = value, %reason, "force command overridden");
                out = value;
                intervened = true;
            }
        }
        if intervened {
            self.interventions += 1;
        }
        out
    }

    /// Number of commands that were modified by at least one rule.
    pub fn interventions(&self) -> u64 {
        self.interventions
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Replaces any non-finite command with `0`.
pub struct FiniteForceRule;

impl ForceRule for FiniteForceRule {
    fn name(&self) -> &str {
        "finite_force"
    }

    fn apply(&self, force: f64) -> RuleVerdict {
        if force.is_finite() {
            RuleVerdict::Pass
        } else {
            RuleVerdict::Substitute {
                value: 0.0,
                reason: format!("non-finite command {force}"),
            }
        }
    }
}

/// Clamps the command to `[-max_abs_force, max_abs_force]`.
pub struct ForceCapRule {
    pub max_abs_force: f64,
}

impl ForceRule for ForceCapRule {
    fn name(&self) -> &str {
        "force_cap"
    }

    fn apply(&self, force: f64) -> RuleVerdict {
        let cap = self.max_abs_force.abs();
        if !cap.is_finite() {
            return RuleVerdict::Pass;
        }
        // NaN is the finite rule's concern.
        if force.abs() > cap {
            RuleVerdict::Substitute {
                value: cap.copysign(force),
                reason: format!("|{force}| exceeds cap {cap}"),
            }
        } else {
            RuleVerdict::Pass
        }
    }
}
