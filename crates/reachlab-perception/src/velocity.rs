//! Finite-difference velocity estimation.
//!
//! Each named channel (`"hand"`, `"com"`, …) keeps a ring of its last
//! `window` samples. The estimate is
//!
//! ```text
//! v = (p_newest − p_oldest) / (t_newest − t_oldest)
//! ```
//!
//! A window of 2 is the plain two-sample difference; larger windows smooth
//! tracking jitter at the cost of latency. The first sample of a channel,
//! and any non-positive time span, yields zero.
//!
//! # Example
//!
//! ```rust
//! use reachlab_perception::velocity::VelocityEstimator;
//! use reachlab_types::Vec3;
//!
//! let mut est = VelocityEstimator::new(2);
//! assert_eq!(est.update("hand", Vec3::ZERO, 0.0), Vec3::ZERO);
//! let v = est.update("hand", Vec3::new(0.01, 0.0, 0.0), 0.01);
//! assert!((v.x - 1.0).abs() < 1e-9);
//! ```

use std::collections::{HashMap, VecDeque};

use reachlab_types::Vec3;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct VelocityEstimator {
    window: usize,
    channels: HashMap<String, VecDeque<(Vec3, f64)>>,
}

impl VelocityEstimator {
    /// `window` is clamped to at least 2 samples.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            channels: HashMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Push a sample for `channel` and return the current estimate.
    pub fn update(&mut self, channel: &str, position: Vec3, timestamp: f64) -> Vec3 {
        let window = self.window;
        let ring = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| VecDeque::with_capacity(window));
        ring.push_back((position, timestamp));
        while ring.len() > window {
            ring.pop_front();
        }

        let (Some(&(p0, t0)), Some(&(p1, t1))) = (ring.front(), ring.back()) else {
            return Vec3::ZERO;
        };
        let dt = t1 - t0;
        if ring.len() < 2 || !(dt > 0.0) {
            trace!(channel, dt, "velocity unavailable, reporting zero");
            return Vec3::ZERO;
        }
        (p1 - p0) * (1.0 / dt)
    }

    /// Forget all history, e.g. after a tracking gap.
    pub fn reset(&mut self) {
        self.channels.clear();
    }
}
