//! Tracked point → workspace cursor.
//!
//! ```text
//! cursor = mean_{last n}( (marker.xy − reference.xy − offset) · gain )
//! ```
//!
//! `reference` is the centre of the base of support when one is available,
//! so leaning is measured relative to the feet; otherwise it is zero.
//! [`CursorMapper::recalibrate`] picks `offset` so the participant's current
//! resting position lands on a given anchor (the middle target).

use std::collections::VecDeque;

use reachlab_types::{LabError, Vec2, Vec3};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CursorMapper {
    gain: f64,
    offset: Vec2,
    smoothing: usize,
    buffer: VecDeque<Vec2>,
}

impl CursorMapper {
    /// # Errors
    ///
    /// Returns [`LabError::Config`] when `gain` is zero or not finite.
    pub fn new(gain: f64, smoothing: usize) -> Result<Self, LabError> {
        if !gain.is_finite() || gain == 0.0 {
            return Err(LabError::Config(format!(
                "cursor gain must be finite and non-zero, got {gain}"
            )));
        }
        Ok(Self {
            gain,
            offset: Vec2::ZERO,
            smoothing: smoothing.max(1),
            buffer: VecDeque::new(),
        })
    }

    pub fn offset(&self) -> Vec2 {
        self.offset
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    fn relative(marker: Vec3, reference: Option<Vec3>) -> Vec2 {
        match reference {
            Some(r) => marker.xy() - r.xy(),
            None => marker.xy(),
        }
    }

    /// Calibrated, unsmoothed position of `marker` in the workspace frame.
    /// Does not touch the moving average.
    pub fn workspace(&self, marker: Vec3, reference: Option<Vec3>) -> Vec2 {
        (Self::relative(marker, reference) - self.offset) * self.gain
    }

    /// Map one sample and return the smoothed cursor.
    pub fn map(&mut self, marker: Vec3, reference: Option<Vec3>) -> Vec2 {
        let raw = self.workspace(marker, reference);
        self.buffer.push_back(raw);
        while self.buffer.len() > self.smoothing {
            self.buffer.pop_front();
        }
        let n = self.buffer.len() as f64;
        let sum = self.buffer.iter().fold(Vec2::ZERO, |acc, &p| acc + p);
        sum * (1.0 / n)
    }

    /// Choose the offset so `resting` maps to `anchor`, and drop the
    /// smoothing history.
    pub fn recalibrate(&mut self, resting: Vec3, reference: Option<Vec3>, anchor: Vec2) {
        self.offset = Self::relative(resting, reference) - anchor * (1.0 / self.gain);
        self.buffer.clear();
        debug!(offset_x = self.offset.x, offset_y = self.offset.y, "cursor recalibrated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_gain_rejected() {
        assert!(CursorMapper::new(0.0, 3).is_err());
        assert!(CursorMapper::new(f64::NAN, 3).is_err());
    }

    #[test]
    fn recalibrated_rest_maps_to_anchor() {
        let mut m = CursorMapper::new(2.0, 1).unwrap();
        let rest = Vec3::new(0.3, -0.1, 1.0);
        m.recalibrate(rest, None, Vec2::new(0.01, 0.0));
        let c = m.map(rest, None);
        assert!((c.x - 0.01).abs() < 1e-12);
        assert!(c.y.abs() < 1e-12);
    }

    #[test]
    fn reference_is_subtracted() {
        let mut m = CursorMapper::new(1.0, 1).unwrap();
        let cbos = Vec3::new(1.0, 1.0, 0.0);
        m.recalibrate(Vec3::new(1.0, 1.0, 1.0), Some(cbos), Vec2::ZERO);
        let c = m.map(Vec3::new(1.05, 1.0, 1.0), Some(cbos));
        assert!((c.x - 0.05).abs() < 1e-12);
    }

    #[test]
    fn moving_average_over_window() {
        let mut m = CursorMapper::new(1.0, 2).unwrap();
        m.map(Vec3::new(0.0, 0.0, 0.0), None);
        let c = m.map(Vec3::new(0.02, 0.0, 0.0), None);
        assert!((c.x - 0.01).abs() < 1e-12);
        let c = m.map(Vec3::new(0.04, 0.0, 0.0), None);
        assert!((c.x - 0.03).abs() < 1e-12);
    }

    #[test]
    fn workspace_removes_standing_offset() {
        let mut m = CursorMapper::new(2.0, 4).unwrap();
        let rest = Vec3::new(0.3, 0.4, 1.0);
        m.recalibrate(rest, None, Vec2::ZERO);
        let w = m.workspace(Vec3::new(0.32, 0.4, 1.0), None);
        assert!((w.x - 0.04).abs() < 1e-12);
        assert!(w.y.abs() < 1e-12);
        // Smoothing history is untouched.
        let c = m.map(rest, None);
        assert_eq!(c, Vec2::ZERO);
    }

    #[test]
    fn recalibrate_clears_smoothing() {
        let mut m = CursorMapper::new(1.0, 5).unwrap();
        m.map(Vec3::new(1.0, 0.0, 0.0), None);
        m.recalibrate(Vec3::ZERO, None, Vec2::ZERO);
        let c = m.map(Vec3::ZERO, None);
        assert_eq!(c, Vec2::ZERO);
    }
}
