//! Planar geometry for the overshoot rule and the channel law.

use reachlab_types::Vec2;

/// Perpendicular distance from `c` to the line through `p0` and `p1`:
///
/// ```text
/// |(p1.x − p0.x)(p0.y − c.y) − (p0.x − c.x)(p1.y − p0.y)| / |p1 − p0|
/// ```
///
/// When the two samples coincide there is no line; the distance to the
/// point itself is returned instead.
pub fn line_distance_to_point(p0: Vec2, p1: Vec2, c: Vec2) -> f64 {
    let len = p0.distance(p1);
    if len <= f64::EPSILON {
        return p0.distance(c);
    }
    ((p1.x - p0.x) * (p0.y - c.y) - (p0.x - c.x) * (p1.y - p0.y)).abs() / len
}

/// Signed perpendicular distance from `p` to the directed line `a → b`:
/// positive when `p` lies to the left of the direction of travel.
///
/// Zero when `a` and `b` coincide.
pub fn signed_line_offset(a: Vec2, b: Vec2, p: Vec2) -> f64 {
    let len = a.distance(b);
    if len <= f64::EPSILON {
        return 0.0;
    }
    let dir = b - a;
    let rel = p - a;
    (dir.x * rel.y - dir.y * rel.x) / len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizontal_line() {
        let d = line_distance_to_point(Vec2::new(0.0, 0.008), Vec2::new(0.1, 0.008), Vec2::new(0.05, 0.0));
        assert!((d - 0.008).abs() < 1e-12);
    }

    #[test]
    fn diagonal_line() {
        // y = x, point (1, 0): distance 1/sqrt(2).
        let d = line_distance_to_point(Vec2::ZERO, Vec2::new(2.0, 2.0), Vec2::new(1.0, 0.0));
        assert!((d - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn order_of_samples_does_not_matter() {
        let a = Vec2::new(0.04, 0.02);
        let b = Vec2::new(0.07, -0.01);
        let c = Vec2::new(0.05, 0.0);
        let d1 = line_distance_to_point(a, b, c);
        let d2 = line_distance_to_point(b, a, c);
        assert!((d1 - d2).abs() < 1e-12);
    }

    #[test]
    fn degenerate_segment_falls_back_to_point_distance() {
        let p = Vec2::new(0.0, 0.03);
        let d = line_distance_to_point(p, p, Vec2::ZERO);
        assert!((d - 0.03).abs() < 1e-12);
    }

    #[test]
    fn signed_offset_along_lateral_axis() {
        let left = Vec2::new(-0.05, 0.0);
        let right = Vec2::new(0.05, 0.0);
        assert!((signed_line_offset(left, right, Vec2::new(0.02, 0.01)) - 0.01).abs() < 1e-12);
        assert!((signed_line_offset(left, right, Vec2::new(-0.3, -0.004)) + 0.004).abs() < 1e-12);
        assert!((signed_line_offset(right, left, Vec2::new(0.0, 0.01)) + 0.01).abs() < 1e-12);
    }

    #[test]
    fn signed_offset_on_tilted_path_matches_distance() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(0.1, 0.05);
        let c = Vec2::new(0.02, 0.06);
        let signed = signed_line_offset(a, b, c);
        assert!(signed > 0.0);
        assert!((signed - line_distance_to_point(a, b, c)).abs() < 1e-12);
        assert_eq!(signed_line_offset(a, a, c), 0.0);
    }
}
