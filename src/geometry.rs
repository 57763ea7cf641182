use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Denominator magnitude below which two segments are treated as parallel.
pub const PARALLEL_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub a: Vec2,
    pub b: Vec2,
}

impl Segment {
    pub fn new(a: Vec2, b: Vec2) -> Self {
        Self { a, b }
    }

    pub fn intersection(&self, other: &Segment) -> Option<Vec2> {
        segment_intersection(self.a, self.b, other.a, other.b)
    }

    pub fn intersects(&self, other: &Segment) -> bool {
        self.intersection(other).is_some()
    }
}

/// Parametric intersection of AB and CD. Evaluated in f64 so the parallel
/// threshold is meaningful for pixel-scale coordinates.
pub fn segment_intersection(a: Vec2, b: Vec2, c: Vec2, d: Vec2) -> Option<Vec2> {
    let (ax, ay) = (a.x as f64, a.y as f64);
    let (bx, by) = (b.x as f64, b.y as f64);
    let (cx, cy) = (c.x as f64, c.y as f64);
    let (dx, dy) = (d.x as f64, d.y as f64);

    let denom = (ax - bx) * (cy - dy) - (ay - by) * (cx - dx);
    if denom.abs() < PARALLEL_EPSILON {
        return None;
    }

    let t = ((ax - cx) * (cy - dy) - (ay - cy) * (cx - dx)) / denom;
    let u = -((ax - bx) * (ay - cy) - (ay - by) * (ax - cx)) / denom;

    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        Some(Vec2::new(
            (ax + t * (bx - ax)) as f32,
            (ay + t * (by - ay)) as f32,
        ))
    } else {
        None
    }
}

/// Unit vector a car with `heading_deg` travels along at positive velocity.
/// Heading 0 points up the screen; positive headings turn left.
pub fn heading_vector(heading_deg: f32) -> Vec2 {
    let rad = heading_deg.to_radians();
    Vec2::new(-rad.sin(), -rad.cos())
}

/// Rotate a screen-space vector counter-clockwise (as seen on screen) by `deg`.
pub fn rotate_screen(v: Vec2, deg: f32) -> Vec2 {
    let (s, c) = deg.to_radians().sin_cos();
    Vec2::new(v.x * c + v.y * s, -v.x * s + v.y * c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_segments_intersect_at_expected_point() {
        let p = segment_intersection(
            Vec2::new(0.0, 0.0),
            Vec2::new(10.0, 10.0),
            Vec2::new(0.0, 10.0),
            Vec2::new(10.0, 0.0),
        )
        .unwrap();
        assert!((p - Vec2::new(5.0, 5.0)).length() < 1e-5);
    }

    #[test]
    fn parallel_segments_never_intersect() {
        assert!(
            segment_intersection(
                Vec2::new(0.0, 0.0),
                Vec2::new(10.0, 0.0),
                Vec2::new(0.0, 0.0),
                Vec2::new(10.0, 0.0),
            )
            .is_none()
        );
        assert!(
            segment_intersection(
                Vec2::new(0.0, 0.0),
                Vec2::new(10.0, 0.0),
                Vec2::new(0.0, 1.0),
                Vec2::new(10.0, 1.0),
            )
            .is_none()
        );
    }

    #[test]
    fn disjoint_segments_do_not_intersect() {
        let s1 = Segment::new(Vec2::new(0.0, 0.0), Vec2::new(1.0, 1.0));
        let s2 = Segment::new(Vec2::new(5.0, 0.0), Vec2::new(5.0, 10.0));
        assert!(!s1.intersects(&s2));
    }

    #[test]
    fn touching_endpoint_counts_as_intersection() {
        let s1 = Segment::new(Vec2::new(0.0, 5.0), Vec2::new(5.0, 5.0));
        let s2 = Segment::new(Vec2::new(5.0, 0.0), Vec2::new(5.0, 10.0));
        assert!(s1.intersects(&s2));
    }

    #[test]
    fn heading_zero_points_up_and_ninety_points_left() {
        assert!((heading_vector(0.0) - Vec2::new(0.0, -1.0)).length() < 1e-6);
        assert!((heading_vector(90.0) - Vec2::new(-1.0, 0.0)).length() < 1e-6);
        let rotated = rotate_screen(Vec2::new(0.0, -1.0), 90.0);
        assert!((rotated - heading_vector(90.0)).length() < 1e-6);
    }
}
