use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::NUM_RAYS;
use crate::geometry::{heading_vector, rotate_screen};
use crate::mask::Mask;
use crate::track::Obstacle;

/// Body-frame bearings in degrees (positive = left of the nose), denser
/// around straight ahead.
pub const REFERENCE_BEARINGS: [f32; NUM_RAYS] = [
    -90.0, -60.0, -45.0, -30.0, -20.0, -15.0, -10.0, -5.0, 0.0, 5.0, 10.0, 15.0, 20.0, 30.0,
    45.0, 60.0, 90.0,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RaycastConfig {
    pub bearings: [f32; NUM_RAYS],
    pub ray_length: f32,
    pub step: f32,
}

impl Default for RaycastConfig {
    fn default() -> Self {
        Self {
            bearings: REFERENCE_BEARINGS,
            ray_length: 200.0,
            step: 1.0,
        }
    }
}

pub struct RayCaster {
    config: RaycastConfig,
    /// Unit directions at heading 0, precomputed from the bearings.
    body_dirs: [Vec2; NUM_RAYS],
    distances: [f32; NUM_RAYS],
    hits: [Vec2; NUM_RAYS],
}

impl RayCaster {
    pub fn new(config: RaycastConfig) -> Self {
        let body_dirs = config.bearings.map(heading_vector);
        Self {
            config,
            body_dirs,
            distances: [config.ray_length; NUM_RAYS],
            hits: [Vec2::ZERO; NUM_RAYS],
        }
    }

    pub fn config(&self) -> &RaycastConfig {
        &self.config
    }

    pub fn ray_length(&self) -> f32 {
        self.config.ray_length
    }

    /// Cast every ray from `origin` and cache distances and stop points.
    pub fn cast(&mut self, origin: Vec2, heading: f32, border: &Mask, obstacles: &[Obstacle]) {
        for i in 0..NUM_RAYS {
            let dir = rotate_screen(self.body_dirs[i], heading);
            let (distance, hit) = self.march(origin, dir, border, obstacles);
            self.distances[i] = distance;
            self.hits[i] = hit;
        }
    }

    fn march(&self, origin: Vec2, dir: Vec2, border: &Mask, obstacles: &[Obstacle]) -> (f32, Vec2) {
        let length = self.config.ray_length;
        let step = self.config.step.max(f32::EPSILON);
        let mut d = 0.0f32;
        while d <= length {
            let p = origin + dir * d;
            let (px, py) = (p.x.floor() as i32, p.y.floor() as i32);
            if !border.in_bounds(px, py) {
                return (length, p);
            }
            if border.at(px, py) {
                return (d, p);
            }
            if obstacles.iter().any(|o| o.solid_at(px, py)) {
                return (d, p);
            }
            d += step;
        }
        (length, origin + dir * length)
    }

    pub fn distances(&self) -> &[f32; NUM_RAYS] {
        &self.distances
    }

    pub fn normalized(&self) -> [f32; NUM_RAYS] {
        let length = self.config.ray_length;
        self.distances.map(|d| (d / length).clamp(0.0, 1.0))
    }

    pub fn min_normalized(&self) -> f32 {
        self.normalized().into_iter().fold(1.0, f32::min)
    }

    /// Stop point of each ray from the last cast, for drawing.
    pub fn hit_points(&self) -> &[Vec2; NUM_RAYS] {
        &self.hits
    }

    pub fn reset(&mut self) {
        self.distances = [self.config.ray_length; NUM_RAYS];
        self.hits = [Vec2::ZERO; NUM_RAYS];
    }
}
