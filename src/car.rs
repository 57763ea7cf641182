use glam::{IVec2, Vec2};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::geometry::heading_vector;
use crate::mask::{Mask, rotate_image};

// =============================================================================
// Physics Tuning Knobs
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CarConfig {
    pub max_velocity: f32,
    /// Degrees per steering tick.
    pub rotation_velocity: f32,
    pub acceleration: f32,
    /// Reverse top speed as a fraction of `max_velocity`.
    pub reverse_ratio: f32,
    /// Coasting deceleration as a fraction of `acceleration`.
    pub coast_ratio: f32,
}

impl Default for CarConfig {
    fn default() -> Self {
        Self {
            max_velocity: 6.0,
            rotation_velocity: 4.0,
            acceleration: 0.1,
            reverse_ratio: 0.5,
            coast_ratio: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steer {
    Left,
    Right,
}

/// Kinematic car. `position` is the centre of the body; the rotated body
/// sprite and its mask are kept in sync with `heading` (degrees).
pub struct Car {
    config: CarConfig,
    sprite: RgbaImage,
    body_image: RgbaImage,
    body: Mask,
    position: Vec2,
    heading: f32,
    velocity: f32,
    can_move: bool,
    failed: bool,
}

impl Car {
    pub fn new(sprite: RgbaImage, config: CarConfig, position: Vec2) -> Self {
        let body = Mask::from_image(&sprite);
        Self {
            config,
            body_image: sprite.clone(),
            sprite,
            body,
            position,
            heading: 0.0,
            velocity: 0.0,
            can_move: true,
            failed: false,
        }
    }

    pub fn config(&self) -> &CarConfig {
        &self.config
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn heading(&self) -> f32 {
        self.heading
    }

    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    pub fn can_move(&self) -> bool {
        self.can_move
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn body(&self) -> &Mask {
        &self.body
    }

    pub fn body_image(&self) -> &RgbaImage {
        &self.body_image
    }

    /// Top-left pixel of the rotated body in world coordinates.
    pub fn top_left(&self) -> IVec2 {
        let half = Vec2::new(self.body.width() as f32, self.body.height() as f32) / 2.0;
        (self.position - half).round().as_ivec2()
    }

    pub fn set_can_move(&mut self, can_move: bool) {
        self.can_move = can_move && !self.failed;
    }

    /// Crash: freeze the car until the next reset.
    pub fn fail(&mut self) {
        self.failed = true;
        self.can_move = false;
    }

    pub fn rotate(&mut self, steer: Steer) {
        if !self.can_move {
            return;
        }
        match steer {
            Steer::Left => self.heading += self.config.rotation_velocity,
            Steer::Right => self.heading -= self.config.rotation_velocity,
        }
        self.heading = self.heading.rem_euclid(360.0);
        self.refresh_body();
    }

    pub fn accelerate(&mut self, forward: bool) {
        if !self.can_move {
            return;
        }
        let acc = self.config.acceleration;
        self.velocity = if forward {
            (self.velocity + acc).min(self.config.max_velocity)
        } else {
            (self.velocity - acc).max(-self.config.max_velocity * self.config.reverse_ratio)
        };
    }

    pub fn reduce_speed(&mut self) {
        if !self.can_move {
            return;
        }
        let decay = self.config.acceleration * self.config.coast_ratio;
        self.velocity = if self.velocity > 0.0 {
            (self.velocity - decay).max(0.0)
        } else {
            (self.velocity + decay).min(0.0)
        };
    }

    /// Integrate one tick of motion along the heading.
    pub fn advance(&mut self) {
        if !self.can_move {
            return;
        }
        self.position += heading_vector(self.heading) * self.velocity;
    }

    /// Scale velocity after an impact; bypasses `can_move` like any external force.
    pub fn apply_impact(&mut self, factor: f32) {
        self.velocity *= factor;
    }

    pub fn reset(&mut self, position: Vec2) {
        self.reset_pose(position, 0.0);
    }

    pub fn reset_pose(&mut self, position: Vec2, heading: f32) {
        self.position = position;
        self.heading = heading.rem_euclid(360.0);
        self.velocity = 0.0;
        self.failed = false;
        self.can_move = true;
        self.refresh_body();
    }

    fn refresh_body(&mut self) {
        self.body_image = rotate_image(&self.sprite, self.heading);
        self.body = Mask::from_image(&self.body_image);
    }
}
