use anyhow::{Context, Result, bail};
use glam::{IVec2, UVec2, Vec2};
use image::RgbaImage;
use image::imageops::{self, FilterType};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use crate::car::Car;
use crate::geometry::Segment;
use crate::mask::Mask;

/// Velocity multiplier applied to a car that drives through an obstacle.
pub const IMPACT_VELOCITY_FACTOR: f32 = 0.25;

// =============================================================================
// Track Layout
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartPose {
    pub position: Vec2,
    pub heading: f32,
}

impl StartPose {
    pub const fn new(x: f32, y: f32) -> Self {
        Self {
            position: Vec2::new(x, y),
            heading: 0.0,
        }
    }
}

/// Per-track placement data. Loaded from `track.json` beside the track images
/// when present, otherwise the reference layout below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub finish_position: IVec2,
    pub finish_size: UVec2,
    pub solo_start: StartPose,
    /// Two side-by-side grid slots used when both cars race.
    pub duo_starts: [StartPose; 2],
    pub car_scale: f32,
    pub obstacle_size: u32,
    /// Border band ignored by obstacle collisions, so grazes don't count.
    pub obstacle_hitbox_margin: u32,
    pub obstacle_count: usize,
    pub obstacle_pool: Vec<IVec2>,
    /// Ordered gates in racing order.
    pub checkpoints: Vec<Segment>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            finish_position: IVec2::new(250, 250),
            finish_size: UVec2::new(180, 25),
            solo_start: StartPose::new(350.0, 225.0),
            duo_starts: [StartPose::new(320.0, 225.0), StartPose::new(380.0, 225.0)],
            car_scale: 0.55,
            obstacle_size: 24,
            obstacle_hitbox_margin: 6,
            obstacle_count: 5,
            obstacle_pool: vec![
                IVec2::new(400, 120),
                IVec2::new(180, 90),
                IVec2::new(90, 300),
                IVec2::new(140, 520),
                IVec2::new(380, 640),
                IVec2::new(600, 560),
                IVec2::new(690, 380),
                IVec2::new(640, 150),
                IVec2::new(500, 420),
                IVec2::new(280, 470),
            ],
            // One gate per stretch of the lap, starting just above the grid
            // and ending below the finish line.
            checkpoints: vec![
                gate((290, 170), (470, 170)),
                gate((280, 20), (280, 160)),
                gate((20, 220), (200, 220)),
                gate((40, 430), (240, 430)),
                gate((380, 560), (380, 740)),
                gate((580, 470), (580, 700)),
                gate((610, 380), (790, 380)),
                gate((440, 330), (440, 520)),
                gate((250, 330), (430, 330)),
            ],
        }
    }
}

fn gate(a: (i32, i32), b: (i32, i32)) -> Segment {
    Segment::new(
        Vec2::new(a.0 as f32, a.1 as f32),
        Vec2::new(b.0 as f32, b.1 as f32),
    )
}

impl TrackConfig {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(path)
            .with_context(|| format!("Failed to open track config: {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse track config: {}", path.display()))
    }
}

// =============================================================================
// Assets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarColor {
    Red,
    Green,
    Purple,
    Grey,
    White,
}

impl CarColor {
    pub const ALL: [CarColor; 5] = [
        CarColor::Red,
        CarColor::Green,
        CarColor::Purple,
        CarColor::Grey,
        CarColor::White,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CarColor::Red => "red",
            CarColor::Green => "green",
            CarColor::Purple => "purple",
            CarColor::Grey => "grey",
            CarColor::White => "white",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}-car.png", self.name())
    }
}

impl fmt::Display for CarColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CarColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CarColor::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("unknown car color '{s}' (expected red, green, purple, grey or white)")
            })
    }
}

pub const TRACK_FILE: &str = "track.png";
pub const BORDER_FILE: &str = "track-border.png";
pub const FINISH_FILE: &str = "finish.png";
pub const OBSTACLE_FILE: &str = "obstacle.png";
pub const TRACK_CONFIG_FILE: &str = "track.json";

/// Decoded images for one track. Any missing or undecodable file is fatal.
pub struct TrackAssets {
    pub track: RgbaImage,
    pub border: RgbaImage,
    pub finish: RgbaImage,
    pub obstacle: RgbaImage,
    pub cars: Vec<(CarColor, RgbaImage)>,
    pub config: TrackConfig,
}

fn load_image(path: &Path) -> Result<RgbaImage> {
    let img = image::open(path)
        .with_context(|| format!("Failed to load image asset: {}", path.display()))?;
    Ok(img.to_rgba8())
}

impl TrackAssets {
    pub fn load(dir: &Path) -> Result<Self> {
        let config = TrackConfig::load_or_default(&dir.join(TRACK_CONFIG_FILE))?;
        if config.checkpoints.is_empty() {
            tracing::warn!(
                dir = %dir.display(),
                "track has no checkpoint gates; progress stays at 0"
            );
        }
        let track = load_image(&dir.join(TRACK_FILE))?;
        let border = load_image(&dir.join(BORDER_FILE))?;
        let finish = load_image(&dir.join(FINISH_FILE))?;
        let obstacle = load_image(&dir.join(OBSTACLE_FILE))?;

        let mut cars = Vec::with_capacity(CarColor::ALL.len());
        for color in CarColor::ALL {
            let sprite = load_image(&dir.join(color.file_name()))?;
            cars.push((color, scale_image(&sprite, config.car_scale)));
        }

        tracing::info!(dir = %dir.display(), "loaded track assets");
        Ok(Self {
            track,
            border,
            finish,
            obstacle,
            cars,
            config,
        })
    }

    pub fn car_sprite(&self, color: CarColor) -> Result<&RgbaImage> {
        self.cars
            .iter()
            .find(|(c, _)| *c == color)
            .map(|(_, img)| img)
            .with_context(|| format!("No sprite loaded for car color {color}"))
    }

    pub fn build_track(&self) -> Result<Track> {
        Track::new(
            self.track.clone(),
            &self.border,
            &self.finish,
            self.config.clone(),
        )
    }

    pub fn obstacle_field(&self) -> ObstacleField {
        ObstacleField::new(&self.config, Some(&self.obstacle))
    }
}

fn scale_image(img: &RgbaImage, scale: f32) -> RgbaImage {
    if (scale - 1.0).abs() < f32::EPSILON {
        return img.clone();
    }
    let w = ((img.width() as f32 * scale).round() as u32).max(1);
    let h = ((img.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(img, w, h, FilterType::Nearest)
}

// =============================================================================
// Track
// =============================================================================

/// Static track geometry shared read-only by every race on it.
pub struct Track {
    image: RgbaImage,
    border: Mask,
    finish_image: RgbaImage,
    finish_mask: Mask,
    config: TrackConfig,
}

impl Track {
    pub fn new(
        image: RgbaImage,
        border_image: &RgbaImage,
        finish_image: &RgbaImage,
        config: TrackConfig,
    ) -> Result<Self> {
        if image.dimensions() != border_image.dimensions() {
            bail!(
                "Track image is {:?} but border image is {:?}",
                image.dimensions(),
                border_image.dimensions()
            );
        }
        let size = config.finish_size;
        if size.x == 0 || size.y == 0 {
            bail!("Finish line size must be non-zero, got {size}");
        }
        let finish_image = imageops::resize(finish_image, size.x, size.y, FilterType::Nearest);
        let finish_mask = Mask::from_image(&finish_image);
        Ok(Self {
            border: Mask::from_image(border_image),
            image,
            finish_image,
            finish_mask,
            config,
        })
    }

    pub fn width(&self) -> u32 {
        self.border.width()
    }

    pub fn height(&self) -> u32 {
        self.border.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn border(&self) -> &Mask {
        &self.border
    }

    pub fn finish_image(&self) -> &RgbaImage {
        &self.finish_image
    }

    pub fn finish_mask(&self) -> &Mask {
        &self.finish_mask
    }

    pub fn finish_position(&self) -> IVec2 {
        self.config.finish_position
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    /// First overlap of the car body with the finish line, in finish-local
    /// coordinates. The y of the result is the topmost overlapping line row.
    pub fn finish_overlap(&self, car: &Car) -> Option<(u32, u32)> {
        let offset = car.top_left() - self.config.finish_position;
        self.finish_mask.overlap(car.body(), (offset.x, offset.y))
    }

    pub fn hits_border(&self, car: &Car) -> bool {
        let offset = car.top_left();
        self.border.overlap(car.body(), (offset.x, offset.y)).is_some()
    }
}

// =============================================================================
// Obstacles
// =============================================================================

#[derive(Debug, Clone)]
pub struct Obstacle {
    position: IVec2,
    hitbox: Mask,
    alive: bool,
}

impl Obstacle {
    pub fn new(position: IVec2, hitbox: Mask) -> Self {
        Self {
            position,
            hitbox,
            alive: true,
        }
    }

    pub fn position(&self) -> IVec2 {
        self.position
    }

    pub fn size(&self) -> (u32, u32) {
        self.hitbox.size()
    }

    pub fn alive(&self) -> bool {
        self.alive
    }

    pub fn destroy(&mut self) {
        self.alive = false;
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (w, h) = self.size();
        x >= self.position.x
            && y >= self.position.y
            && x < self.position.x + w as i32
            && y < self.position.y + h as i32
    }

    /// Whether a live obstacle's hitbox covers world pixel (x, y).
    pub fn solid_at(&self, x: i32, y: i32) -> bool {
        self.alive
            && self.contains(x, y)
            && self.hitbox.at(x - self.position.x, y - self.position.y)
    }

    pub fn overlaps(&self, car: &Car) -> bool {
        let offset = self.position - car.top_left();
        self.alive && car.body().overlap(&self.hitbox, (offset.x, offset.y)).is_some()
    }
}

/// Obstacles for one race, drawn from a fixed pool of on-track positions.
pub struct ObstacleField {
    pool: Vec<IVec2>,
    count: usize,
    sprite: Option<RgbaImage>,
    hitbox: Mask,
    obstacles: Vec<Obstacle>,
}

impl ObstacleField {
    pub fn new(config: &TrackConfig, sprite: Option<&RgbaImage>) -> Self {
        let size = config.obstacle_size.max(1);
        let sprite = sprite.map(|img| imageops::resize(img, size, size, FilterType::Nearest));
        let full = sprite
            .as_ref()
            .map(Mask::from_image)
            .unwrap_or_else(|| Mask::filled(size, size));
        Self {
            pool: config.obstacle_pool.clone(),
            count: config.obstacle_count,
            hitbox: full.shrunk(config.obstacle_hitbox_margin),
            sprite,
            obstacles: Vec::new(),
        }
    }

    /// Shuffle the pool and place the first `count` obstacles.
    pub fn regenerate<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut pool = self.pool.clone();
        pool.shuffle(rng);
        self.obstacles = pool
            .into_iter()
            .take(self.count)
            .map(|pos| Obstacle::new(pos, self.hitbox.clone()))
            .collect();
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn sprite(&self) -> Option<&RgbaImage> {
        self.sprite.as_ref()
    }

    pub fn live_count(&self) -> usize {
        self.obstacles.iter().filter(|o| o.alive()).count()
    }

    /// Destroy every live obstacle the car overlaps and slow the car once.
    /// Returns the car's velocity from just before the impact.
    pub fn collide(&mut self, car: &mut Car) -> Option<f32> {
        let mut hits = 0;
        for obstacle in self.obstacles.iter_mut().filter(|o| o.overlaps(car)) {
            obstacle.destroy();
            hits += 1;
        }
        if hits == 0 {
            return None;
        }
        let before = car.velocity();
        car.apply_impact(IMPACT_VELOCITY_FACTOR);
        Some(before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::CarConfig;
    use crate::checkpoint::CheckpointManager;
    use image::Rgba;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn solid(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]))
    }

    fn test_track() -> Track {
        let border = RgbaImage::from_fn(200, 200, |x, _| {
            if x < 20 { Rgba([0, 0, 0, 255]) } else { Rgba([0, 0, 0, 0]) }
        });
        let config = TrackConfig {
            finish_position: IVec2::new(50, 100),
            finish_size: UVec2::new(100, 10),
            ..TrackConfig::default()
        };
        Track::new(solid(200, 200), &border, &solid(4, 1), config).unwrap()
    }

    #[test]
    fn finish_line_is_scaled_to_configured_size() {
        let track = test_track();
        assert_eq!(track.finish_mask().size(), (100, 10));
        assert_eq!(track.finish_mask().count(), 1000);
    }

    #[test]
    fn finish_overlap_reports_line_local_row() {
        let track = test_track();
        let mut car = Car::new(solid(10, 10), CarConfig::default(), Vec2::ZERO);
        // Body spans y 105..115: only the lower half of the line is covered.
        car.reset(Vec2::new(100.0, 110.0));
        let (_, y) = track.finish_overlap(&car).unwrap();
        assert_eq!(y, 5);
        // Body spans y 92..102: the first line row is covered.
        car.reset(Vec2::new(100.0, 97.0));
        assert_eq!(track.finish_overlap(&car).unwrap().1, 0);
        car.reset(Vec2::new(100.0, 150.0));
        assert!(track.finish_overlap(&car).is_none());
    }

    #[test]
    fn border_hit_uses_body_mask() {
        let track = test_track();
        let mut car = Car::new(solid(10, 10), CarConfig::default(), Vec2::ZERO);
        car.reset(Vec2::new(30.0, 50.0));
        assert!(!track.hits_border(&car));
        car.reset(Vec2::new(24.0, 50.0));
        assert!(track.hits_border(&car));
    }

    #[test]
    fn mismatched_border_is_rejected() {
        let err = Track::new(
            solid(10, 10),
            &solid(11, 10),
            &solid(1, 1),
            TrackConfig::default(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn regenerate_picks_distinct_pool_entries() {
        let config = TrackConfig {
            obstacle_count: 4,
            ..TrackConfig::default()
        };
        let mut field = ObstacleField::new(&config, None);
        let mut rng = SmallRng::seed_from_u64(7);
        field.regenerate(&mut rng);
        assert_eq!(field.obstacles().len(), 4);
        let mut seen: Vec<IVec2> = field.obstacles().iter().map(|o| o.position()).collect();
        seen.sort_by_key(|p| (p.x, p.y));
        seen.dedup();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|p| config.obstacle_pool.contains(p)));
    }

    #[test]
    fn grazing_contact_is_ignored_and_hit_slows_car() {
        let config = TrackConfig {
            obstacle_pool: vec![IVec2::new(100, 100)],
            obstacle_count: 1,
            obstacle_size: 20,
            obstacle_hitbox_margin: 5,
            ..TrackConfig::default()
        };
        let mut field = ObstacleField::new(&config, None);
        field.regenerate(&mut SmallRng::seed_from_u64(1));

        let mut car = Car::new(solid(4, 4), CarConfig::default(), Vec2::ZERO);
        // Touches only the outer band of the sprite.
        car.reset(Vec2::new(102.0, 110.0));
        assert!(field.collide(&mut car).is_none());

        car.reset(Vec2::new(110.0, 110.0));
        for _ in 0..20 {
            car.accelerate(true);
        }
        let before = field.collide(&mut car).unwrap();
        assert!((before - 2.0).abs() < 1e-5);
        assert!((car.velocity() - 0.5).abs() < 1e-5);
        assert_eq!(field.live_count(), 0);
        assert!(field.collide(&mut car).is_none());
    }

    #[test]
    fn reference_layout_ships_ordered_gates() {
        let config = TrackConfig::default();
        let gates = &config.checkpoints;
        assert!(gates.len() >= 8);
        for (i, a) in gates.iter().enumerate() {
            for b in &gates[i + 1..] {
                assert!(!a.intersects(b), "gates {a:?} and {b:?} touch");
            }
        }

        // Leaving the grid straight up clears the first gate only.
        let mut cp = CheckpointManager::new(gates.clone());
        let start = config.solo_start.position;
        let crossing = cp.check_crossing(start, start - Vec2::new(0.0, 80.0));
        assert!(crossing.forward && !crossing.backward);
        assert_eq!(cp.next_index(), 1);
        assert!(crossing.progress > 0.0 && crossing.progress < 1.0);
        for pose in config.duo_starts {
            let step = Segment::new(pose.position, pose.position - Vec2::new(0.0, 80.0));
            assert!(gates[0].intersects(&step));
        }
    }

    #[test]
    fn overlapping_obstacles_share_one_impact() {
        let config = TrackConfig {
            obstacle_pool: vec![IVec2::new(100, 100), IVec2::new(100, 112)],
            obstacle_count: 2,
            obstacle_size: 20,
            obstacle_hitbox_margin: 2,
            ..TrackConfig::default()
        };
        let mut field = ObstacleField::new(&config, None);
        field.regenerate(&mut SmallRng::seed_from_u64(2));
        assert_eq!(field.live_count(), 2);

        // Body spans y 104..128, covering both hitboxes.
        let mut car = Car::new(solid(6, 24), CarConfig::default(), Vec2::ZERO);
        car.reset(Vec2::new(110.0, 116.0));
        for _ in 0..20 {
            car.accelerate(true);
        }
        let before = field.collide(&mut car).unwrap();
        assert!((car.velocity() - before * IMPACT_VELOCITY_FACTOR).abs() < 1e-5);
        assert_eq!(field.live_count(), 0);
    }
}
