#![allow(dead_code)]

use std::sync::Arc;

use glam::{IVec2, UVec2, Vec2};
use image::{Rgba, RgbaImage};
use racing_rl::{
    AgentConfig, CarColor, ObstacleField, RaceConfig, RaceController, Segment, StartPose, Track,
    TrackAssets, TrackConfig,
};

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
/// Open lane: x in [LANE_LEFT, LANE_RIGHT), y in [LANE_TOP, LANE_BOTTOM).
pub const LANE_LEFT: u32 = 290;
pub const LANE_RIGHT: u32 = 400;
pub const LANE_TOP: u32 = 20;
pub const LANE_BOTTOM: u32 = 460;
/// Gate across the lane between the start and the finish.
pub const GATE_Y: f32 = 350.0;

const OPAQUE: Rgba<u8> = Rgba([30, 30, 30, 255]);
const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Straight vertical lane with the finish line across it. Cars start near
/// the bottom facing up.
pub fn lane_config() -> TrackConfig {
    TrackConfig {
        finish_position: IVec2::new(250, 250),
        finish_size: UVec2::new(180, 25),
        solo_start: StartPose::new(340.0, 400.0),
        duo_starts: [StartPose::new(320.0, 400.0), StartPose::new(370.0, 400.0)],
        car_scale: 1.0,
        obstacle_size: 20,
        obstacle_hitbox_margin: 4,
        obstacle_count: 0,
        obstacle_pool: Vec::new(),
        checkpoints: vec![Segment::new(
            Vec2::new(LANE_LEFT as f32, GATE_Y),
            Vec2::new(LANE_RIGHT as f32, GATE_Y),
        )],
    }
}

pub fn border_image() -> RgbaImage {
    border_with_top(LANE_TOP)
}

/// The lane border with its far wall moved down to `top`.
pub fn border_with_top(top: u32) -> RgbaImage {
    RgbaImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let in_lane = (LANE_LEFT..LANE_RIGHT).contains(&x) && (top..LANE_BOTTOM).contains(&y);
        if in_lane { CLEAR } else { OPAQUE }
    })
}

pub fn car_sprite() -> RgbaImage {
    RgbaImage::from_pixel(16, 28, Rgba([200, 20, 20, 255]))
}

pub fn lane_track(config: TrackConfig) -> Arc<Track> {
    track_with_border(config, &border_image())
}

pub fn track_with_border(config: TrackConfig, border: &RgbaImage) -> Arc<Track> {
    let image = RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([90, 90, 90, 255]));
    let finish = RgbaImage::from_pixel(4, 1, Rgba([255, 255, 255, 255]));
    Arc::new(Track::new(image, border, &finish, config).expect("lane track"))
}

/// Silent race with a fixed obstacle seed.
pub fn quiet_config() -> RaceConfig {
    RaceConfig {
        sound: false,
        seed: Some(7),
        ..RaceConfig::default()
    }
}

pub fn race_with(config: TrackConfig, race_config: RaceConfig, cars: usize) -> RaceController {
    let obstacles = ObstacleField::new(&config, None);
    let track = lane_track(config);
    RaceController::new(track, vec![car_sprite(); cars], obstacles, race_config)
        .expect("lane race")
}

/// Countdown-free solo race on `track`.
pub fn solo_race_on(track: Arc<Track>) -> RaceController {
    let obstacles = ObstacleField::new(track.config(), None);
    let mut race = RaceController::new(track, vec![car_sprite()], obstacles, quiet_config())
        .expect("lane race");
    race.skip_countdown();
    race
}

pub fn solo_race() -> RaceController {
    let mut race = race_with(lane_config(), quiet_config(), 1);
    race.skip_countdown();
    race
}

/// The same lane packaged as loaded assets, for the app shell.
pub fn lane_assets() -> TrackAssets {
    TrackAssets {
        track: RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([90, 90, 90, 255])),
        border: border_image(),
        finish: RgbaImage::from_pixel(4, 1, Rgba([255, 255, 255, 255])),
        obstacle: RgbaImage::from_pixel(20, 20, Rgba([250, 120, 0, 255])),
        cars: CarColor::ALL.into_iter().map(|c| (c, car_sprite())).collect(),
        config: lane_config(),
    }
}

/// Small network so learning tests stay quick on the CPU.
pub fn small_agent_config() -> AgentConfig {
    AgentConfig {
        hidden_sizes: vec![32, 32],
        seed: Some(11),
        ..AgentConfig::default()
    }
}
