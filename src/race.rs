use anyhow::{Result, bail};
use image::RgbaImage;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::car::{Car, CarConfig};
use crate::checkpoint::CheckpointManager;
use crate::driver::{Action, Driver, Throttle};
use crate::raycast::{RayCaster, RaycastConfig};
use crate::track::{ObstacleField, StartPose, Track};
use crate::{Features, NUM_RAYS, STATE_DIM};

/// Finish-local rows at or above this are the wrong side of the line.
const FINISH_ENTRY_ROW: u32 = 2;
/// Obstacle impacts slower than this are not reported.
const MEANINGFUL_IMPACT_VELOCITY: f32 = 1.0;

// =============================================================================
// Race Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    pub fps: u32,
    /// Seconds each car has to reach the finish line.
    pub target_time: f32,
    pub countdown_secs: u32,
    pub car: CarConfig,
    pub raycast: RaycastConfig,
    /// Obstacle shuffle seed; `None` draws from the OS.
    pub seed: Option<u64>,
    /// Emit sound cues. Headless races turn this off.
    pub sound: bool,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            target_time: 25.0,
            countdown_secs: 3,
            car: CarConfig::default(),
            raycast: RaycastConfig::default(),
            seed: None,
            sound: true,
        }
    }
}

impl RaceConfig {
    pub fn tick_budget(&self) -> u32 {
        (self.target_time * self.fps as f32).round() as u32
    }
}

// =============================================================================
// Race State Machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RacePhase {
    Countdown,
    Running,
    Paused,
    Finished,
    Failed,
}

impl RacePhase {
    /// Transitions allowed inside one race. Restart re-enters `Countdown`
    /// from anywhere and is not a transition.
    pub fn can_advance_to(self, next: RacePhase) -> bool {
        use RacePhase::*;
        matches!(
            (self, next),
            (Countdown, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Finished)
                | (Running, Failed)
        )
    }

    pub fn is_over(self) -> bool {
        matches!(self, RacePhase::Finished | RacePhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    CountdownBeep,
    Go,
    Crash,
    Win,
    ObstacleBump,
    MusicStart,
    MusicPause,
    MusicResume,
    MusicStop,
    /// Cut any effect still playing.
    StopEffects,
}

struct CueQueue {
    enabled: bool,
    pending: Vec<SoundCue>,
}

impl CueQueue {
    fn push(&mut self, cue: SoundCue) {
        if self.enabled {
            self.pending.push(cue);
        }
    }
}

// =============================================================================
// Per-Car Results
// =============================================================================

/// What happened to one car during one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepInfo {
    pub velocity: f32,
    pub max_velocity: f32,
    /// Normalized ray distances after the tick.
    pub rays: [f32; NUM_RAYS],
    pub min_ray: f32,
    pub hit_obstacle: bool,
    pub finished: bool,
    pub collision: bool,
    pub timeout: bool,
    pub checkpoint_forward: bool,
    pub checkpoint_backward: bool,
    pub progress: f32,
    /// The car is done for this race (this tick or earlier).
    pub terminated: bool,
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub phase: RacePhase,
    pub cars: Vec<StepInfo>,
}

pub struct Racer {
    car: Car,
    rays: RayCaster,
    checkpoints: CheckpointManager,
    start: StartPose,
    finished: bool,
    timed_out: bool,
    ticks_remaining: u32,
    ticks_elapsed: u32,
    finish_time: Option<f32>,
}

impl Racer {
    pub fn car(&self) -> &Car {
        &self.car
    }

    pub fn rays(&self) -> &RayCaster {
        &self.rays
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn crashed(&self) -> bool {
        self.car.failed()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn terminated(&self) -> bool {
        self.finished || self.timed_out || self.car.failed()
    }

    pub fn ticks_remaining(&self) -> u32 {
        self.ticks_remaining
    }

    pub fn ticks_elapsed(&self) -> u32 {
        self.ticks_elapsed
    }

    /// Race time in seconds at the finishing tick.
    pub fn finish_time(&self) -> Option<f32> {
        self.finish_time
    }

    fn reset(&mut self, track: &Track, obstacles: &ObstacleField, tick_budget: u32) {
        self.car.reset_pose(self.start.position, self.start.heading);
        self.checkpoints.reset();
        self.finished = false;
        self.timed_out = false;
        self.ticks_remaining = tick_budget;
        self.ticks_elapsed = 0;
        self.finish_time = None;
        self.recast(track, obstacles);
    }

    fn recast(&mut self, track: &Track, obstacles: &ObstacleField) {
        self.rays.cast(
            self.car.position(),
            self.car.heading(),
            track.border(),
            obstacles.obstacles(),
        );
    }

    fn snapshot(&self) -> StepInfo {
        let rays = self.rays.normalized();
        StepInfo {
            velocity: self.car.velocity(),
            max_velocity: self.car.config().max_velocity,
            min_ray: rays.into_iter().fold(1.0, f32::min),
            rays,
            progress: self.checkpoints.progress(),
            terminated: self.terminated(),
            ..StepInfo::default()
        }
    }

    /// One running tick: timer, controls, gates, obstacles, finish, border.
    fn tick(
        &mut self,
        action: Action,
        track: &Track,
        obstacles: &mut ObstacleField,
        fps: u32,
        cues: &mut CueQueue,
    ) -> StepInfo {
        self.ticks_elapsed += 1;
        self.ticks_remaining = self.ticks_remaining.saturating_sub(1);
        if self.ticks_remaining == 0 {
            self.timed_out = true;
            self.car.set_can_move(false);
            let mut info = self.snapshot();
            info.timeout = true;
            return info;
        }

        let prev = self.car.position();
        if let Some(steer) = action.steer() {
            self.car.rotate(steer);
        }
        match action.throttle() {
            Throttle::Forward => self.car.accelerate(true),
            Throttle::Reverse => self.car.accelerate(false),
            Throttle::Coast => self.car.reduce_speed(),
        }
        self.car.advance();

        let crossing = self.checkpoints.check_crossing(prev, self.car.position());

        let mut hit_obstacle = false;
        if let Some(before) = obstacles.collide(&mut self.car)
            && before.abs() > MEANINGFUL_IMPACT_VELOCITY
        {
            hit_obstacle = true;
            cues.push(SoundCue::ObstacleBump);
        }

        let mut finished = false;
        let mut collision = false;
        match track.finish_overlap(&self.car) {
            Some((_, y)) if y > FINISH_ENTRY_ROW => finished = true,
            Some(_) => collision = true,
            None => collision = track.hits_border(&self.car),
        }

        if finished {
            self.finished = true;
            self.finish_time = Some(self.ticks_elapsed as f32 / fps as f32);
            self.car.set_can_move(false);
            cues.push(SoundCue::Win);
        } else if collision {
            self.car.fail();
            cues.push(SoundCue::Crash);
        }

        self.recast(track, obstacles);

        let mut info = self.snapshot();
        info.hit_obstacle = hit_obstacle;
        info.finished = finished;
        info.collision = collision;
        info.checkpoint_forward = crossing.forward;
        info.checkpoint_backward = crossing.backward;
        info
    }
}

// =============================================================================
// Race Controller
// =============================================================================

/// Owns the cars, obstacles and checkpoints of one race on a shared track.
pub struct RaceController {
    track: Arc<Track>,
    obstacles: ObstacleField,
    racers: Vec<Racer>,
    config: RaceConfig,
    phase: RacePhase,
    countdown_ticks: u32,
    rng: SmallRng,
    cues: CueQueue,
}

impl RaceController {
    /// One sprite per car; one car races from the solo start, two from the
    /// side-by-side grid.
    pub fn new(
        track: Arc<Track>,
        sprites: Vec<RgbaImage>,
        obstacles: ObstacleField,
        config: RaceConfig,
    ) -> Result<Self> {
        let starts: Vec<StartPose> = match sprites.len() {
            1 => vec![track.config().solo_start],
            2 => track.config().duo_starts.to_vec(),
            n => bail!("A race needs one or two cars, got {n}"),
        };

        let racers = sprites
            .into_iter()
            .zip(starts)
            .map(|(sprite, start)| Racer {
                car: Car::new(sprite, config.car, start.position),
                rays: RayCaster::new(config.raycast),
                checkpoints: CheckpointManager::new(track.config().checkpoints.clone()),
                start,
                finished: false,
                timed_out: false,
                ticks_remaining: config.tick_budget(),
                ticks_elapsed: 0,
                finish_time: None,
            })
            .collect();

        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        let mut race = Self {
            track,
            obstacles,
            racers,
            cues: CueQueue {
                enabled: config.sound,
                pending: Vec::new(),
            },
            config,
            phase: RacePhase::Countdown,
            countdown_ticks: 0,
            rng,
        };
        race.restart();
        Ok(race)
    }

    /// Reset every car, reshuffle obstacles and re-enter the countdown.
    pub fn restart(&mut self) {
        self.obstacles.regenerate(&mut self.rng);
        let budget = self.config.tick_budget();
        for racer in &mut self.racers {
            racer.reset(&self.track, &self.obstacles, budget);
        }
        self.phase = RacePhase::Countdown;
        self.countdown_ticks = self.config.countdown_secs * self.config.fps;
        self.cues.push(SoundCue::StopEffects);
        self.cues.push(SoundCue::MusicStop);
        tracing::debug!(cars = self.racers.len(), "race restarted");
    }

    /// Jump straight to `Running`, for headless races.
    pub fn skip_countdown(&mut self) {
        if self.phase == RacePhase::Countdown {
            self.countdown_ticks = 0;
            self.set_phase(RacePhase::Running);
        }
    }

    pub fn toggle_pause(&mut self) -> RacePhase {
        match self.phase {
            RacePhase::Running => {
                self.set_phase(RacePhase::Paused);
                self.cues.push(SoundCue::MusicPause);
            }
            RacePhase::Paused => {
                self.set_phase(RacePhase::Running);
                self.cues.push(SoundCue::MusicResume);
            }
            _ => {}
        }
        self.phase
    }

    fn set_phase(&mut self, next: RacePhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal race transition {:?} -> {next:?}",
            self.phase
        );
        tracing::debug!(from = ?self.phase, to = ?next, "race phase");
        self.phase = next;
    }

    /// Advance one frame. `actions[i]` drives car `i`; missing entries idle.
    pub fn step(&mut self, actions: &[Action]) -> TickOutcome {
        match self.phase {
            RacePhase::Countdown => self.tick_countdown(),
            RacePhase::Running => return self.tick_running(actions),
            RacePhase::Paused | RacePhase::Finished | RacePhase::Failed => {}
        }
        TickOutcome {
            phase: self.phase,
            cars: self.racers.iter().map(Racer::snapshot).collect(),
        }
    }

    fn tick_countdown(&mut self) {
        let fps = self.config.fps.max(1);
        if self.countdown_ticks > 0 && self.countdown_ticks.is_multiple_of(fps) {
            self.cues.push(SoundCue::CountdownBeep);
        }
        self.countdown_ticks = self.countdown_ticks.saturating_sub(1);
        if self.countdown_ticks == 0 {
            self.set_phase(RacePhase::Running);
            self.cues.push(SoundCue::Go);
            self.cues.push(SoundCue::MusicStart);
        }
    }

    fn tick_running(&mut self, actions: &[Action]) -> TickOutcome {
        let Self {
            track,
            obstacles,
            racers,
            config,
            cues,
            ..
        } = self;

        let mut cars = Vec::with_capacity(racers.len());
        for (i, racer) in racers.iter_mut().enumerate() {
            if racer.terminated() {
                cars.push(racer.snapshot());
                continue;
            }
            let action = actions.get(i).copied().unwrap_or(Action::Idle);
            cars.push(racer.tick(action, track.as_ref(), obstacles, config.fps, cues));
        }

        if self.racers.iter().all(Racer::terminated) {
            if self.racers.iter().any(Racer::finished) {
                self.set_phase(RacePhase::Finished);
            } else {
                self.set_phase(RacePhase::Failed);
            }
            self.cues.push(SoundCue::MusicStop);
        }

        TickOutcome {
            phase: self.phase,
            cars,
        }
    }

    /// Ask each driver for its action and advance one frame. Drivers are only
    /// consulted while the race is running.
    pub fn tick_with_drivers(&mut self, drivers: &mut [Box<dyn Driver>]) -> Result<TickOutcome> {
        let mut actions = vec![Action::Idle; self.racers.len()];
        if self.phase == RacePhase::Running {
            for (slot, driver) in drivers.iter_mut().enumerate().take(self.racers.len()) {
                let observation = self.observation(slot);
                actions[slot] = driver.action(observation.as_ref())?;
            }
        }
        Ok(self.step(&actions))
    }

    /// Learner-facing state of car `slot`: normalized rays, signed velocity,
    /// heading as sin/cos, and position scaled to the track.
    pub fn observation(&self, slot: usize) -> Option<Features> {
        let racer = self.racers.get(slot)?;
        let car = &racer.car;
        let mut features = [0.0f32; STATE_DIM];
        features[..NUM_RAYS].copy_from_slice(&racer.rays.normalized());
        let heading = car.heading().to_radians();
        let pos = car.position();
        features[NUM_RAYS] = (car.velocity() / car.config().max_velocity).clamp(-1.0, 1.0);
        features[NUM_RAYS + 1] = heading.sin();
        features[NUM_RAYS + 2] = heading.cos();
        features[NUM_RAYS + 3] = (pos.x / self.track.width() as f32).clamp(0.0, 1.0);
        features[NUM_RAYS + 4] = (pos.y / self.track.height() as f32).clamp(0.0, 1.0);
        Some(features)
    }

    pub fn drain_cues(&mut self) -> Vec<SoundCue> {
        std::mem::take(&mut self.cues.pending)
    }

    pub fn phase(&self) -> RacePhase {
        self.phase
    }

    /// Digit to show during the countdown.
    pub fn countdown_digit(&self) -> Option<u32> {
        (self.phase == RacePhase::Countdown)
            .then(|| self.countdown_ticks.div_ceil(self.config.fps.max(1)))
    }

    pub fn config(&self) -> &RaceConfig {
        &self.config
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn obstacles(&self) -> &ObstacleField {
        &self.obstacles
    }

    pub fn racers(&self) -> &[Racer] {
        &self.racers
    }

    pub fn racer(&self, slot: usize) -> Option<&Racer> {
        self.racers.get(slot)
    }

    pub fn car(&self, slot: usize) -> Option<&Car> {
        self.racers.get(slot).map(|r| &r.car)
    }

    pub fn remaining_secs(&self, slot: usize) -> Option<f32> {
        self.racers
            .get(slot)
            .map(|r| r.ticks_remaining as f32 / self.config.fps as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackConfig;
    use glam::{IVec2, UVec2, Vec2};
    use image::Rgba;

    /// Open 300x300 field with a 10px wall ring and the finish line far away.
    fn open_race(cars: usize, config: RaceConfig) -> RaceController {
        let border = RgbaImage::from_fn(300, 300, |x, y| {
            let wall = !(10..290).contains(&x) || !(10..290).contains(&y);
            Rgba([0, 0, 0, if wall { 255 } else { 0 }])
        });
        let track_config = TrackConfig {
            finish_position: IVec2::new(100, 20),
            finish_size: UVec2::new(100, 10),
            solo_start: StartPose::new(150.0, 200.0),
            duo_starts: [StartPose::new(120.0, 200.0), StartPose::new(180.0, 200.0)],
            obstacle_count: 0,
            checkpoints: Vec::new(),
            ..TrackConfig::default()
        };
        let solid = |w, h| RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]));
        let track =
            Track::new(solid(300, 300), &border, &solid(1, 1), track_config.clone()).unwrap();
        let field = ObstacleField::new(&track_config, None);
        RaceController::new(Arc::new(track), vec![solid(8, 14); cars], field, config).unwrap()
    }

    #[test]
    fn only_listed_transitions_are_legal() {
        use RacePhase::*;
        let all = [Countdown, Running, Paused, Finished, Failed];
        let legal: Vec<_> = all
            .iter()
            .flat_map(|a| all.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_advance_to(*b))
            .collect();
        assert_eq!(
            legal,
            vec![
                (Countdown, Running),
                (Running, Paused),
                (Running, Finished),
                (Running, Failed),
                (Paused, Running),
            ]
        );
    }

    #[test]
    fn countdown_lasts_configured_seconds_and_beeps_each_digit() {
        let mut race = open_race(1, RaceConfig::default());
        race.drain_cues();
        assert_eq!(race.countdown_digit(), Some(3));
        for _ in 0..179 {
            race.step(&[Action::Forward]);
        }
        assert_eq!(race.phase(), RacePhase::Countdown);
        assert_eq!(race.countdown_digit(), Some(1));
        // Input is ignored while counting down.
        assert_eq!(race.car(0).unwrap().velocity(), 0.0);
        race.step(&[Action::Forward]);
        assert_eq!(race.phase(), RacePhase::Running);

        let cues = race.drain_cues();
        let beeps = cues.iter().filter(|c| **c == SoundCue::CountdownBeep).count();
        assert_eq!(beeps, 3);
        assert!(cues.contains(&SoundCue::Go));
    }

    #[test]
    fn pause_freezes_cars_and_timers() {
        let mut race = open_race(1, RaceConfig::default());
        race.skip_countdown();
        race.step(&[Action::Forward]);
        let remaining = race.racer(0).unwrap().ticks_remaining();
        let pos = race.car(0).unwrap().position();

        assert_eq!(race.toggle_pause(), RacePhase::Paused);
        for _ in 0..30 {
            race.step(&[Action::Forward]);
        }
        assert_eq!(race.racer(0).unwrap().ticks_remaining(), remaining);
        assert_eq!(race.car(0).unwrap().position(), pos);

        assert_eq!(race.toggle_pause(), RacePhase::Running);
        race.step(&[Action::Forward]);
        assert_eq!(race.racer(0).unwrap().ticks_remaining(), remaining - 1);
    }

    #[test]
    fn restart_resets_cars_and_reenters_countdown() {
        let mut race = open_race(2, RaceConfig::default());
        race.skip_countdown();
        for _ in 0..20 {
            race.step(&[Action::ForwardLeft, Action::Reverse]);
        }
        race.restart();
        assert_eq!(race.phase(), RacePhase::Countdown);
        assert_eq!(race.car(0).unwrap().position(), Vec2::new(120.0, 200.0));
        assert_eq!(race.car(1).unwrap().position(), Vec2::new(180.0, 200.0));
        assert!(race.racers().iter().all(|r| !r.terminated()));
        assert_eq!(race.racer(0).unwrap().ticks_remaining(), 1500);
    }

    #[test]
    fn observation_is_bounded() {
        let mut race = open_race(1, RaceConfig::default());
        race.skip_countdown();
        for t in 0..120 {
            let action = if t % 3 == 0 { Action::ForwardRight } else { Action::Forward };
            race.step(&[action]);
            let obs = race.observation(0).unwrap();
            assert!(obs.iter().all(|v| v.is_finite() && (-1.0..=1.0).contains(v)));
            assert!((0.0..=1.0).contains(&obs[STATE_DIM - 1]));
        }
        assert!(race.observation(1).is_none());
    }

    #[test]
    fn quiet_race_emits_no_cues() {
        let config = RaceConfig {
            sound: false,
            ..RaceConfig::default()
        };
        let mut race = open_race(1, config);
        for _ in 0..200 {
            race.step(&[Action::Forward]);
        }
        assert!(race.drain_cues().is_empty());
    }

    #[test]
    fn three_cars_are_rejected() {
        let solid = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        let track = Track::new(solid.clone(), &solid, &solid, TrackConfig::default()).unwrap();
        let field = ObstacleField::new(&TrackConfig::default(), None);
        let race = RaceController::new(
            Arc::new(track),
            vec![solid.clone(), solid.clone(), solid],
            field,
            RaceConfig::default(),
        );
        assert!(race.is_err());
    }
}
