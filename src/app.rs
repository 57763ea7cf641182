use anyhow::{Result, bail};
use candle_core::Device;
use std::path::PathBuf;
use std::sync::Arc;

use crate::best_times::BestTimes;
use crate::dqn::{AgentConfig, DqnAgent};
use crate::driver::{Driver, HeldKeys, Key, KeyboardDriver, Lineup, PlayerKind, PolicyDriver};
use crate::race::{RaceConfig, RaceController, RacePhase, SoundCue};
use crate::reward::RewardConfig;
use crate::track::{CarColor, TrackAssets};
use crate::train::{TrainConfig, Trainer};

// =============================================================================
// Shell Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Menu,
    Game(Lineup),
    Training,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneRequest {
    Stay,
    /// Takes effect at the start of the next frame.
    Switch(Screen),
    Quit,
}

/// Keyboard state for one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInput {
    pub held: HeldKeys,
    /// Keys that went down this frame.
    pub pressed: HeldKeys,
    pub close_requested: bool,
}

pub trait Scene {
    fn enter(&mut self, _screen: &Screen) -> Result<()> {
        Ok(())
    }

    fn tick(&mut self, input: &FrameInput) -> Result<SceneRequest>;

    fn exit(&mut self) {}

    /// One-line status for the window title.
    fn status(&self) -> String;

    fn race(&self) -> Option<&RaceController> {
        None
    }

    fn drain_cues(&mut self) -> Vec<SoundCue> {
        Vec::new()
    }
}

// =============================================================================
// Application Shell
// =============================================================================

/// Routes every frame to exactly one scene.
pub struct App {
    menu: Box<dyn Scene>,
    game: Box<dyn Scene>,
    training: Box<dyn Scene>,
    screen: Screen,
    pending: Option<Screen>,
    started: bool,
}

impl App {
    pub fn new(menu: Box<dyn Scene>, game: Box<dyn Scene>, training: Box<dyn Scene>) -> Self {
        Self {
            menu,
            game,
            training,
            screen: Screen::Menu,
            pending: None,
            started: false,
        }
    }

    /// Menu, interactive race and training wired to the same track.
    pub fn standard(ctx: AppContext) -> Self {
        let ctx = Arc::new(ctx);
        Self::new(
            Box::new(MenuScene::new(ctx.colors)),
            Box::new(GameScene::new(ctx.clone())),
            Box::new(TrainingScene::new(ctx)),
        )
    }

    /// Switch to `screen` on the first frame instead of staying on the menu.
    pub fn open_on(mut self, screen: Screen) -> Self {
        if screen != Screen::Menu {
            self.pending = Some(screen);
        }
        self
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    fn scene(&self) -> &dyn Scene {
        match self.screen {
            Screen::Menu => self.menu.as_ref(),
            Screen::Game(_) => self.game.as_ref(),
            Screen::Training => self.training.as_ref(),
        }
    }

    fn scene_mut(&mut self) -> &mut dyn Scene {
        match self.screen {
            Screen::Menu => self.menu.as_mut(),
            Screen::Game(_) => self.game.as_mut(),
            Screen::Training => self.training.as_mut(),
        }
    }

    fn switch_to(&mut self, next: Screen) -> Result<()> {
        self.scene_mut().exit();
        self.screen = next;
        if let Err(err) = self.scene_mut().enter(&next) {
            if next == Screen::Menu {
                return Err(err);
            }
            tracing::warn!("Could not open {next:?}: {err:#}");
            eprintln!("⚠️  {err}");
            self.screen = Screen::Menu;
            self.menu.enter(&Screen::Menu)?;
        }
        Ok(())
    }

    /// Run one frame. Returns false once the app should close.
    pub fn frame(&mut self, input: &FrameInput) -> Result<bool> {
        if !self.started {
            self.started = true;
            self.menu.enter(&Screen::Menu)?;
        }
        if let Some(next) = self.pending.take() {
            self.switch_to(next)?;
        }
        if input.close_requested {
            self.scene_mut().exit();
            return Ok(false);
        }
        match self.scene_mut().tick(input)? {
            SceneRequest::Stay => {}
            SceneRequest::Switch(next) => self.pending = Some(next),
            SceneRequest::Quit => {
                self.scene_mut().exit();
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn status(&self) -> String {
        self.scene().status()
    }

    pub fn race(&self) -> Option<&RaceController> {
        self.scene().race()
    }

    pub fn drain_cues(&mut self) -> Vec<SoundCue> {
        self.scene_mut().drain_cues()
    }
}

/// Everything the standard scenes need.
pub struct AppContext {
    pub assets: Arc<TrackAssets>,
    pub race: RaceConfig,
    pub agent: AgentConfig,
    pub rewards: RewardConfig,
    pub train: TrainConfig,
    pub colors: [CarColor; 2],
    pub best_times_path: PathBuf,
    pub device: Device,
    /// Training ticks run per displayed frame.
    pub train_steps_per_frame: u32,
}

// =============================================================================
// Menu
// =============================================================================

pub struct MenuScene {
    colors: [CarColor; 2],
}

impl MenuScene {
    pub fn new(colors: [CarColor; 2]) -> Self {
        Self { colors }
    }

    fn lineup(&self, player1: PlayerKind, player2: PlayerKind) -> Lineup {
        Lineup {
            player1,
            player2,
            color1: self.colors[0],
            color2: self.colors[1],
        }
    }
}

impl Scene for MenuScene {
    fn tick(&mut self, input: &FrameInput) -> Result<SceneRequest> {
        let p = &input.pressed;
        let request = if p.contains(Key::Escape) {
            SceneRequest::Quit
        } else if p.contains(Key::Num1) {
            SceneRequest::Switch(Screen::Game(self.lineup(PlayerKind::Human, PlayerKind::None)))
        } else if p.contains(Key::Num2) {
            SceneRequest::Switch(Screen::Game(self.lineup(PlayerKind::Human, PlayerKind::Learned)))
        } else if p.contains(Key::Num3) {
            SceneRequest::Switch(Screen::Game(self.lineup(PlayerKind::Human, PlayerKind::Human)))
        } else if p.contains(Key::Space) {
            SceneRequest::Switch(Screen::Game(self.lineup(PlayerKind::Learned, PlayerKind::None)))
        } else if p.contains(Key::Enter) {
            SceneRequest::Switch(Screen::Training)
        } else {
            SceneRequest::Stay
        };
        Ok(request)
    }

    fn status(&self) -> String {
        "Racer | 1: solo | 2: vs AI | 3: two players | Space: watch AI | Enter: train | Esc: quit"
            .to_string()
    }
}

// =============================================================================
// Interactive Race
// =============================================================================

pub struct GameScene {
    ctx: Arc<AppContext>,
    lineup: Lineup,
    race: Option<RaceController>,
    drivers: Vec<Box<dyn Driver>>,
    recorded: bool,
    last_rank: Option<usize>,
}

impl GameScene {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            lineup: Lineup::default(),
            race: None,
            drivers: Vec::new(),
            recorded: false,
            last_rank: None,
        }
    }

    fn learned_driver(&self) -> Result<Box<dyn Driver>> {
        let mut agent = DqnAgent::new(&self.ctx.device, self.ctx.agent.clone())?;
        agent.set_inference_mode();
        let path = &self.ctx.train.model_path;
        if let Err(err) = agent.load_model(path) {
            tracing::warn!("No trained model at {}: {err:#}", path.display());
            eprintln!("⚠️  Learned driver is untrained ({err}).");
        }
        Ok(Box::new(PolicyDriver::new(agent)))
    }

    /// Store a solo human's finish time once per race.
    fn record_best_time(&mut self) {
        if self.recorded {
            return;
        }
        let Some(race) = self.race.as_ref() else {
            return;
        };
        if race.phase() != RacePhase::Finished {
            return;
        }
        self.recorded = true;
        let seats = self.lineup.seats();
        if seats.len() != 1 || seats[0].0 != PlayerKind::Human {
            return;
        }
        let Some(time) = race.racer(0).and_then(|r| r.finish_time()) else {
            return;
        };
        let result = BestTimes::load(&self.ctx.best_times_path).and_then(|mut t| t.record(time));
        match result {
            Ok(rank) => {
                self.last_rank = Some(rank);
                tracing::info!(time, rank, "best time recorded");
            }
            Err(err) => tracing::warn!("Could not record best time: {err:#}"),
        }
    }
}

impl Scene for GameScene {
    fn enter(&mut self, screen: &Screen) -> Result<()> {
        let Screen::Game(lineup) = *screen else {
            bail!("Game scene opened for {screen:?}");
        };
        lineup.validate()?;

        let assets = &self.ctx.assets;
        let mut sprites = Vec::new();
        let mut drivers: Vec<Box<dyn Driver>> = Vec::new();
        for (kind, color, keymap) in lineup.seats() {
            let driver: Box<dyn Driver> = match kind {
                PlayerKind::Human => Box::new(KeyboardDriver::new(keymap)),
                PlayerKind::Learned => self.learned_driver()?,
                PlayerKind::None => continue,
            };
            sprites.push(assets.car_sprite(color)?.clone());
            drivers.push(driver);
        }

        let track = Arc::new(assets.build_track()?);
        self.race = Some(RaceController::new(
            track,
            sprites,
            assets.obstacle_field(),
            self.ctx.race.clone(),
        )?);
        self.drivers = drivers;
        self.lineup = lineup;
        self.recorded = false;
        self.last_rank = None;
        tracing::info!(p1 = %lineup.player1, p2 = %lineup.player2, "race started");
        Ok(())
    }

    fn tick(&mut self, input: &FrameInput) -> Result<SceneRequest> {
        let Some(race) = self.race.as_mut() else {
            return Ok(SceneRequest::Switch(Screen::Menu));
        };
        let pressed = &input.pressed;
        if pressed.contains(Key::Escape) {
            return Ok(SceneRequest::Switch(Screen::Menu));
        }
        if pressed.contains(Key::P) {
            race.toggle_pause();
        }
        if race.phase().is_over() && (pressed.contains(Key::R) || pressed.contains(Key::Enter)) {
            race.restart();
            self.recorded = false;
            self.last_rank = None;
            return Ok(SceneRequest::Stay);
        }

        for driver in &mut self.drivers {
            driver.observe_keys(input.held);
        }
        race.tick_with_drivers(&mut self.drivers)?;
        self.record_best_time();
        Ok(SceneRequest::Stay)
    }

    fn exit(&mut self) {
        self.race = None;
        self.drivers.clear();
    }

    fn status(&self) -> String {
        let Some(race) = self.race.as_ref() else {
            return "Racer".to_string();
        };
        let clocks = race
            .racers()
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let state = if r.finished() {
                    format!("{:.2}s ✓", r.finish_time().unwrap_or(0.0))
                } else if r.crashed() {
                    "crashed".to_string()
                } else if r.timed_out() {
                    "out of time".to_string()
                } else {
                    format!("{:.1}s", race.remaining_secs(i).unwrap_or(0.0))
                };
                format!("P{} {state}", i + 1)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        match race.phase() {
            RacePhase::Countdown => format!("Racer | {}", race.countdown_digit().unwrap_or(0)),
            RacePhase::Running => format!("Racer | {clocks}"),
            RacePhase::Paused => format!("Racer | PAUSED (P) | {clocks}"),
            RacePhase::Finished => {
                let rank = self
                    .last_rank
                    .map(|r| format!(" | best times #{}", r + 1))
                    .unwrap_or_default();
                format!("Racer | FINISHED | {clocks}{rank} | R: restart | Esc: menu")
            }
            RacePhase::Failed => format!("Racer | FAILED | {clocks} | R: restart | Esc: menu"),
        }
    }

    fn race(&self) -> Option<&RaceController> {
        self.race.as_ref()
    }

    fn drain_cues(&mut self) -> Vec<SoundCue> {
        self.race
            .as_mut()
            .map(RaceController::drain_cues)
            .unwrap_or_default()
    }
}

// =============================================================================
// Training
// =============================================================================

pub struct TrainingScene {
    ctx: Arc<AppContext>,
    trainer: Option<Trainer>,
}

impl TrainingScene {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx, trainer: None }
    }
}

impl Scene for TrainingScene {
    fn enter(&mut self, _screen: &Screen) -> Result<()> {
        let mut trainer = Trainer::headless(
            &self.ctx.assets,
            self.ctx.race.clone(),
            self.ctx.agent.clone(),
            self.ctx.rewards.clone(),
            self.ctx.train.clone(),
            &self.ctx.device,
        )?;
        trainer.enter();
        self.trainer = Some(trainer);
        Ok(())
    }

    fn tick(&mut self, input: &FrameInput) -> Result<SceneRequest> {
        let Some(trainer) = self.trainer.as_mut() else {
            return Ok(SceneRequest::Switch(Screen::Menu));
        };
        if input.pressed.contains(Key::Escape) {
            return Ok(SceneRequest::Switch(Screen::Menu));
        }
        for _ in 0..self.ctx.train_steps_per_frame.max(1) {
            trainer.tick()?;
            if trainer.is_done() {
                return Ok(SceneRequest::Switch(Screen::Menu));
            }
        }
        Ok(SceneRequest::Stay)
    }

    fn exit(&mut self) {
        if let Some(mut trainer) = self.trainer.take() {
            trainer.exit();
        }
    }

    fn status(&self) -> String {
        match self.trainer.as_ref() {
            Some(t) => format!(
                "Racer — Training | Ep {} | Steps {} | ε {:.4} | Updates {} | Esc: save & menu",
                t.episode() + 1,
                t.total_steps(),
                t.agent().epsilon(),
                t.agent().train_step(),
            ),
            None => "Racer — Training".to_string(),
        }
    }

    fn race(&self) -> Option<&RaceController> {
        self.trainer.as_ref().map(Trainer::race)
    }
}
