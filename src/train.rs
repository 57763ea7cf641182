use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;

use crate::Features;
use crate::dqn::{AgentConfig, DqnAgent};
use crate::race::{RaceConfig, RaceController};
use crate::replay::Transition;
use crate::reward::{RewardBreakdown, RewardConfig};
use crate::track::{CarColor, TrackAssets};

const CSV_HEADER: &str = "episode,outcome,steps,total_reward,speed,edge,time,obstacle,finish,\
collision,timeout,checkpoint,progress,epsilon,avg_loss,train_step";

// =============================================================================
// Training Schedule
// =============================================================================

#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Stop after this many episodes; `None` trains until told to stop.
    pub episodes: Option<u64>,
    /// Episodes are cut here even if the car is still racing.
    pub max_episode_steps: u32,
    /// Checkpoint and CSV flush period, in episodes.
    pub save_every: u64,
    pub model_path: PathBuf,
    pub stats_path: PathBuf,
    pub resume: bool,
    pub car_color: CarColor,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            episodes: None,
            max_episode_steps: 2_000,
            save_every: 10,
            model_path: PathBuf::from("checkpoints/racer.bin"),
            stats_path: PathBuf::from("checkpoints/training_stats.csv"),
            resume: true,
            car_color: CarColor::Red,
        }
    }
}

fn debug_reward_enabled() -> bool {
    match std::env::var("RACER_DEBUG_REWARD") {
        Ok(val) => matches!(val.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => false,
    }
}

// =============================================================================
// Episode Bookkeeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeOutcome {
    Finish,
    Crash,
    Timeout,
}

impl fmt::Display for EpisodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EpisodeOutcome::Finish => "FINISH",
            EpisodeOutcome::Crash => "CRASH",
            EpisodeOutcome::Timeout => "TIMEOUT",
        })
    }
}

#[derive(Debug, Clone)]
pub struct EpisodeSummary {
    pub episode: u64,
    pub outcome: EpisodeOutcome,
    pub steps: u32,
    pub reward: RewardBreakdown,
    pub progress: f32,
    pub finish_time: Option<f32>,
    pub epsilon: f64,
    pub avg_loss: f32,
    pub train_step: u64,
}

impl EpisodeSummary {
    pub fn csv_row(&self) -> String {
        let r = &self.reward;
        format!(
            "{},{},{},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.6},{:.6},{}",
            self.episode,
            self.outcome,
            self.steps,
            r.total,
            r.speed,
            r.edge,
            r.time,
            r.obstacle,
            r.finish,
            r.collision,
            r.timeout,
            r.checkpoint,
            self.progress,
            self.epsilon,
            self.avg_loss,
            self.train_step,
        )
    }
}

fn append_csv(path: &Path, rows: &[String]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let is_new = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open stats file {}", path.display()))?;
    if is_new {
        writeln!(file, "{CSV_HEADER}")?;
    }
    for row in rows {
        writeln!(file, "{row}")?;
    }
    Ok(())
}

// =============================================================================
// Trainer
// =============================================================================

/// Drives a headless solo race with a learning agent, one tick at a time.
pub struct Trainer {
    race: RaceController,
    agent: DqnAgent,
    rewards: RewardConfig,
    config: TrainConfig,
    episode: u64,
    total_steps: u64,
    ep_steps: u32,
    ep_reward: RewardBreakdown,
    ep_loss: f64,
    loss_count: u32,
    recent_rewards: VecDeque<f64>,
    pending_rows: Vec<String>,
    started: Instant,
    reward_debug: bool,
}

impl Trainer {
    pub fn new(
        mut race: RaceController,
        agent: DqnAgent,
        rewards: RewardConfig,
        config: TrainConfig,
    ) -> Self {
        race.restart();
        race.skip_countdown();
        race.drain_cues();
        Self {
            race,
            agent,
            rewards,
            config,
            episode: 0,
            total_steps: 0,
            ep_steps: 0,
            ep_reward: RewardBreakdown::default(),
            ep_loss: 0.0,
            loss_count: 0,
            recent_rewards: VecDeque::with_capacity(100),
            pending_rows: Vec::new(),
            started: Instant::now(),
            reward_debug: debug_reward_enabled(),
        }
    }

    /// Silent solo race on the given track with a fresh agent.
    pub fn headless(
        assets: &TrackAssets,
        race_config: RaceConfig,
        mut agent_config: AgentConfig,
        rewards: RewardConfig,
        config: TrainConfig,
        device: &Device,
    ) -> Result<Self> {
        let race_config = RaceConfig {
            sound: false,
            ..race_config
        };
        agent_config.bearings = race_config.raycast.bearings;
        let track = Arc::new(assets.build_track()?);
        let sprite = assets.car_sprite(config.car_color)?.clone();
        let race = RaceController::new(track, vec![sprite], assets.obstacle_field(), race_config)?;
        let agent = DqnAgent::new(device, agent_config)?;
        Ok(Self::new(race, agent, rewards, config))
    }

    /// Print the schedule and pick up a saved checkpoint if there is one.
    pub fn enter(&mut self) {
        eprintln!("═══════════════════════════════════════════════════════════");
        eprintln!("  TRAINING — racing DQN agent (Rust + candle)");
        eprintln!("═══════════════════════════════════════════════════════════");
        let ac = self.agent.config();
        eprintln!("Device: {:?}", self.agent.device());
        eprintln!(
            "γ {} | lr {} | batch {} | ε {} → {} (×{}/update) | target sync {} | replay {}",
            ac.gamma,
            ac.learning_rate,
            ac.batch_size,
            ac.epsilon_start,
            ac.epsilon_min,
            ac.epsilon_decay,
            ac.target_sync,
            ac.replay_capacity,
        );
        eprintln!(
            "Episodes {} | step cap {} | save every {} → {}",
            self.config
                .episodes
                .map_or_else(|| "∞".to_string(), |n| n.to_string()),
            self.config.max_episode_steps,
            self.config.save_every,
            self.config.model_path.display(),
        );

        if self.config.resume && self.config.model_path.exists() {
            match self.agent.load_model(&self.config.model_path) {
                Ok(()) => eprintln!(
                    "📦 Resumed from {} (train_step={}, epsilon={:.4}, replay={})",
                    self.config.model_path.display(),
                    self.agent.train_step(),
                    self.agent.epsilon(),
                    self.agent.replay().len()
                ),
                Err(err) => {
                    tracing::warn!("Could not resume from checkpoint: {err:#}");
                    eprintln!("⚠️  Resume failed ({err}). Starting fresh.");
                }
            }
        }
        self.started = Instant::now();
    }

    pub fn agent(&self) -> &DqnAgent {
        &self.agent
    }

    pub fn race(&self) -> &RaceController {
        &self.race
    }

    /// Completed episodes this session.
    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn is_done(&self) -> bool {
        self.config.episodes.is_some_and(|n| self.episode >= n)
    }

    fn observe(&self) -> Result<Features> {
        self.race
            .observation(0)
            .context("Training race has no car")
    }

    /// One environment step plus one learning update. Returns the summary
    /// when the step ended an episode.
    pub fn tick(&mut self) -> Result<Option<EpisodeSummary>> {
        let state = self.observe()?;
        let action = self.agent.get_action(Some(&state), true)?;
        let outcome = self.race.step(&[action]);
        let info = outcome
            .cars
            .first()
            .copied()
            .context("Training race reported no car")?;
        let next_state = self.observe()?;

        let reward = self.rewards.evaluate(&info);
        if self.reward_debug {
            eprintln!("[reward] step {} | {}", self.ep_steps, reward);
        }
        self.ep_steps += 1;
        self.total_steps += 1;
        let done = info.terminated || self.ep_steps >= self.config.max_episode_steps;

        self.agent.remember(Transition {
            state,
            action: action.index(),
            reward: reward.total as f32,
            next_state,
            done,
        });
        if let Some(loss) = self.agent.update()? {
            self.ep_loss += loss as f64;
            self.loss_count += 1;
        }
        self.ep_reward.accumulate(&reward);

        if done {
            Ok(Some(self.finish_episode()))
        } else {
            Ok(None)
        }
    }

    /// Train until the episode budget is spent.
    pub fn run(&mut self) -> Result<Vec<EpisodeSummary>> {
        let mut summaries = Vec::new();
        while !self.is_done() {
            if let Some(summary) = self.tick()? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    fn finish_episode(&mut self) -> EpisodeSummary {
        self.episode += 1;
        let racer = self.race.racers().first();
        let outcome = match racer {
            Some(r) if r.finished() => EpisodeOutcome::Finish,
            Some(r) if r.crashed() => EpisodeOutcome::Crash,
            _ => EpisodeOutcome::Timeout,
        };
        let avg_loss = if self.loss_count > 0 {
            (self.ep_loss / self.loss_count as f64) as f32
        } else {
            0.0
        };
        let summary = EpisodeSummary {
            episode: self.episode,
            outcome,
            steps: self.ep_steps,
            reward: self.ep_reward,
            progress: racer.map_or(0.0, |r| r.checkpoints().progress()),
            finish_time: racer.and_then(|r| r.finish_time()),
            epsilon: self.agent.epsilon(),
            avg_loss,
            train_step: self.agent.train_step(),
        };

        self.recent_rewards.push_back(summary.reward.total);
        if self.recent_rewards.len() > 100 {
            self.recent_rewards.pop_front();
        }
        let avg_reward =
            self.recent_rewards.iter().sum::<f64>() / self.recent_rewards.len() as f64;
        let fps = self.total_steps as f64 / self.started.elapsed().as_secs_f64().max(1e-9);
        eprintln!(
            "Ep {episode:>5} | {outcome:<7} | Steps {steps:>5} | R {total:>8.2} | Avg100 {avg_reward:>7.2} | \
             {breakdown} | ε {eps:.4} | Loss {loss:.5} | FPS {fps:.0}",
            episode = summary.episode,
            outcome = summary.outcome.to_string(),
            steps = summary.steps,
            total = summary.reward.total,
            breakdown = summary.reward,
            eps = summary.epsilon,
            loss = summary.avg_loss,
        );

        self.pending_rows.push(summary.csv_row());
        if self.config.save_every > 0 && self.episode.is_multiple_of(self.config.save_every) {
            self.save();
        }

        self.race.restart();
        self.race.skip_countdown();
        self.ep_steps = 0;
        self.ep_reward = RewardBreakdown::default();
        self.ep_loss = 0.0;
        self.loss_count = 0;
        summary
    }

    /// Persist the checkpoint and flush stats rows. Failures are logged and
    /// retried at the next save.
    pub fn save(&mut self) -> bool {
        let mut ok = true;
        if let Err(err) = self.agent.save_model(&self.config.model_path) {
            tracing::warn!("Checkpoint save failed: {err:#}");
            ok = false;
        }
        if !self.pending_rows.is_empty() {
            match append_csv(&self.config.stats_path, &self.pending_rows) {
                Ok(()) => self.pending_rows.clear(),
                Err(err) => {
                    tracing::warn!("Stats append failed: {err:#}");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Save and hand control back to the caller.
    pub fn exit(&mut self) {
        if self.save() {
            eprintln!(
                "💾 Saved {} after {} episodes ({} steps)",
                self.config.model_path.display(),
                self.episode,
                self.total_steps
            );
        }
    }
}
