use anyhow::{Context, Result};

use crate::dqn::DqnAgent;
use crate::race::RaceController;
use crate::reward::RewardConfig;

#[derive(Debug, Clone, Default)]
pub struct EvalStats {
    pub episodes: usize,
    pub finishes: usize,
    pub crashes: usize,
    pub timeouts: usize,
    pub avg_reward: f64,
    pub avg_progress: f64,
    pub best_time: Option<f32>,
}

impl EvalStats {
    pub fn finish_rate(&self) -> f64 {
        if self.episodes == 0 {
            0.0
        } else {
            self.finishes as f64 / self.episodes as f64
        }
    }
}

/// Greedy rollouts of `agent` on a solo race; the race is restarted for
/// every episode.
pub fn run_eval(
    agent: &mut DqnAgent,
    race: &mut RaceController,
    rewards: &RewardConfig,
    episodes: usize,
    max_steps: u32,
) -> Result<EvalStats> {
    let eval_episodes = episodes.max(1);
    let mut stats = EvalStats {
        episodes: eval_episodes,
        ..Default::default()
    };
    let mut total_reward = 0.0f64;
    let mut total_progress = 0.0f64;

    for _ in 0..eval_episodes {
        race.restart();
        race.skip_countdown();
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u32;

        loop {
            let state = race.observation(0).context("Evaluation race has no car")?;
            let action = agent.get_action(Some(&state), false)?;
            let outcome = race.step(&[action]);
            let info = outcome
                .cars
                .first()
                .copied()
                .context("Evaluation race reported no car")?;
            ep_reward += rewards.evaluate(&info).total;
            ep_steps += 1;

            if info.terminated || ep_steps >= max_steps {
                break;
            }
        }

        let racer = race.racer(0).context("Evaluation race has no car")?;
        if racer.finished() {
            stats.finishes += 1;
            if let Some(t) = racer.finish_time() {
                stats.best_time = Some(stats.best_time.map_or(t, |best| best.min(t)));
            }
        } else if racer.crashed() {
            stats.crashes += 1;
        } else {
            stats.timeouts += 1;
        }
        total_reward += ep_reward;
        total_progress += racer.checkpoints().progress() as f64;
    }

    let denom = eval_episodes as f64;
    stats.avg_reward = total_reward / denom;
    stats.avg_progress = total_progress / denom;
    Ok(stats)
}
