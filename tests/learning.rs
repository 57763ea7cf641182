mod common;

use anyhow::Result;
use candle_core::Device;
use common::*;
use racing_rl::{AgentConfig, DqnAgent, RaceConfig, RewardConfig, TrainConfig, Trainer, run_eval};

fn short_race() -> RaceConfig {
    RaceConfig {
        target_time: 2.0,
        ..quiet_config()
    }
}

fn lane_trainer(
    agent_config: AgentConfig,
    mut race_config: RaceConfig,
    config: TrainConfig,
) -> Result<Trainer> {
    race_config.raycast.bearings = agent_config.bearings;
    let race = race_with(lane_config(), race_config, 1);
    let agent = DqnAgent::new(&Device::Cpu, agent_config)?;
    Ok(Trainer::new(race, agent, RewardConfig::default(), config))
}

#[test]
fn replay_and_updates_follow_the_schedule() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let agent_config = AgentConfig {
        replay_capacity: 500,
        batch_size: 64,
        target_sync: 10,
        ..small_agent_config()
    };
    let config = TrainConfig {
        model_path: tmp.path().join("racer.bin"),
        stats_path: tmp.path().join("stats.csv"),
        resume: false,
        ..TrainConfig::default()
    };
    let mut trainer = lane_trainer(agent_config, quiet_config(), config)?;

    for _ in 0..63 {
        trainer.tick()?;
    }
    assert_eq!(trainer.agent().train_step(), 0, "no updates before a full batch");
    assert_eq!(trainer.agent().epsilon(), 1.0);

    for _ in 63..603 {
        if let Some(summary) = trainer.tick()? {
            assert!(summary.avg_loss.is_finite(), "episode {}", summary.episode);
        }
    }
    let agent = trainer.agent();
    assert_eq!(trainer.total_steps(), 603);
    assert_eq!(agent.replay().len(), 500);
    assert_eq!(agent.train_step(), 540);
    let expected_eps = 0.999f64.powi(540);
    assert!((agent.epsilon() - expected_eps).abs() < 1e-9);

    // 540 is a sync boundary, so the target net matches the online net.
    let state = trainer.race().observation(0).unwrap();
    let online = agent.q_values(&state)?;
    let target = agent.target_q_values(&state)?;
    for (o, t) in online.iter().zip(&target) {
        assert!((o - t).abs() < 1e-6, "online {online:?} target {target:?}");
    }
    Ok(())
}

#[test]
fn training_writes_stats_and_checkpoints() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let model_path = tmp.path().join("ckpt").join("racer.bin");
    let stats_path = tmp.path().join("ckpt").join("stats.csv");
    let agent_config = AgentConfig {
        batch_size: 16,
        ..small_agent_config()
    };
    let config = TrainConfig {
        episodes: Some(10),
        save_every: 5,
        model_path: model_path.clone(),
        stats_path: stats_path.clone(),
        resume: false,
        ..TrainConfig::default()
    };

    let mut trainer = lane_trainer(agent_config.clone(), short_race(), config.clone())?;
    trainer.enter();
    let summaries = trainer.run()?;
    trainer.exit();

    assert_eq!(summaries.len(), 10);
    assert!(trainer.is_done());
    for (i, s) in summaries.iter().enumerate() {
        assert_eq!(s.episode, i as u64 + 1);
        // Two seconds at 60 fps.
        assert!(s.steps >= 1 && s.steps <= 120, "episode {} ran {} steps", s.episode, s.steps);
    }
    let total: u64 = summaries.iter().map(|s| s.steps as u64).sum();
    assert_eq!(trainer.total_steps(), total);

    let csv = std::fs::read_to_string(&stats_path)?;
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 11);
    assert!(lines[0].starts_with("episode,outcome,steps,total_reward"));
    assert!(lines[1].starts_with("1,"));
    assert!(lines[10].starts_with("10,"));

    // The checkpoint restores the full learning state.
    let mut restored = DqnAgent::new(&Device::Cpu, agent_config.clone())?;
    restored.load_model(&model_path)?;
    assert_eq!(restored.train_step(), trainer.agent().train_step());
    assert_eq!(restored.epsilon(), trainer.agent().epsilon());
    assert_eq!(restored.replay().len(), trainer.agent().replay().len());
    let state = trainer.race().observation(0).unwrap();
    assert_eq!(restored.q_values(&state)?, trainer.agent().q_values(&state)?);

    // A resumed trainer picks up where the last one stopped.
    let resumed_config = TrainConfig {
        resume: true,
        ..config
    };
    let mut resumed = lane_trainer(agent_config, short_race(), resumed_config)?;
    resumed.enter();
    assert_eq!(resumed.agent().train_step(), trainer.agent().train_step());
    Ok(())
}

#[test]
fn greedy_eval_reports_every_episode() -> Result<()> {
    let agent_config = small_agent_config();
    let mut race_config = short_race();
    race_config.raycast.bearings = agent_config.bearings;
    let mut race = race_with(lane_config(), race_config, 1);
    let mut agent = DqnAgent::new(&Device::Cpu, agent_config)?;
    agent.set_inference_mode();

    let stats = run_eval(&mut agent, &mut race, &RewardConfig::default(), 3, 500)?;
    assert_eq!(stats.episodes, 3);
    assert_eq!(stats.finishes + stats.crashes + stats.timeouts, 3);
    assert!((0.0..=1.0).contains(&stats.finish_rate()));
    assert!((0.0..=1.0).contains(&stats.avg_progress));
    assert_eq!(stats.best_time.is_some(), stats.finishes > 0);
    Ok(())
}
