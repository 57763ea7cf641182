// =============================================================================
// Racing RL — top-down racer with a DQN driver
// =============================================================================
// Build & Run:
//   cargo run --release --features gui                    # menu
//   cargo run --release --features gui -- play --p2 learned
//   cargo run --release -- train --assets assets --episodes 500
//   cargo run --release -- eval  --model checkpoints/racer.bin

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use racing_rl::dqn::select_device;
use racing_rl::{
    AgentConfig, CarColor, DqnAgent, PlayerKind, RaceConfig, RaceController, RewardConfig,
    TrackAssets, TrainConfig, Trainer, run_eval,
};

// =============================================================================
// Training & Evaluation
// =============================================================================

fn load_assets(dir: &Path) -> Result<TrackAssets> {
    TrackAssets::load(dir).with_context(|| format!("Failed to load track from {}", dir.display()))
}

fn train(args: &TrainArgs) -> Result<()> {
    let assets = load_assets(&args.assets)?;
    let device = select_device(args.cpu);

    let race_config = RaceConfig {
        seed: args.seed,
        ..RaceConfig::default()
    };
    let agent_config = AgentConfig {
        seed: args.seed,
        ..AgentConfig::default()
    };
    let config = TrainConfig {
        episodes: args.episodes,
        max_episode_steps: args.max_steps,
        save_every: args.save_every,
        model_path: args.model.clone(),
        stats_path: args.stats.clone(),
        resume: !args.no_resume,
        car_color: args.color,
    };

    let mut trainer = Trainer::headless(
        &assets,
        race_config,
        agent_config,
        RewardConfig::default(),
        config,
        &device,
    )?;
    trainer.enter();
    trainer.run()?;
    Ok(())
}

fn eval(args: &EvalArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  EVALUATION — greedy rollouts of {}", args.model.display());
    eprintln!("═══════════════════════════════════════════════════════════");

    let assets = load_assets(&args.assets)?;
    let device = select_device(args.cpu);
    let race_config = RaceConfig {
        sound: false,
        seed: args.seed,
        ..RaceConfig::default()
    };
    let agent_config = AgentConfig {
        bearings: race_config.raycast.bearings,
        ..AgentConfig::default()
    };

    let mut agent = DqnAgent::new(&device, agent_config)?;
    agent.load_model(&args.model)?;
    agent.set_inference_mode();

    let track = Arc::new(assets.build_track()?);
    let sprite = assets.car_sprite(args.color)?.clone();
    let mut race = RaceController::new(track, vec![sprite], assets.obstacle_field(), race_config)?;

    let stats = run_eval(
        &mut agent,
        &mut race,
        &RewardConfig::default(),
        args.episodes,
        args.max_steps,
    )?;

    eprintln!(
        "Episodes {} | Finish {:.0}% ({}) | Crash {} | Timeout {} | Avg R {:.1} | Avg progress {:.2} | Best {}",
        stats.episodes,
        stats.finish_rate() * 100.0,
        stats.finishes,
        stats.crashes,
        stats.timeouts,
        stats.avg_reward,
        stats.avg_progress,
        stats
            .best_time
            .map_or_else(|| "—".to_string(), |t| format!("{t:.2}s")),
    );
    Ok(())
}

// =============================================================================
// Windowed App
// =============================================================================

#[cfg(feature = "gui")]
fn run_app(args: &AppArgs, start: racing_rl::Screen) -> Result<()> {
    use racing_rl::render::Frontend;
    use racing_rl::{App, AppContext};

    let assets = Arc::new(load_assets(&args.assets)?);
    let race = RaceConfig {
        sound: !args.no_sound,
        seed: args.seed,
        ..RaceConfig::default()
    };
    let agent = AgentConfig {
        bearings: race.raycast.bearings,
        seed: args.seed,
        ..AgentConfig::default()
    };
    let train = TrainConfig {
        model_path: args.model.clone(),
        ..TrainConfig::default()
    };

    let mut frontend = Frontend::new(&assets, race.fps, race.sound, !args.no_rays)?;
    let ctx = AppContext {
        assets,
        race,
        agent,
        rewards: RewardConfig::default(),
        train,
        colors: [args.color1, args.color2],
        best_times_path: args.best_times.clone(),
        device: select_device(args.cpu),
        train_steps_per_frame: args.train_steps_per_frame,
    };
    let mut app = App::standard(ctx).open_on(start);
    frontend.run(&mut app)
}

#[cfg(not(feature = "gui"))]
fn run_app(_args: &AppArgs, _start: racing_rl::Screen) -> Result<()> {
    anyhow::bail!("This build has no window; rebuild with `--features gui` or use `train` / `eval`")
}

fn play(args: &PlayArgs) -> Result<()> {
    let lineup = racing_rl::Lineup {
        player1: args.p1,
        player2: args.p2,
        color1: args.app.color1,
        color2: args.app.color2,
    };
    lineup.validate()?;
    run_app(&args.app, racing_rl::Screen::Game(lineup))
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "racing-rl", about = "Top-down racer with a DQN driver")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    app: AppArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the menu (default)
    Menu(AppArgs),
    /// Start a race directly
    Play(PlayArgs),
    /// Train the DQN driver headless
    Train(TrainArgs),
    /// Greedy evaluation of a saved model
    Eval(EvalArgs),
}

#[derive(Parser, Clone)]
struct AppArgs {
    #[arg(long, default_value = "assets")]
    assets: PathBuf,
    #[arg(long, default_value = "checkpoints/racer.bin")]
    model: PathBuf,
    #[arg(long, default_value = "best_times.json")]
    best_times: PathBuf,
    #[arg(long, default_value = "red")]
    color1: CarColor,
    #[arg(long, default_value = "green")]
    color2: CarColor,
    #[arg(long, default_value = "4")]
    train_steps_per_frame: u32,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long, default_value_t = false)]
    no_sound: bool,
    #[arg(long, default_value_t = false)]
    no_rays: bool,
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long, default_value = "human")]
    p1: PlayerKind,
    #[arg(long, default_value = "none")]
    p2: PlayerKind,
    #[command(flatten)]
    app: AppArgs,
}

#[derive(Parser)]
struct TrainArgs {
    #[arg(long, default_value = "assets")]
    assets: PathBuf,
    /// Stop after this many episodes (runs until interrupted otherwise)
    #[arg(long)]
    episodes: Option<u64>,
    #[arg(long, default_value = "2000")]
    max_steps: u32,
    #[arg(long, default_value = "10")]
    save_every: u64,
    #[arg(long, default_value = "checkpoints/racer.bin")]
    model: PathBuf,
    #[arg(long, default_value = "checkpoints/training_stats.csv")]
    stats: PathBuf,
    #[arg(long, default_value = "red")]
    color: CarColor,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    #[arg(long, default_value_t = false)]
    no_resume: bool,
}

#[derive(Parser)]
struct EvalArgs {
    #[arg(long, default_value = "assets")]
    assets: PathBuf,
    #[arg(long, default_value = "checkpoints/racer.bin")]
    model: PathBuf,
    #[arg(long, default_value = "10")]
    episodes: usize,
    #[arg(long, default_value = "2000")]
    max_steps: u32,
    #[arg(long, default_value = "red")]
    color: CarColor,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None => run_app(&cli.app, racing_rl::Screen::Menu),
        Some(Commands::Menu(args)) => run_app(args, racing_rl::Screen::Menu),
        Some(Commands::Play(args)) => play(args),
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Eval(args)) => eval(args),
    }
}
