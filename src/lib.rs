/// Rays cast from every car; the observation layout depends on it.
pub const NUM_RAYS: usize = 17;
/// Rays, signed velocity, sin/cos heading, normalized x and y.
pub const STATE_DIM: usize = NUM_RAYS + 5;
pub type Features = [f32; STATE_DIM];

pub mod app;
pub mod best_times;
pub mod car;
pub mod checkpoint;
pub mod dqn;
pub mod driver;
pub mod eval;
pub mod geometry;
pub mod mask;
pub mod race;
pub mod raycast;
pub mod replay;
pub mod reward;
pub mod track;
pub mod train;

#[cfg(feature = "gui")]
pub mod audio;
#[cfg(feature = "gui")]
pub mod render;

pub use app::{App, AppContext, FrameInput, Scene, SceneRequest, Screen};
pub use best_times::{BestTime, BestTimes};
pub use car::{Car, CarConfig, Steer};
pub use checkpoint::{CheckpointManager, Crossing};
pub use dqn::{AgentConfig, DqnAgent, DqnNet, ObservationLayout};
pub use driver::{
    Action, Driver, HeldKeys, Key, KeyboardDriver, Keymap, Lineup, PlayerKind, PolicyDriver,
};
pub use eval::{EvalStats, run_eval};
pub use geometry::Segment;
pub use mask::Mask;
pub use race::{RaceConfig, RaceController, RacePhase, SoundCue, StepInfo, TickOutcome};
pub use raycast::{RayCaster, RaycastConfig};
pub use replay::{BatchTensors, ReplayBuffer, Transition};
pub use reward::{RewardBreakdown, RewardConfig};
pub use track::{CarColor, Obstacle, ObstacleField, StartPose, Track, TrackAssets, TrackConfig};
pub use train::{EpisodeOutcome, EpisodeSummary, TrainConfig, Trainer};
