use anyhow::{Context, Result, bail, ensure};
use candle_core::backprop::GradStore;
use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::driver::Action;
use crate::raycast::REFERENCE_BEARINGS;
use crate::replay::{BatchTensors, ReplayBuffer, Transition};
use crate::{Features, NUM_RAYS, STATE_DIM};

// =============================================================================
// Agent Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub hidden_sizes: Vec<usize>,
    pub gamma: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub batch_size: usize,
    pub epsilon_start: f64,
    pub epsilon_min: f64,
    /// Multiplicative decay applied after every successful update.
    pub epsilon_decay: f64,
    /// Gradient steps between target syncs.
    pub target_sync: u64,
    /// Blend factor for target syncs; 1.0 copies the online weights.
    pub tau: f64,
    pub replay_capacity: usize,
    pub max_grad_norm: f64,
    /// Ray bearings the observations were built with; stored in checkpoints.
    pub bearings: [f32; NUM_RAYS],
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![256, 128, 64],
            gamma: 0.99,
            learning_rate: 5e-4,
            weight_decay: 0.0,
            batch_size: 64,
            epsilon_start: 1.0,
            epsilon_min: 0.02,
            epsilon_decay: 0.999,
            target_sync: 10,
            tau: 1.0,
            replay_capacity: 25_000,
            max_grad_norm: 1.0,
            bearings: REFERENCE_BEARINGS,
            seed: None,
        }
    }
}

/// Shape of the observation and network a checkpoint was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationLayout {
    pub num_rays: usize,
    pub bearings: Vec<f32>,
    pub state_dim: usize,
    pub num_actions: usize,
    pub hidden_sizes: Vec<usize>,
}

impl ObservationLayout {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            num_rays: NUM_RAYS,
            bearings: config.bearings.to_vec(),
            state_dim: STATE_DIM,
            num_actions: Action::COUNT,
            hidden_sizes: config.hidden_sizes.clone(),
        }
    }
}

/// Metal when available, else CPU.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        Device::Cpu
    } else {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
}

// =============================================================================
// Q-Network (candle)
// =============================================================================

/// Feed-forward Q-network: STATE_DIM features → hidden layers (leaky ReLU)
/// → one Q-value per action.
pub struct DqnNet {
    hidden: Vec<Linear>,
    head: Linear,
}

impl DqnNet {
    pub fn new(vs: VarBuilder, config: &AgentConfig) -> Result<Self> {
        let mut hidden = Vec::with_capacity(config.hidden_sizes.len());
        let mut in_dim = STATE_DIM;
        for (i, &width) in config.hidden_sizes.iter().enumerate() {
            hidden.push(candle_nn::linear(in_dim, width, vs.pp(format!("fc{}", i + 1)))?);
            in_dim = width;
        }
        let head = candle_nn::linear(in_dim, Action::COUNT, vs.pp("head"))?;
        Ok(Self { hidden, head })
    }

    /// Forward pass: state → Q-values for all actions
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.hidden {
            let z = layer.forward(&h)?;
            h = z.maximum(&z.affine(0.01, 0.0)?)?;
        }
        self.head.forward(&h)
    }
}

// =============================================================================
// Optimizer
// =============================================================================

/// AdamW with moments keyed by parameter name, so its state can be stored
/// and restored alongside the weights.
struct AdamW {
    moments: Vec<NamedMoments>,
    step_t: u64,
    params: ParamsAdamW,
}

struct NamedMoments {
    name: String,
    param: Var,
    first: Var,
    second: Var,
}

impl AdamW {
    fn new(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let moments = sorted_vars(varmap)?
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, param)| {
                Ok(NamedMoments {
                    name,
                    first: Var::zeros(param.shape(), param.dtype(), param.device())?,
                    second: Var::zeros(param.shape(), param.dtype(), param.device())?,
                    param,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            moments,
            params,
            step_t: 0,
        })
    }

    /// Global L2 norm over the gradients of the parameters this optimizer owns.
    fn grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut sum_sq = 0.0f64;
        for entry in &self.moments {
            if let Some(g) = grads.get(&entry.param) {
                sum_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(sum_sq.sqrt())
    }

    /// One decoupled-weight-decay Adam step. Gradients are scaled down first
    /// so their global norm is at most `max_norm`; `max_norm <= 0` disables it.
    fn step(&mut self, grads: &GradStore, max_norm: f64) -> Result<()> {
        let norm = self.grad_norm(grads)?;
        let clip = if max_norm > 0.0 && norm > max_norm {
            max_norm / (norm + 1e-6)
        } else {
            1.0
        };

        self.step_t += 1;
        let p = &self.params;
        let t = self.step_t as i32;
        let bias1 = 1.0 - p.beta1.powi(t);
        let bias2 = 1.0 - p.beta2.powi(t);
        let decay = 1.0 - p.lr * p.weight_decay;
        for entry in &self.moments {
            let Some(g) = grads.get(&entry.param) else {
                continue;
            };
            let g = (g * clip)?;
            let m = ((entry.first.as_tensor() * p.beta1)? + (&g * (1.0 - p.beta1))?)?;
            let v = ((entry.second.as_tensor() * p.beta2)? + (g.sqr()? * (1.0 - p.beta2))?)?;
            let direction = ((&m / bias1)? / ((&v / bias2)?.sqrt()? + p.eps)?)?;
            let decayed = (entry.param.as_tensor() * decay)?;
            entry.param.set(&(decayed - (direction * p.lr)?)?)?;
            entry.first.set(&m)?;
            entry.second.set(&v)?;
        }
        Ok(())
    }

    fn state(&self) -> Result<OptimizerState> {
        let mut first_moments = Vec::with_capacity(self.moments.len());
        let mut second_moments = Vec::with_capacity(self.moments.len());
        for entry in &self.moments {
            first_moments.push(NamedTensor::capture(&entry.name, entry.first.as_tensor())?);
            second_moments.push(NamedTensor::capture(&entry.name, entry.second.as_tensor())?);
        }
        Ok(OptimizerState {
            lr: self.params.lr,
            beta1: self.params.beta1,
            beta2: self.params.beta2,
            eps: self.params.eps,
            weight_decay: self.params.weight_decay,
            step_t: self.step_t,
            first_moments,
            second_moments,
        })
    }

    /// Decode the saved moments without applying them.
    fn stage(&self, state: &OptimizerState, device: &Device) -> Result<Vec<(Var, Tensor)>> {
        let mut staged = Vec::with_capacity(2 * self.moments.len());
        for entry in &self.moments {
            for (moment, saved) in [
                (&entry.first, &state.first_moments),
                (&entry.second, &state.second_moments),
            ] {
                let value = find_named(saved, &entry.name)?.to_tensor(device)?;
                ensure!(
                    value.dims() == entry.param.dims(),
                    "Optimizer moment {} has shape {:?}, expected {:?}",
                    entry.name,
                    value.dims(),
                    entry.param.dims()
                );
                staged.push((moment.clone(), value));
            }
        }
        Ok(staged)
    }

    fn apply_hyperparameters(&mut self, state: &OptimizerState) {
        self.step_t = state.step_t;
        self.params = ParamsAdamW {
            lr: state.lr,
            beta1: state.beta1,
            beta2: state.beta2,
            eps: state.eps,
            weight_decay: state.weight_decay,
        };
    }
}

fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("Failed to lock varmap"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

// =============================================================================
// Checkpoint Format
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    fn capture(name: &str, tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            shape: tensor.dims().to_vec(),
            data: tensor.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

fn find_named<'a>(tensors: &'a [NamedTensor], name: &str) -> Result<&'a NamedTensor> {
    tensors
        .iter()
        .find(|t| t.name == name)
        .with_context(|| format!("Checkpoint is missing tensor {name}"))
}

#[derive(Serialize, Deserialize)]
struct OptimizerState {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step_t: u64,
    first_moments: Vec<NamedTensor>,
    second_moments: Vec<NamedTensor>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    layout: ObservationLayout,
    model_state: Vec<NamedTensor>,
    target_state: Vec<NamedTensor>,
    optimizer_state: OptimizerState,
    epsilon: f64,
    train_step: u64,
    replay_buffer: ReplayBuffer,
}

fn snapshot(varmap: &VarMap) -> Result<Vec<NamedTensor>> {
    sorted_vars(varmap)?
        .iter()
        .map(|(name, var)| NamedTensor::capture(name, var.as_tensor()))
        .collect()
}

/// Decode saved parameters for `varmap` without touching it.
fn stage(varmap: &VarMap, state: &[NamedTensor], device: &Device) -> Result<Vec<(Var, Tensor)>> {
    sorted_vars(varmap)?
        .into_iter()
        .map(|(name, var)| {
            let saved = find_named(state, &name)?;
            ensure!(
                saved.shape == var.dims(),
                "Checkpoint tensor {name} has shape {:?}, network expects {:?}",
                saved.shape,
                var.dims()
            );
            Ok((var, saved.to_tensor(device)?))
        })
        .collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

// =============================================================================
// DQN Agent
// =============================================================================

pub struct DqnAgent {
    online_varmap: VarMap,
    target_varmap: VarMap,
    online_net: DqnNet,
    target_net: DqnNet,
    optimizer: AdamW,
    device: Device,
    config: AgentConfig,
    layout: ObservationLayout,
    epsilon: f64,
    train_step: u64,
    replay: ReplayBuffer,
    inference: bool,
    rng: SmallRng,
}

impl DqnAgent {
    pub fn new(device: &Device, config: AgentConfig) -> Result<Self> {
        ensure!(config.batch_size > 0, "Batch size must be positive");
        ensure!(config.target_sync > 0, "Target sync period must be positive");

        let online_varmap = VarMap::new();
        let target_varmap = VarMap::new();

        let online_vb = VarBuilder::from_varmap(&online_varmap, DType::F32, device);
        let target_vb = VarBuilder::from_varmap(&target_varmap, DType::F32, device);

        let online_net = DqnNet::new(online_vb, &config)?;
        let target_net = DqnNet::new(target_vb, &config)?;

        let opt_params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(&online_varmap, opt_params)?;

        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        let mut agent = Self {
            online_varmap,
            target_varmap,
            online_net,
            target_net,
            optimizer,
            device: device.clone(),
            layout: ObservationLayout::new(&config),
            epsilon: config.epsilon_start,
            train_step: 0,
            replay: ReplayBuffer::new(config.replay_capacity),
            inference: false,
            rng,
            config,
        };
        agent.sync_target(1.0)?;
        Ok(agent)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn layout(&self) -> &ObservationLayout {
        &self.layout
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Successful gradient updates so far.
    pub fn train_step(&self) -> u64 {
        self.train_step
    }

    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    pub fn is_inference(&self) -> bool {
        self.inference
    }

    /// Greedy from now on; no exploration.
    pub fn set_inference_mode(&mut self) {
        self.inference = true;
        self.epsilon = 0.0;
    }

    /// Epsilon-greedy while training, greedy otherwise. No observation means idle.
    pub fn get_action(&mut self, state: Option<&Features>, training: bool) -> Result<Action> {
        let Some(state) = state else {
            return Ok(Action::Idle);
        };
        if training && !self.inference && self.rng.random::<f64>() < self.epsilon {
            return Ok(Action::from_index(self.rng.random_range(0..Action::COUNT)));
        }
        let s = Tensor::from_slice(state, (1, STATE_DIM), &self.device)?;
        let q = self.online_net.forward(&s)?;
        let action = q.argmax(D::Minus1)?.squeeze(0)?.to_scalar::<u32>()? as usize;
        Ok(Action::from_index(action))
    }

    pub fn q_values(&self, state: &Features) -> Result<Vec<f32>> {
        let s = Tensor::from_slice(state, (1, STATE_DIM), &self.device)?;
        let q = self.online_net.forward(&s)?;
        Ok(q.squeeze(0)?.to_vec1::<f32>()?)
    }

    pub fn target_q_values(&self, state: &Features) -> Result<Vec<f32>> {
        let s = Tensor::from_slice(state, (1, STATE_DIM), &self.device)?;
        let q = self.target_net.forward(&s)?;
        Ok(q.squeeze(0)?.to_vec1::<f32>()?)
    }

    /// Store transition in replay buffer
    pub fn remember(&mut self, t: Transition) {
        self.replay.push(t);
    }

    /// Double-Q targets: the online net picks the next action, the target net
    /// scores it. `y = r + γ·(1−done)·Q⁻(s′, argmax Q(s′))`.
    pub fn td_targets(&self, batch: &BatchTensors) -> Result<Tensor> {
        let next_q_online = self.online_net.forward(&batch.next_states)?;
        let best_next_actions = next_q_online.argmax(D::Minus1)?.unsqueeze(1)?;

        let next_q_target = self.target_net.forward(&batch.next_states)?;
        let next_q = next_q_target
            .gather(&best_next_actions.to_dtype(DType::I64)?, 1)?
            .squeeze(1)?;

        let discounted = next_q.affine(self.config.gamma, 0.0)?;
        Ok(batch.rewards.add(&discounted.mul(&batch.not_dones)?)?.detach())
    }

    /// One gradient step on a replay batch. `None` while the buffer is
    /// smaller than a batch.
    pub fn update(&mut self) -> Result<Option<f32>> {
        if self.replay.len() < self.config.batch_size {
            return Ok(None);
        }

        let batch = self
            .replay
            .sample_batch(self.config.batch_size, &self.device, &mut self.rng)?;

        // Online net: Q(s, a) for the actions we actually took
        let q_all = self.online_net.forward(&batch.states)?;
        let q_values = q_all.gather(&batch.actions.unsqueeze(1)?, 1)?.squeeze(1)?;
        let target = self.td_targets(&batch)?;

        // Huber: where |d| < 1: 0.5*d^2, else |d| - 0.5
        let diff = q_values.sub(&target)?;
        let abs_diff = diff.abs()?;
        let ones = Tensor::ones_like(&abs_diff)?;
        let loss = abs_diff
            .lt(&ones)?
            .where_cond(
                &(diff.sqr()?.affine(0.5, 0.0)?),
                &(abs_diff.affine(1.0, -0.5)?),
            )?
            .mean_all()?;

        let grads = loss.backward()?;
        self.optimizer.step(&grads, self.config.max_grad_norm)?;

        self.train_step += 1;
        if self.train_step.is_multiple_of(self.config.target_sync) {
            self.sync_target(self.config.tau)?;
        }

        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);

        Ok(Some(loss.to_scalar::<f32>()?))
    }

    /// Blend the online weights into the target net,
    /// `θ⁻ ← τ·θ + (1−τ)·θ⁻`. `tau >= 1` copies them outright.
    pub fn sync_target(&mut self, tau: f64) -> Result<()> {
        let online = sorted_vars(&self.online_varmap)?;
        let target = sorted_vars(&self.target_varmap)?;
        ensure!(
            online.len() == target.len(),
            "Online net has {} tensors, target net has {}",
            online.len(),
            target.len()
        );
        for ((name, src), (target_name, dst)) in online.iter().zip(&target) {
            ensure!(name == target_name, "Target net has {target_name} where online has {name}");
            let next = if tau >= 1.0 {
                src.as_tensor().detach()
            } else {
                ((src.as_tensor() * tau)? + (dst.as_tensor() * (1.0 - tau))?)?.detach()
            };
            dst.set(&next)?;
        }
        Ok(())
    }

    /// Online parameters by name, sorted.
    pub fn online_parameters(&self) -> Result<Vec<NamedTensor>> {
        snapshot(&self.online_varmap)
    }

    pub fn target_parameters(&self) -> Result<Vec<NamedTensor>> {
        snapshot(&self.target_varmap)
    }

    /// Write weights, optimizer state, ε, step count and replay to `path`.
    /// The file is replaced atomically.
    pub fn save_model(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let checkpoint = Checkpoint {
            layout: self.layout.clone(),
            model_state: snapshot(&self.online_varmap)?,
            target_state: snapshot(&self.target_varmap)?,
            optimizer_state: self.optimizer.state()?,
            epsilon: self.epsilon,
            train_step: self.train_step,
            replay_buffer: self.replay.clone(),
        };

        let tmp = tmp_path(path);
        let file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        bincode::serialize_into(&mut writer, &checkpoint)?;
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move checkpoint into {}", path.display()))?;
        tracing::info!(path = %path.display(), step = self.train_step, "model saved");
        Ok(())
    }

    /// Restore everything `save_model` wrote. The whole record is decoded and
    /// checked before any of it is applied, so a failed load leaves the agent
    /// as it was.
    pub fn load_model(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open checkpoint {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let checkpoint: Checkpoint = bincode::deserialize_from(reader)
            .with_context(|| format!("Failed to decode checkpoint {}", path.display()))?;

        if checkpoint.layout != self.layout {
            bail!(
                "Checkpoint {} was trained on {:?}, this agent uses {:?}",
                path.display(),
                checkpoint.layout,
                self.layout
            );
        }

        let mut staged = stage(&self.online_varmap, &checkpoint.model_state, &self.device)?;
        staged.extend(stage(&self.target_varmap, &checkpoint.target_state, &self.device)?);
        staged.extend(self.optimizer.stage(&checkpoint.optimizer_state, &self.device)?);
        for (var, value) in &staged {
            var.set(value)?;
        }
        self.optimizer.apply_hyperparameters(&checkpoint.optimizer_state);
        self.epsilon = if self.inference { 0.0 } else { checkpoint.epsilon };
        self.train_step = checkpoint.train_step;
        self.replay = checkpoint.replay_buffer;
        tracing::info!(
            path = %path.display(),
            step = self.train_step,
            replay = self.replay.len(),
            "model loaded"
        );
        Ok(())
    }
}
