use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::{Features, STATE_DIM};

// =============================================================================
// Experience Replay Buffer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(with = "serde_big_array::BigArray")]
    pub state: Features,
    pub action: usize,
    pub reward: f32,
    #[serde(with = "serde_big_array::BigArray")]
    pub next_state: Features,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayBuffer {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&mut self, t: Transition) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(t);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.buffer.iter()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Up to `batch_size` distinct entries drawn uniformly; everything when
    /// the buffer is smaller.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<&Transition> {
        let len = self.buffer.len();
        if batch_size >= len {
            return self.buffer.iter().collect();
        }
        rand::seq::index::sample(rng, len, batch_size)
            .into_iter()
            .map(|idx| &self.buffer[idx])
            .collect()
    }

    /// Sample a random batch, return tensors ready for training
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        dev: &Device,
        rng: &mut R,
    ) -> Result<BatchTensors> {
        ensure!(
            self.buffer.len() >= batch_size,
            "Replay holds {} transitions, batch needs {batch_size}",
            self.buffer.len()
        );
        BatchTensors::from_transitions(&self.sample(batch_size, rng), dev)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize replay buffer")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut replay: Self =
            serde_json::from_str(json).context("Failed to parse replay buffer")?;
        while replay.buffer.len() > replay.capacity {
            replay.buffer.pop_front();
        }
        Ok(replay)
    }
}

pub struct BatchTensors {
    pub states: Tensor,
    pub actions: Tensor,
    pub rewards: Tensor,
    pub next_states: Tensor,
    pub not_dones: Tensor,
}

impl BatchTensors {
    pub fn from_transitions(batch: &[&Transition], dev: &Device) -> Result<Self> {
        let n = batch.len();
        let mut states = Vec::with_capacity(n * STATE_DIM);
        let mut actions = Vec::with_capacity(n);
        let mut rewards = Vec::with_capacity(n);
        let mut next_states = Vec::with_capacity(n * STATE_DIM);
        let mut not_dones = Vec::with_capacity(n);

        for t in batch {
            states.extend_from_slice(&t.state);
            actions.push(t.action as i64);
            rewards.push(t.reward);
            next_states.extend_from_slice(&t.next_state);
            not_dones.push(if t.done { 0.0f32 } else { 1.0f32 });
        }

        Ok(Self {
            states: Tensor::from_vec(states, (n, STATE_DIM), dev)?,
            actions: Tensor::from_vec(actions, n, dev)?,
            rewards: Tensor::from_vec(rewards, n, dev)?,
            next_states: Tensor::from_vec(next_states, (n, STATE_DIM), dev)?,
            not_dones: Tensor::from_vec(not_dones, n, dev)?,
        })
    }
}
