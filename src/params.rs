use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

use crate::activations::Activation;
use crate::env::VecEnv;
use crate::error::{GridRlError, Result};
use crate::network::NeuralNetwork;
use crate::optimizer::OptimizerWrapper;

/// Parameters saved to and restored from pretty-printed JSON next to the
/// model checkpoint, so a training run can be resumed or inspected.
pub trait JsonParam: Serialize + DeserializeOwned {
    fn save_json(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    fn load_json(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Hyperparameters of the replay-based training loop shared by the
/// TrainingParam family of baselines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParam {
    /// Replay buffer capacity, in transitions.
    pub buffer_size: usize,
    pub minibatch_size: usize,
    /// Train every this many collected transitions.
    pub update_freq: usize,
    /// Do not train before this many transitions are stored.
    pub min_observation: usize,

    pub initial_epsilon: f32,
    pub final_epsilon: f32,
    /// Step at which the exponential epsilon decay reaches `final_epsilon`.
    pub step_for_final_epsilon: usize,

    pub discount_factor: f32,
    pub lr: f32,
    pub lr_decay_steps: usize,
    pub lr_decay_rate: f32,

    /// Polyak factor for the soft target update applied after each training step.
    pub tau: f32,
    /// When set, the target network is additionally hard-copied every this many steps.
    pub update_target_hard_freq: Option<usize>,
}

impl Default for TrainingParam {
    fn default() -> Self {
        TrainingParam {
            buffer_size: 40_000,
            minibatch_size: 64,
            update_freq: 64,
            min_observation: 5_000,
            initial_epsilon: 0.4,
            final_epsilon: 1.0 / (7.0 * 288.0),
            step_for_final_epsilon: 100_000,
            discount_factor: 0.99,
            lr: 1e-4,
            lr_decay_steps: 30_000,
            lr_decay_rate: 0.999,
            tau: 0.01,
            update_target_hard_freq: None,
        }
    }
}

impl JsonParam for TrainingParam {}

impl TrainingParam {
    /// Exploration rate at a given interaction step.
    ///
    /// Decays exponentially from `initial_epsilon` and reaches
    /// `final_epsilon` exactly at `step_for_final_epsilon`, staying there
    /// afterwards.
    pub fn epsilon(&self, step: usize) -> f32 {
        if self.initial_epsilon <= self.final_epsilon || self.step_for_final_epsilon == 0 {
            return self.final_epsilon;
        }
        let progress = step as f32 / self.step_for_final_epsilon as f32;
        let decay = (self.initial_epsilon / self.final_epsilon).ln();
        (self.initial_epsilon * (-progress * decay).exp()).max(self.final_epsilon)
    }

    /// Staircase-decayed learning rate at a given training step.
    pub fn learning_rate(&self, step: usize) -> f32 {
        if self.lr_decay_steps == 0 {
            return self.lr;
        }
        self.lr * self.lr_decay_rate.powi((step / self.lr_decay_steps) as i32)
    }

    pub fn check(&self) -> Result<()> {
        if self.minibatch_size == 0 {
            return Err(GridRlError::invalid_parameter("minibatch_size", "must be positive"));
        }
        if self.buffer_size < self.minibatch_size {
            return Err(GridRlError::invalid_parameter(
                "buffer_size",
                "must hold at least one minibatch",
            ));
        }
        if !(0.0..=1.0).contains(&self.discount_factor) {
            return Err(GridRlError::invalid_parameter("discount_factor", "must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Architecture description for the plain Q-network baselines: hidden layer
/// sizes, one activation name per hidden layer, and the observation
/// attributes fed to the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NnParam {
    pub sizes: Vec<usize>,
    pub activs: Vec<String>,
    pub list_attr_obs: Vec<String>,
}

impl JsonParam for NnParam {}

impl NnParam {
    /// Width of the network input: the sum of the dimensions of the listed
    /// observation attributes, as declared by the environment.
    ///
    /// Depends only on the grid descriptor, so every copy of the same
    /// environment reports the same size.
    pub fn get_obs_size<E: VecEnv>(env: &E, attrs: &[String]) -> Result<usize> {
        let descriptor = env.descriptor();
        let mut total = 0;
        for attr in attrs {
            total += descriptor.attr_dim(attr)?;
        }
        Ok(total)
    }

    /// Build the Q-network: listed hidden layers plus a linear action-value head.
    pub fn make_network(
        &self,
        obs_size: usize,
        n_actions: usize,
        optimizer: OptimizerWrapper,
    ) -> Result<NeuralNetwork> {
        let activations = self.parse_activations()?;
        let mut layer_sizes = Vec::with_capacity(self.sizes.len() + 2);
        layer_sizes.push(obs_size);
        layer_sizes.extend_from_slice(&self.sizes);
        layer_sizes.push(n_actions);

        let mut activs = activations;
        activs.push(Activation::Linear);
        Ok(NeuralNetwork::new(&layer_sizes, &activs, optimizer))
    }

    pub fn parse_activations(&self) -> Result<Vec<Activation>> {
        if self.sizes.len() != self.activs.len() {
            return Err(GridRlError::invalid_parameter(
                "activs",
                "need exactly one activation per hidden layer",
            ));
        }
        self.activs.iter().map(|name| Activation::from_name(name)).collect()
    }
}

/// Architecture for the soft actor-critic baseline: the shared Q tower plus
/// separate value and policy towers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SacNnParam {
    pub sizes: Vec<usize>,
    pub activs: Vec<String>,
    pub list_attr_obs: Vec<String>,
    pub sizes_value: Vec<usize>,
    pub activs_value: Vec<String>,
    pub sizes_policy: Vec<usize>,
    pub activs_policy: Vec<String>,
}

impl JsonParam for SacNnParam {}

impl SacNnParam {
    pub fn q_param(&self) -> NnParam {
        NnParam {
            sizes: self.sizes.clone(),
            activs: self.activs.clone(),
            list_attr_obs: self.list_attr_obs.clone(),
        }
    }

    pub fn value_param(&self) -> NnParam {
        NnParam {
            sizes: self.sizes_value.clone(),
            activs: self.activs_value.clone(),
            list_attr_obs: self.list_attr_obs.clone(),
        }
    }

    pub fn policy_param(&self) -> NnParam {
        NnParam {
            sizes: self.sizes_policy.clone(),
            activs: self.activs_policy.clone(),
            list_attr_obs: self.list_attr_obs.clone(),
        }
    }
}

/// Architecture for the leap-net baseline: the continuous attributes form the
/// `x` input, the structure attributes form the tau vector that modulates the
/// latent through the leap block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeapNnParam {
    pub sizes: Vec<usize>,
    pub activs: Vec<String>,
    /// Attributes composing the continuous input x.
    pub list_attr_obs: Vec<String>,
    pub x_dim: usize,
    /// Attributes composing tau, with one dimension entry per attribute.
    pub list_attr_obs_tau: Vec<String>,
    pub tau_dims: Vec<usize>,
    /// Per-attribute affine adjustment applied to raw tau values: (raw + add) * mult.
    pub tau_adds: Vec<f32>,
    pub tau_mults: Vec<f32>,
}

impl JsonParam for LeapNnParam {}

impl LeapNnParam {
    pub fn tau_dim(&self) -> usize {
        self.tau_dims.iter().sum()
    }

    pub fn check(&self) -> Result<()> {
        if self.tau_dims.len() != self.list_attr_obs_tau.len()
            || self.tau_adds.len() != self.list_attr_obs_tau.len()
            || self.tau_mults.len() != self.list_attr_obs_tau.len()
        {
            return Err(GridRlError::invalid_parameter(
                "tau_dims",
                "tau_dims, tau_adds and tau_mults must each match list_attr_obs_tau",
            ));
        }
        if self.sizes.len() != self.activs.len() {
            return Err(GridRlError::invalid_parameter(
                "activs",
                "need exactly one activation per hidden layer",
            ));
        }
        Ok(())
    }
}
