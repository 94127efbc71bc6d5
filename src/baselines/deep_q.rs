//! Plain deep Q-network baseline: feed-forward Q-network, epsilon-greedy
//! exploration, uniform replay and a softly updated target network.

use std::fs;
use std::path::Path;

use ndarray::{Array1, ArrayView1};
use rand::rngs::ThreadRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::baselines::common::{
    checkpoint_dir, greedy, mse, stack_batch, train_loop, BaselineAgent, AGENT_FILE,
    NN_PARAM_FILE, TRAINING_PARAM_FILE,
};
use crate::converter::{ActionConverter, ConverterParam};
use crate::env::{GridAction, GridEnv, Observation, VecEnv};
use crate::error::{GridRlError, Result};
use crate::logger::TrainingLogger;
use crate::network::NeuralNetwork;
use crate::optimizer::{Adam, OptimizerWrapper};
use crate::params::{JsonParam, NnParam, TrainingParam};
use crate::replay_buffer::{Experience, ReplayBuffer};
use crate::runner::{run_episodes, EpisodeResult, EvalParam};

pub const DEFAULT_NAME: &str = "DeepQ";

/// The serialized half of the agent: the Q-networks together with the
/// action catalogue and the architecture they were built from.
#[derive(Serialize, Deserialize, Clone)]
pub struct DeepQNet {
    pub nn_param: NnParam,
    pub converter: ActionConverter,
    q_network: NeuralNetwork,
    target_network: NeuralNetwork,
    train_steps: usize,
}

impl DeepQNet {
    pub fn new(obs_size: usize, converter: ActionConverter, nn_param: NnParam) -> Result<Self> {
        let q_network = nn_param.make_network(
            obs_size,
            converter.n_actions(),
            OptimizerWrapper::Adam(Adam::default()),
        )?;
        let target_network = q_network.clone();
        Ok(DeepQNet {
            nn_param,
            converter,
            q_network,
            target_network,
            train_steps: 0,
        })
    }

    pub fn q_values(&mut self, input: ArrayView1<f32>) -> Array1<f32> {
        self.q_network.forward(input)
    }

    /// Number of gradient updates applied so far, carried across save/load.
    pub fn train_steps(&self) -> usize {
        self.train_steps
    }

    /// One DQN update: copy the current predictions, overwrite the acted
    /// entries with `r + gamma * max_a Q_target(s', a)` (just `r` on
    /// terminal transitions) and regress the Q-network onto the result.
    pub fn train_on_batch(
        &mut self,
        batch: &[&Experience],
        params: &TrainingParam,
        learning_rate: f32,
    ) -> Result<f32> {
        if batch.is_empty() {
            return Err(GridRlError::EmptyBuffer("deep_q minibatch".to_string()));
        }
        let (states, actions, rewards, next_states, dones) = stack_batch(batch);

        let next_q = self.target_network.forward_batch(next_states.view());
        let mut targets = self.q_network.forward_batch(states.view());
        for i in 0..batch.len() {
            let mut target = rewards[i];
            if !dones[i] {
                let best = next_q
                    .row(i)
                    .iter()
                    .fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                target += params.discount_factor * best;
            }
            targets[[i, actions[i]]] = target;
        }

        self.q_network
            .train_batch(states.view(), targets.view(), learning_rate);
        self.after_update(params);

        let predictions = self.q_network.forward_batch(states.view());
        Ok(mse(&predictions, &targets))
    }

    fn after_update(&mut self, params: &TrainingParam) {
        self.train_steps += 1;
        self.target_network
            .soft_update_from(&self.q_network, params.tau);
        if let Some(freq) = params.update_target_hard_freq {
            if freq > 0 && self.train_steps % freq == 0 {
                self.target_network = self.q_network.clone();
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = bincode::serialize(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(bincode::deserialize(&data)?)
    }
}

/// Epsilon-greedy DQN agent: the network bundle plus the replay buffer and
/// hyperparameters used during training.
pub struct DeepQAgent {
    pub net: DeepQNet,
    pub params: TrainingParam,
    buffer: ReplayBuffer,
    rng: ThreadRng,
}

impl DeepQAgent {
    pub fn new(net: DeepQNet, params: TrainingParam) -> Self {
        let buffer = ReplayBuffer::new(params.buffer_size.max(1));
        DeepQAgent {
            net,
            params,
            buffer,
            rng: rand::thread_rng(),
        }
    }

    fn encode_obs(&self, obs: &Observation) -> Result<Array1<f32>> {
        obs.extract(&self.net.nn_param.list_attr_obs)
    }
}

impl BaselineAgent for DeepQAgent {
    fn n_actions(&self) -> usize {
        self.net.converter.n_actions()
    }

    fn select_action(&mut self, _slot: usize, obs: &Observation, epsilon: f32) -> Result<usize> {
        if epsilon > 0.0 && self.rng.gen::<f32>() < epsilon {
            return Ok(self.rng.gen_range(0..self.n_actions()));
        }
        let input = self.encode_obs(obs)?;
        let q = self.net.q_values(input.view());
        Ok(greedy(q.view()))
    }

    fn decode(&self, encoded: usize) -> Result<GridAction> {
        self.net.converter.to_grid_action(encoded)
    }

    fn remember(
        &mut self,
        _slot: usize,
        obs: &Observation,
        action: usize,
        reward: f32,
        next_obs: &Observation,
        done: bool,
    ) -> Result<()> {
        self.buffer.add(Experience {
            state: self.encode_obs(obs)?,
            action,
            reward,
            next_state: self.encode_obs(next_obs)?,
            done,
        });
        Ok(())
    }

    fn epsilon_at(&self, step: usize) -> f32 {
        self.params.epsilon(step)
    }

    fn learning_rate_at(&self, train_step: usize) -> f32 {
        self.params.learning_rate(train_step)
    }

    fn update_freq(&self) -> usize {
        self.params.update_freq
    }

    fn ready(&self) -> bool {
        self.buffer.len() >= self.params.min_observation.max(self.params.minibatch_size)
    }

    fn learn(&mut self, train_step: usize) -> Result<f32> {
        let learning_rate = self.params.learning_rate(train_step);
        let batch = self.buffer.sample(self.params.minibatch_size);
        self.net.train_on_batch(&batch, &self.params, learning_rate)
    }
}

/// Train a DQN on `env` and persist it under `save_path/<name>/`.
///
/// With `load_path` set, training resumes from the checkpoint found at
/// `load_path/<name>/` instead of starting from fresh weights.
#[allow(clippy::too_many_arguments)]
pub fn train<E: VecEnv>(
    env: &mut E,
    name: &str,
    iterations: usize,
    save_path: Option<&Path>,
    load_path: Option<&Path>,
    logs_dir: Option<&Path>,
    training_param: &TrainingParam,
    verbose: bool,
    converter_param: &ConverterParam,
    nn_param: &NnParam,
) -> Result<DeepQAgent> {
    training_param.check()?;

    let net = match load_path {
        Some(dir) => DeepQNet::load(&dir.join(name).join(AGENT_FILE))?,
        None => {
            let obs_size = NnParam::get_obs_size(env, &nn_param.list_attr_obs)?;
            let converter = ActionConverter::new(env.descriptor(), converter_param);
            DeepQNet::new(obs_size, converter, nn_param.clone())?
        }
    };
    let mut agent = DeepQAgent::new(net, training_param.clone());

    let mut logger = match logs_dir {
        Some(dir) => Some(TrainingLogger::new(dir, name)?),
        None => None,
    };
    train_loop(env, &mut agent, iterations, verbose, logger.as_mut())?;

    if let Some(base) = save_path {
        let dir = checkpoint_dir(base, name)?;
        agent.net.save(&dir.join(AGENT_FILE))?;
        training_param.save_json(&dir.join(TRAINING_PARAM_FILE))?;
        agent.net.nn_param.save_json(&dir.join(NN_PARAM_FILE))?;
    }
    Ok(agent)
}

/// Load the DQN stored under `load_path/<name>/` and run greedy evaluation
/// episodes on `env`.
pub fn evaluate<E: GridEnv>(
    env: &mut E,
    name: &str,
    load_path: &Path,
    logs_path: Option<&Path>,
    params: &EvalParam,
) -> Result<(DeepQAgent, Vec<EpisodeResult>)> {
    let net = DeepQNet::load(&load_path.join(name).join(AGENT_FILE))?;
    let mut agent = DeepQAgent::new(
        net,
        TrainingParam {
            buffer_size: 1,
            minibatch_size: 1,
            ..Default::default()
        },
    );
    let results = run_episodes(env, &mut agent, params, logs_path)?;
    Ok((agent, results))
}
