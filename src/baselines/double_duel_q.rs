//! Double dueling DQN over a stack of recent observations.
//!
//! The network input is the concatenation of the last `num_frames`
//! observation vectors. Action selection in `s'` uses the online network,
//! evaluation the target network. Unlike the feed-forward family this
//! baseline is configured by [`DoubleDuelQConfig`] and checkpoints to a
//! single `<name>.bin` file.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use ndarray::{Array1, ArrayView1};
use rand::rngs::ThreadRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::baselines::common::{greedy, mse, stack_batch, train_loop, BaselineAgent};
use crate::baselines::duel_q::DuelTower;
use crate::converter::{ActionConverter, ConverterParam};
use crate::env::{GridAction, GridEnv, Observation, VecEnv};
use crate::error::{GridRlError, Result};
use crate::logger::TrainingLogger;
use crate::params::{JsonParam, NnParam};
use crate::replay_buffer::{Experience, ReplayBuffer};
use crate::runner::{run_episodes, EpisodeResult, EvalParam};

pub const DEFAULT_NAME: &str = "DoubleDuelQ";

/// Hyperparameters of the frame-stacking double dueling DQN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleDuelQConfig {
    pub initial_epsilon: f32,
    pub final_epsilon: f32,
    /// Steps over which epsilon decays linearly from initial to final.
    pub epsilon_decay: usize,
    pub discount_factor: f32,
    pub buffer_size: usize,
    pub batch_size: usize,
    /// Number of stacked past observations fed to the network.
    pub num_frames: usize,
    pub learning_rate: f32,
    pub lr_decay_steps: usize,
    pub lr_decay_rate: f32,
    /// Transitions collected before the first gradient update.
    pub num_pre_training_steps: usize,
    pub update_freq: usize,
    pub tau: f32,
    pub update_target_hard_freq: Option<usize>,
    pub sizes: Vec<usize>,
    pub activs: Vec<String>,
    pub list_attr_obs: Vec<String>,
    pub converter_param: ConverterParam,
}

impl Default for DoubleDuelQConfig {
    fn default() -> Self {
        DoubleDuelQConfig {
            initial_epsilon: 0.99,
            final_epsilon: 0.001,
            epsilon_decay: 65_536,
            discount_factor: 0.98,
            buffer_size: 65_536,
            batch_size: 32,
            num_frames: 4,
            learning_rate: 5e-5,
            lr_decay_steps: 0,
            lr_decay_rate: 1.0,
            num_pre_training_steps: 256,
            update_freq: 64,
            tau: 1e-3,
            update_target_hard_freq: None,
            sizes: vec![512, 512],
            activs: vec!["relu".to_string(), "relu".to_string()],
            list_attr_obs: vec![
                "prod_p".to_string(),
                "load_p".to_string(),
                "rho".to_string(),
                "line_status".to_string(),
                "topo_vect".to_string(),
            ],
            converter_param: ConverterParam {
                set_line_status: true,
                change_bus_vect: true,
                set_topo_vect: false,
            },
        }
    }
}

impl JsonParam for DoubleDuelQConfig {}

impl DoubleDuelQConfig {
    /// Linear exploration decay, clamped at `final_epsilon`.
    pub fn epsilon(&self, step: usize) -> f32 {
        if self.epsilon_decay == 0 || step >= self.epsilon_decay {
            return self.final_epsilon;
        }
        let progress = step as f32 / self.epsilon_decay as f32;
        self.initial_epsilon + (self.final_epsilon - self.initial_epsilon) * progress
    }

    /// Staircase-decayed learning rate.
    pub fn lr_at(&self, step: usize) -> f32 {
        if self.lr_decay_steps == 0 {
            return self.learning_rate;
        }
        self.learning_rate * self.lr_decay_rate.powi((step / self.lr_decay_steps) as i32)
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

    pub fn check(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(GridRlError::invalid_parameter("batch_size", "must be positive"));
        }
        if self.num_frames == 0 {
            return Err(GridRlError::invalid_parameter("num_frames", "must be at least 1"));
        }
        if self.buffer_size < self.batch_size {
            return Err(GridRlError::invalid_parameter(
                "buffer_size",
                "must hold at least one batch",
            ));
        }
        self.parse_activations().map(|_| ())
    }
}

/// The serialized half of the agent: the dueling tower pair and the
/// configuration they were built from.
#[derive(Serialize, Deserialize, Clone)]
pub struct DoubleDuelQNet {
    pub config: DoubleDuelQConfig,
    pub converter: ActionConverter,
    main: DuelTower,
    target: DuelTower,
    train_steps: usize,
}

impl DoubleDuelQNet {
    pub fn new(obs_size: usize, converter: ActionConverter, config: DoubleDuelQConfig) -> Result<Self> {
        config.check()?;
        let activs = config.parse_activations()?;
        let input_size = obs_size * config.num_frames;
        let main = DuelTower::new(input_size, converter.n_actions(), &config.sizes, &activs);
        let target = main.clone();
        Ok(DoubleDuelQNet {
            config,
            converter,
            main,
            target,
            train_steps: 0,
        })
    }

    pub fn q_values(&mut self, stacked: ArrayView1<f32>) -> Array1<f32> {
        self.main.q_single(stacked)
    }

    /// Double-DQN update over stacked frames: the online network picks the
    /// argmax action in `s'`, the target network provides its value.
    pub fn train_on_batch(&mut self, batch: &[&Experience], learning_rate: f32) -> Result<f32> {
        if batch.is_empty() {
            return Err(GridRlError::EmptyBuffer("double_duel_q minibatch".to_string()));
        }
        let (states, actions, rewards, next_states, dones) = stack_batch(batch);

        let next_q_main = self.main.q_batch(next_states.view());
        let next_q_target = self.target.q_batch(next_states.view());
        // Last forward before the backward pass must be on `states`.
        let q_pred = self.main.q_batch(states.view());
        let mut targets = q_pred.clone();
        for i in 0..batch.len() {
            let mut target = rewards[i];
            if !dones[i] {
                let best = greedy(next_q_main.row(i));
                target += self.config.discount_factor * next_q_target[[i, best]];
            }
            targets[[i, actions[i]]] = target;
        }

        let q_grads = &q_pred - &targets;
        self.main.apply_q_gradient(q_grads.view(), learning_rate);

        self.train_steps += 1;
        self.target.soft_update_from(&self.main, self.config.tau);
        if let Some(freq) = self.config.update_target_hard_freq {
            if freq > 0 && self.train_steps % freq == 0 {
                self.target = self.main.clone();
            }
        }

        let predictions = self.main.q_batch(states.view());
        Ok(mse(&predictions, &targets))
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

/// Frame-stacking agent: keeps one observation history per environment
/// instance and feeds the flattened window to the dueling network.
pub struct DoubleDuelQAgent {
    pub net: DoubleDuelQNet,
    buffer: ReplayBuffer,
    rng: ThreadRng,
    histories: Vec<VecDeque<Array1<f32>>>,
}

impl DoubleDuelQAgent {
    pub fn new(net: DoubleDuelQNet) -> Self {
        let buffer = ReplayBuffer::new(net.config.buffer_size.max(1));
        DoubleDuelQAgent {
            net,
            buffer,
            rng: rand::thread_rng(),
            histories: vec![VecDeque::new()],
        }
    }

    fn encode_obs(&self, obs: &Observation) -> Result<Array1<f32>> {
        obs.extract(&self.net.config.list_attr_obs)
    }

    /// Flatten the last `num_frames` stored observations, oldest first. A
    /// history younger than the window repeats its oldest frame in front.
    fn stack_history(&self, slot: usize) -> Array1<f32> {
        let frames = self.net.config.num_frames;
        let history = &self.histories[slot];
        let obs_dim = history.back().map_or(0, |h| h.len());
        let mut data = Vec::with_capacity(frames * obs_dim);
        for k in 0..frames {
            let idx = (history.len() + k).saturating_sub(frames);
            data.extend(history[idx].iter().copied());
        }
        Array1::from_vec(data)
    }

    /// Like `stack_history` with `next` virtually appended, without
    /// mutating the stored history.
    fn stack_with_next(&self, slot: usize, next: &Array1<f32>) -> Array1<f32> {
        let frames = self.net.config.num_frames;
        let history = &self.histories[slot];
        let total = history.len() + 1;
        let mut data = Vec::with_capacity(frames * next.len());
        for k in 0..frames {
            let idx = (total + k).saturating_sub(frames);
            if idx >= history.len() {
                data.extend(next.iter().copied());
            } else {
                data.extend(history[idx].iter().copied());
            }
        }
        Array1::from_vec(data)
    }
}

impl BaselineAgent for DoubleDuelQAgent {
    fn n_actions(&self) -> usize {
        self.net.converter.n_actions()
    }

    fn prepare(&mut self, n_envs: usize) {
        self.histories = vec![VecDeque::new(); n_envs.max(1)];
    }

    fn begin_episode(&mut self, slot: usize) {
        if let Some(history) = self.histories.get_mut(slot) {
            history.clear();
        }
    }

    fn select_action(&mut self, slot: usize, obs: &Observation, epsilon: f32) -> Result<usize> {
        let encoded = self.encode_obs(obs)?;
        let frames = self.net.config.num_frames;
        let history = &mut self.histories[slot];
        history.push_back(encoded);
        if history.len() > frames {
            history.pop_front();
        }

        if epsilon > 0.0 && self.rng.gen::<f32>() < epsilon {
            return Ok(self.rng.gen_range(0..self.net.converter.n_actions()));
        }
        let stacked = self.stack_history(slot);
        let q = self.net.q_values(stacked.view());
        Ok(greedy(q.view()))
    }

    fn decode(&self, encoded: usize) -> Result<GridAction> {
        self.net.converter.to_grid_action(encoded)
    }

    fn remember(
        &mut self,
        slot: usize,
        _obs: &Observation,
        action: usize,
        reward: f32,
        next_obs: &Observation,
        done: bool,
    ) -> Result<()> {
        // `select_action` already pushed the current observation, so the
        // stored history ends with it.
        let state = self.stack_history(slot);
        let next_encoded = self.encode_obs(next_obs)?;
        let next_state = self.stack_with_next(slot, &next_encoded);
        self.buffer.add(Experience {
            state,
            action,
            reward,
            next_state,
            done,
        });
        Ok(())
    }

    fn epsilon_at(&self, step: usize) -> f32 {
        self.net.config.epsilon(step)
    }

    fn learning_rate_at(&self, train_step: usize) -> f32 {
        self.net.config.lr_at(train_step)
    }

    fn update_freq(&self) -> usize {
        self.net.config.update_freq
    }

    fn ready(&self) -> bool {
        let config = &self.net.config;
        self.buffer.len() >= config.num_pre_training_steps.max(config.batch_size)
    }

    fn learn(&mut self, train_step: usize) -> Result<f32> {
        let learning_rate = self.net.config.lr_at(train_step);
        let batch = self.buffer.sample(self.net.config.batch_size);
        self.net.train_on_batch(&batch, learning_rate)
    }
}

/// Train a frame-stacking double dueling DQN on `env` and persist it to
/// `save_path/<name>.bin`.
pub fn train<E: VecEnv>(
    env: &mut E,
    name: &str,
    iterations: usize,
    save_path: Option<&Path>,
    logs_dir: Option<&Path>,
    config: &DoubleDuelQConfig,
    verbose: bool,
) -> Result<DoubleDuelQAgent> {
    config.check()?;
    let obs_size = NnParam::get_obs_size(env, &config.list_attr_obs)?;
    let converter = ActionConverter::new(env.descriptor(), &config.converter_param);
    let net = DoubleDuelQNet::new(obs_size, converter, config.clone())?;
    let mut agent = DoubleDuelQAgent::new(net);

    let mut logger = match logs_dir {
        Some(dir) => Some(TrainingLogger::new(dir, name)?),
        None => None,
    };
    train_loop(env, &mut agent, iterations, verbose, logger.as_mut())?;

    if let Some(base) = save_path {
        fs::create_dir_all(base)?;
        agent.net.save(&base.join(format!("{}.bin", name)))?;
    }
    Ok(agent)
}

/// Load the model file written by [`train`] and run greedy evaluation
/// episodes on `env`. `load_path` is the `.bin` path itself.
pub fn evaluate<E: GridEnv>(
    env: &mut E,
    load_path: &Path,
    logs_path: Option<&Path>,
    params: &EvalParam,
) -> Result<(DoubleDuelQAgent, Vec<EpisodeResult>)> {
    let net = DoubleDuelQNet::load(load_path)?;
    let mut agent = DoubleDuelQAgent::new(net);
    let results = run_episodes(env, &mut agent, params, logs_path)?;
    Ok((agent, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ToyCase5;

    fn small_config() -> DoubleDuelQConfig {
        DoubleDuelQConfig {
            buffer_size: 64,
            batch_size: 4,
            num_frames: 3,
            num_pre_training_steps: 4,
            sizes: vec![16],
            activs: vec!["relu".to_string()],
            list_attr_obs: vec!["rho".to_string()],
            converter_param: ConverterParam {
                change_bus_vect: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn small_agent(env: &ToyCase5) -> DoubleDuelQAgent {
        let config = small_config();
        let converter = ActionConverter::new(env.descriptor(), &config.converter_param);
        let net = DoubleDuelQNet::new(8, converter, config).unwrap();
        DoubleDuelQAgent::new(net)
    }

    #[test]
    fn test_epsilon_linear_endpoints() {
        let config = DoubleDuelQConfig {
            initial_epsilon: 1.0,
            final_epsilon: 0.0,
            epsilon_decay: 100,
            ..Default::default()
        };
        assert_eq!(config.epsilon(0), 1.0);
        assert!((config.epsilon(50) - 0.5).abs() < 1e-6);
        assert_eq!(config.epsilon(100), 0.0);
        assert_eq!(config.epsilon(1000), 0.0);
    }

    #[test]
    fn test_frame_stack_pads_young_episode() {
        let mut env = ToyCase5::seeded(16);
        let mut agent = small_agent(&env);
        let obs = env.reset();
        agent.begin_episode(0);
        agent.select_action(0, &obs, 1.0).unwrap();

        // One frame stored, window of three: the frame appears three times.
        let stacked = agent.stack_history(0);
        assert_eq!(stacked.len(), 24);
        let first = stacked.slice(ndarray::s![..8]).to_owned();
        let last = stacked.slice(ndarray::s![16..]).to_owned();
        assert_eq!(first, last);
    }

    #[test]
    fn test_frame_stack_slides() {
        let mut env = ToyCase5::seeded(17);
        let mut agent = small_agent(&env);
        let mut obs = env.reset();
        agent.begin_episode(0);
        for _ in 0..5 {
            agent.select_action(0, &obs, 1.0).unwrap();
            obs = env.step(GridAction::DoNothing).obs;
        }
        assert_eq!(agent.histories[0].len(), 3);
        assert_eq!(agent.stack_history(0).len(), 24);
    }

    #[test]
    fn test_train_on_batch_returns_finite_loss() {
        let mut env = ToyCase5::seeded(18);
        let mut agent = small_agent(&env);
        agent.prepare(1);
        agent.begin_episode(0);
        let mut obs = env.reset();
        for _ in 0..12 {
            let encoded = agent.select_action(0, &obs, 1.0).unwrap();
            let outcome = env.step(agent.decode(encoded).unwrap());
            agent
                .remember(0, &obs, encoded, outcome.reward, &outcome.obs, outcome.done)
                .unwrap();
            if outcome.done {
                agent.begin_episode(0);
                obs = env.reset();
            } else {
                obs = outcome.obs;
            }
        }
        assert!(agent.ready());
        let loss = agent.learn(0).unwrap();
        assert!(loss.is_finite());
        assert_eq!(agent.net.train_steps, 1);
    }

    #[test]
    fn test_save_load_keeps_greedy_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddq.bin");

        let mut env = ToyCase5::seeded(19);
        let mut agent = small_agent(&env);
        agent.net.save(&path).unwrap();
        let mut restored = DoubleDuelQAgent::new(DoubleDuelQNet::load(&path).unwrap());

        let obs = env.reset();
        agent.begin_episode(0);
        restored.begin_episode(0);
        assert_eq!(
            agent.select_action(0, &obs, 0.0).unwrap(),
            restored.select_action(0, &obs, 0.0).unwrap()
        );
    }
}
