//! Recurrent double DQN: per-step dense embedding, an LSTM trunk read out
//! at the final step, and a linear Q head. Training samples contiguous
//! traces from episode storage; acting replays the episode history through
//! the recurrent trunk so the hidden state reflects everything seen so far.

use std::fs;
use std::path::Path;

use ndarray::{s, Array1, Array2, Array3, ArrayView3};
use rand::rngs::ThreadRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::baselines::common::{greedy, mse, train_loop, BaselineAgent};
use crate::converter::{ActionConverter, ConverterParam};
use crate::env::{GridAction, GridEnv, Observation, VecEnv};
use crate::error::{GridRlError, Result};
use crate::layers::LstmCell;
use crate::logger::TrainingLogger;
use crate::network::NeuralNetwork;
use crate::optimizer::{Adam, OptimizerWrapper};
use crate::params::{JsonParam, NnParam};
use crate::replay_buffer::{EpisodeBuffer, Experience};
use crate::runner::{run_episodes, EpisodeResult, EvalParam};

pub const DEFAULT_NAME: &str = "RecurrentQ";

/// Hyperparameters of the recurrent double DQN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentQConfig {
    pub initial_epsilon: f32,
    pub final_epsilon: f32,
    /// Steps over which epsilon decays linearly from initial to final.
    pub epsilon_decay: usize,
    pub discount_factor: f32,
    /// Replay capacity in steps, across whole stored episodes.
    pub buffer_size: usize,
    pub batch_size: usize,
    /// Length of the sampled training traces.
    pub trace_len: usize,
    pub learning_rate: f32,
    pub lr_decay_steps: usize,
    pub lr_decay_rate: f32,
    pub num_pre_training_steps: usize,
    pub update_freq: usize,
    pub tau: f32,
    pub update_target_hard_freq: Option<usize>,
    pub embed_size: usize,
    pub lstm_size: usize,
    pub list_attr_obs: Vec<String>,
    pub converter_param: ConverterParam,
}

impl Default for RecurrentQConfig {
    fn default() -> Self {
        RecurrentQConfig {
            initial_epsilon: 0.99,
            final_epsilon: 0.001,
            epsilon_decay: 65_536,
            discount_factor: 0.99,
            buffer_size: 65_536,
            batch_size: 32,
            trace_len: 8,
            learning_rate: 5e-5,
            lr_decay_steps: 0,
            lr_decay_rate: 1.0,
            num_pre_training_steps: 256,
            update_freq: 64,
            tau: 1e-3,
            update_target_hard_freq: None,
            embed_size: 128,
            lstm_size: 128,
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

impl JsonParam for RecurrentQConfig {}

impl RecurrentQConfig {
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

    pub fn check(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(GridRlError::invalid_parameter("batch_size", "must be positive"));
        }
        if self.trace_len == 0 {
            return Err(GridRlError::invalid_parameter("trace_len", "must be at least 1"));
        }
        if self.embed_size == 0 || self.lstm_size == 0 {
            return Err(GridRlError::invalid_parameter(
                "embed_size",
                "embedding and recurrent sizes must be positive",
            ));
        }
        if self.buffer_size < self.trace_len {
            return Err(GridRlError::invalid_parameter(
                "buffer_size",
                "must hold at least one trace",
            ));
        }
        Ok(())
    }
}

/// Run a batch of traces through one embed/LSTM/head triplet.
fn run_q(
    embed: &mut NeuralNetwork,
    lstm: &mut LstmCell,
    head: &mut NeuralNetwork,
    traces: ArrayView3<f32>,
) -> Array2<f32> {
    let (b, t, d) = traces.dim();
    let flat = traces
        .to_owned()
        .into_shape((b * t, d))
        .expect("trace batch is contiguous");
    let embedded = embed.forward_batch(flat.view());
    let e = embedded.ncols();
    let sequence = embedded
        .into_shape((b, t, e))
        .expect("embedded batch is contiguous");
    let hidden = lstm.forward_sequence(sequence.view());
    head.forward_batch(hidden.view())
}

/// The serialized half of the agent: both recurrent towers and the
/// configuration they were built from.
#[derive(Serialize, Deserialize, Clone)]
pub struct RecurrentQNet {
    pub config: RecurrentQConfig,
    pub converter: ActionConverter,
    embed: NeuralNetwork,
    lstm: LstmCell,
    head: NeuralNetwork,
    target_embed: NeuralNetwork,
    target_lstm: LstmCell,
    target_head: NeuralNetwork,
    lstm_optimizer: OptimizerWrapper,
    train_steps: usize,
}

impl RecurrentQNet {
    pub fn new(obs_size: usize, converter: ActionConverter, config: RecurrentQConfig) -> Result<Self> {
        config.check()?;
        let embed = NeuralNetwork::new(
            &[obs_size, config.embed_size],
            &[Activation::Relu],
            OptimizerWrapper::Adam(Adam::default()),
        );
        let lstm = LstmCell::new(config.embed_size, config.lstm_size);
        let head = NeuralNetwork::new(
            &[config.lstm_size, converter.n_actions()],
            &[Activation::Linear],
            OptimizerWrapper::Adam(Adam::default()),
        );
        let target_embed = embed.clone();
        let target_lstm = lstm.clone();
        let target_head = head.clone();
        Ok(RecurrentQNet {
            config,
            converter,
            embed,
            lstm,
            head,
            target_embed,
            target_lstm,
            target_head,
            lstm_optimizer: OptimizerWrapper::Adam(Adam::default()),
            train_steps: 0,
        })
    }

    /// Q-values after replaying `history` (oldest first) through the
    /// recurrent trunk.
    pub fn q_values_sequence(&mut self, history: &[Array1<f32>]) -> Array1<f32> {
        let t = history.len().max(1);
        let d = history.first().map_or(0, |h| h.len());
        let mut sequence = Array3::zeros((1, t, d));
        for (j, frame) in history.iter().enumerate() {
            sequence.slice_mut(s![0, j, ..]).assign(frame);
        }
        let q = run_q(
            &mut self.embed,
            &mut self.lstm,
            &mut self.head,
            sequence.view(),
        );
        q.row(0).to_owned()
    }

    /// Double-DQN update over a batch of equally long traces. The action,
    /// reward and terminal flag are taken from the last step of each trace;
    /// the next-state sequence is the trace advanced by one step.
    pub fn train_on_batch(&mut self, traces: &[&[Experience]], learning_rate: f32) -> Result<f32> {
        if traces.is_empty() {
            return Err(GridRlError::EmptyBuffer("recurrent_q trace batch".to_string()));
        }
        let b = traces.len();
        let t = traces[0].len();
        let d = traces[0][0].state.len();

        let mut states = Array3::zeros((b, t, d));
        let mut next_states = Array3::zeros((b, t, d));
        let mut actions = Vec::with_capacity(b);
        let mut rewards = Vec::with_capacity(b);
        let mut dones = Vec::with_capacity(b);
        for (i, trace) in traces.iter().enumerate() {
            for (j, experience) in trace.iter().enumerate() {
                states.slice_mut(s![i, j, ..]).assign(&experience.state);
                next_states
                    .slice_mut(s![i, j, ..])
                    .assign(&experience.next_state);
            }
            let last = &trace[trace.len() - 1];
            actions.push(last.action);
            rewards.push(last.reward);
            dones.push(last.done);
        }

        let next_q_main = run_q(
            &mut self.embed,
            &mut self.lstm,
            &mut self.head,
            next_states.view(),
        );
        let next_q_target = run_q(
            &mut self.target_embed,
            &mut self.target_lstm,
            &mut self.target_head,
            next_states.view(),
        );
        // Last forward before the backward pass must be on `states`.
        let q_pred = run_q(&mut self.embed, &mut self.lstm, &mut self.head, states.view());
        let mut targets = q_pred.clone();
        for i in 0..b {
            let mut y = rewards[i];
            if !dones[i] {
                let best = greedy(next_q_main.row(i));
                y += self.config.discount_factor * next_q_target[[i, best]];
            }
            targets[[i, actions[i]]] = y;
        }

        let q_grads = &q_pred - &targets;
        let (d_hidden, head_grads) = self.head.backward_batch(q_grads.view());
        let lstm_grads = self.lstm.backward_sequence(d_hidden.view());
        let (gb, gt, ge) = lstm_grads.dx.dim();
        let dx_flat = lstm_grads
            .dx
            .clone()
            .into_shape((gb * gt, ge))
            .expect("timestep gradients are contiguous");
        let (_, embed_grads) = self.embed.backward_batch(dx_flat.view());

        self.head.apply_gradients(&head_grads, learning_rate);
        self.embed.apply_gradients(&embed_grads, learning_rate);
        self.lstm
            .apply_gradients(&lstm_grads, &mut self.lstm_optimizer, 0, learning_rate);

        self.train_steps += 1;
        self.target_embed.soft_update_from(&self.embed, self.config.tau);
        self.target_lstm.soft_update_from(&self.lstm, self.config.tau);
        self.target_head.soft_update_from(&self.head, self.config.tau);
        if let Some(freq) = self.config.update_target_hard_freq {
            if freq > 0 && self.train_steps % freq == 0 {
                self.target_embed = self.embed.clone();
                self.target_lstm = self.lstm.clone();
                self.target_head = self.head.clone();
            }
        }

        let predictions = run_q(&mut self.embed, &mut self.lstm, &mut self.head, states.view());
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

/// Recurrent agent: per-instance episode histories for acting and
/// per-instance episode buffers for trace sampling.
pub struct RecurrentQAgent {
    pub net: RecurrentQNet,
    buffers: Vec<EpisodeBuffer>,
    histories: Vec<Vec<Array1<f32>>>,
    rng: ThreadRng,
}

impl RecurrentQAgent {
    pub fn new(net: RecurrentQNet) -> Self {
        let capacity = net.config.buffer_size.max(1);
        RecurrentQAgent {
            net,
            buffers: vec![EpisodeBuffer::new(capacity)],
            histories: vec![Vec::new()],
            rng: rand::thread_rng(),
        }
    }

    fn encode_obs(&self, obs: &Observation) -> Result<Array1<f32>> {
        obs.extract(&self.net.config.list_attr_obs)
    }

    fn stored_steps(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Draw traces across all instance buffers, with replacement.
    fn sample_traces(
        buffers: &[EpisodeBuffer],
        batch_size: usize,
        trace_len: usize,
    ) -> Vec<&[Experience]> {
        let eligible: Vec<&EpisodeBuffer> = buffers
            .iter()
            .filter(|b| b.has_trace(trace_len))
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let buffer = eligible[rng.gen_range(0..eligible.len())];
            out.extend(buffer.sample_traces(1, trace_len));
        }
        out
    }
}

impl BaselineAgent for RecurrentQAgent {
    fn n_actions(&self) -> usize {
        self.net.converter.n_actions()
    }

    fn prepare(&mut self, n_envs: usize) {
        let n = n_envs.max(1);
        let capacity = self.net.config.buffer_size.max(1);
        self.buffers = vec![EpisodeBuffer::new(capacity); n];
        self.histories = vec![Vec::new(); n];
    }

    fn begin_episode(&mut self, slot: usize) {
        if let Some(history) = self.histories.get_mut(slot) {
            history.clear();
        }
        if let Some(buffer) = self.buffers.get_mut(slot) {
            buffer.end_episode();
        }
    }

    fn select_action(&mut self, slot: usize, obs: &Observation, epsilon: f32) -> Result<usize> {
        let encoded = self.encode_obs(obs)?;
        self.histories[slot].push(encoded);

        if epsilon > 0.0 && self.rng.gen::<f32>() < epsilon {
            return Ok(self.rng.gen_range(0..self.net.converter.n_actions()));
        }
        let history = std::mem::take(&mut self.histories[slot]);
        let q = self.net.q_values_sequence(&history);
        self.histories[slot] = history;
        Ok(greedy(q.view()))
    }

    fn decode(&self, encoded: usize) -> Result<GridAction> {
        self.net.converter.to_grid_action(encoded)
    }

    fn remember(
        &mut self,
        slot: usize,
        obs: &Observation,
        action: usize,
        reward: f32,
        next_obs: &Observation,
        done: bool,
    ) -> Result<()> {
        let experience = Experience {
            state: self.encode_obs(obs)?,
            action,
            reward,
            next_state: self.encode_obs(next_obs)?,
            done,
        };
        self.buffers[slot].push(experience);
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
        self.stored_steps() >= config.num_pre_training_steps.max(config.batch_size)
            && self
                .buffers
                .iter()
                .any(|b| b.has_trace(config.trace_len))
    }

    fn learn(&mut self, train_step: usize) -> Result<f32> {
        let learning_rate = self.net.config.lr_at(train_step);
        let traces =
            Self::sample_traces(&self.buffers, self.net.config.batch_size, self.net.config.trace_len);
        self.net.train_on_batch(&traces, learning_rate)
    }
}

/// Train a recurrent double DQN on `env` and persist it to
/// `save_path/<name>.bin`.
pub fn train<E: VecEnv>(
    env: &mut E,
    name: &str,
    iterations: usize,
    save_path: Option<&Path>,
    logs_dir: Option<&Path>,
    config: &RecurrentQConfig,
    verbose: bool,
) -> Result<RecurrentQAgent> {
    config.check()?;
    let obs_size = NnParam::get_obs_size(env, &config.list_attr_obs)?;
    let converter = ActionConverter::new(env.descriptor(), &config.converter_param);
    let net = RecurrentQNet::new(obs_size, converter, config.clone())?;
    let mut agent = RecurrentQAgent::new(net);

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
) -> Result<(RecurrentQAgent, Vec<EpisodeResult>)> {
    let net = RecurrentQNet::load(load_path)?;
    let mut agent = RecurrentQAgent::new(net);
    let results = run_episodes(env, &mut agent, params, logs_path)?;
    Ok((agent, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ToyCase5;

    fn small_config() -> RecurrentQConfig {
        RecurrentQConfig {
            buffer_size: 256,
            batch_size: 4,
            trace_len: 3,
            num_pre_training_steps: 8,
            embed_size: 12,
            lstm_size: 10,
            list_attr_obs: vec!["rho".to_string()],
            converter_param: ConverterParam {
                change_bus_vect: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn small_agent(env: &ToyCase5) -> RecurrentQAgent {
        let config = small_config();
        let converter = ActionConverter::new(env.descriptor(), &config.converter_param);
        let net = RecurrentQNet::new(8, converter, config).unwrap();
        RecurrentQAgent::new(net)
    }

    #[test]
    fn test_history_grows_and_clears() {
        let mut env = ToyCase5::seeded(20);
        let mut agent = small_agent(&env);
        agent.prepare(1);
        agent.begin_episode(0);
        let mut obs = env.reset();
        for _ in 0..4 {
            agent.select_action(0, &obs, 1.0).unwrap();
            obs = env.step(GridAction::DoNothing).obs;
        }
        assert_eq!(agent.histories[0].len(), 4);
        agent.begin_episode(0);
        assert!(agent.histories[0].is_empty());
    }

    #[test]
    fn test_longer_history_changes_q() {
        let mut env = ToyCase5::seeded(21);
        let mut agent = small_agent(&env);
        let obs = env.reset();
        let frame = agent.encode_obs(&obs).unwrap();
        let later = env.step(GridAction::SetLineStatus { line: 0, connected: false }).obs;
        let frame2 = agent.encode_obs(&later).unwrap();

        let q_short = agent.net.q_values_sequence(&[frame.clone()]);
        let q_long = agent.net.q_values_sequence(&[frame2, frame]);
        let moved = q_short
            .iter()
            .zip(q_long.iter())
            .any(|(a, b)| (a - b).abs() > 1e-7);
        assert!(moved);
    }

    #[test]
    fn test_train_on_traces_returns_finite_loss() {
        let mut env = ToyCase5::seeded(22);
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
        let path = dir.path().join("rdqn.bin");

        let mut env = ToyCase5::seeded(23);
        let mut agent = small_agent(&env);
        agent.net.save(&path).unwrap();
        let mut restored = RecurrentQAgent::new(RecurrentQNet::load(&path).unwrap());

        let obs = env.reset();
        agent.begin_episode(0);
        restored.begin_episode(0);
        assert_eq!(
            agent.select_action(0, &obs, 0.0).unwrap(),
            restored.select_action(0, &obs, 0.0).unwrap()
        );
    }
}
