//! Sliced recurrent double DQN. The observation vector is split back into
//! its per-attribute slices and each slice gets its own embedding and LSTM
//! column; the final hidden states are concatenated and fed to a shared
//! linear Q head. Columns learn attribute-local dynamics (line loadings,
//! topology, injections) instead of one entangled recurrence.

use std::fs;
use std::path::Path;

use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView3, Axis};
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
use crate::params::JsonParam;
use crate::replay_buffer::{EpisodeBuffer, Experience};
use crate::runner::{run_episodes, EpisodeResult, EvalParam};

pub const DEFAULT_NAME: &str = "SliceRdqn";

/// Hyperparameters of the sliced recurrent double DQN. `list_attr_obs`
/// doubles as the column layout: one recurrent column per attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRdqnConfig {
    pub initial_epsilon: f32,
    pub final_epsilon: f32,
    pub epsilon_decay: usize,
    pub discount_factor: f32,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub trace_len: usize,
    pub learning_rate: f32,
    pub lr_decay_steps: usize,
    pub lr_decay_rate: f32,
    pub num_pre_training_steps: usize,
    pub update_freq: usize,
    pub tau: f32,
    pub update_target_hard_freq: Option<usize>,
    /// Per-column embedding width.
    pub embed_size: usize,
    /// Per-column recurrent width.
    pub lstm_size: usize,
    pub list_attr_obs: Vec<String>,
    pub converter_param: ConverterParam,
}

impl Default for SliceRdqnConfig {
    fn default() -> Self {
        SliceRdqnConfig {
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
            embed_size: 64,
            lstm_size: 64,
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

impl JsonParam for SliceRdqnConfig {}

impl SliceRdqnConfig {
    pub fn epsilon(&self, step: usize) -> f32 {
        if self.epsilon_decay == 0 || step >= self.epsilon_decay {
            return self.final_epsilon;
        }
        let progress = step as f32 / self.epsilon_decay as f32;
        self.initial_epsilon + (self.final_epsilon - self.initial_epsilon) * progress
    }

    pub fn lr_at(&self, step: usize) -> f32 {
        if self.lr_decay_steps == 0 {
            return self.learning_rate;
        }
        self.learning_rate * self.lr_decay_rate.powi((step / self.lr_decay_steps) as i32)
    }

    pub fn check(&self) -> Result<()> {
        if self.list_attr_obs.is_empty() {
            return Err(GridRlError::invalid_parameter(
                "list_attr_obs",
                "need at least one attribute slice",
            ));
        }
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

/// One per-attribute recurrent column.
#[derive(Serialize, Deserialize, Clone)]
struct SliceColumn {
    attr: String,
    dim: usize,
    embed: NeuralNetwork,
    lstm: LstmCell,
}

impl SliceColumn {
    fn new(attr: &str, dim: usize, embed_size: usize, lstm_size: usize) -> Self {
        SliceColumn {
            attr: attr.to_string(),
            dim,
            embed: NeuralNetwork::new(
                &[dim, embed_size],
                &[Activation::Relu],
                OptimizerWrapper::Adam(Adam::default()),
            ),
            lstm: LstmCell::new(embed_size, lstm_size),
        }
    }
}

/// Slice a batch of traces into columns, run each column, concatenate the
/// final hidden states and apply the shared Q head.
fn run_q(
    columns: &mut [SliceColumn],
    head: &mut NeuralNetwork,
    traces: ArrayView3<f32>,
) -> Array2<f32> {
    let (b, t, _) = traces.dim();
    let mut parts = Vec::with_capacity(columns.len());
    let mut offset = 0;
    for column in columns.iter_mut() {
        let flat = traces
            .slice(s![.., .., offset..offset + column.dim])
            .to_owned()
            .into_shape((b * t, column.dim))
            .expect("column slice is contiguous");
        offset += column.dim;
        let embedded = column.embed.forward_batch(flat.view());
        let e = embedded.ncols();
        let sequence = embedded
            .into_shape((b, t, e))
            .expect("embedded column is contiguous");
        parts.push(column.lstm.forward_sequence(sequence.view()));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    let features = concatenate(Axis(1), &views).expect("columns share the batch dimension");
    head.forward_batch(features.view())
}

/// The serialized half of the agent: per-attribute columns, the shared Q
/// head, and their target copies.
#[derive(Serialize, Deserialize, Clone)]
pub struct SliceRdqnNet {
    pub config: SliceRdqnConfig,
    pub converter: ActionConverter,
    columns: Vec<SliceColumn>,
    head: NeuralNetwork,
    target_columns: Vec<SliceColumn>,
    target_head: NeuralNetwork,
    lstm_optimizer: OptimizerWrapper,
    train_steps: usize,
}

impl SliceRdqnNet {
    /// `attr_dims` pairs each attribute of `config.list_attr_obs` with its
    /// flattened width, in the same order the observation encoder emits them.
    pub fn new(
        attr_dims: &[(String, usize)],
        converter: ActionConverter,
        config: SliceRdqnConfig,
    ) -> Result<Self> {
        config.check()?;
        if attr_dims.len() != config.list_attr_obs.len() {
            return Err(GridRlError::invalid_parameter(
                "attr_dims",
                "need one width per observation attribute",
            ));
        }
        let columns: Vec<SliceColumn> = attr_dims
            .iter()
            .map(|(attr, dim)| SliceColumn::new(attr, *dim, config.embed_size, config.lstm_size))
            .collect();
        let head = NeuralNetwork::new(
            &[columns.len() * config.lstm_size, converter.n_actions()],
            &[Activation::Linear],
            OptimizerWrapper::Adam(Adam::default()),
        );
        let target_columns = columns.clone();
        let target_head = head.clone();
        Ok(SliceRdqnNet {
            config,
            converter,
            columns,
            head,
            target_columns,
            target_head,
            lstm_optimizer: OptimizerWrapper::Adam(Adam::default()),
            train_steps: 0,
        })
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Q-values after replaying `history` (oldest first) through every column.
    pub fn q_values_sequence(&mut self, history: &[Array1<f32>]) -> Array1<f32> {
        let t = history.len().max(1);
        let d = history.first().map_or(0, |h| h.len());
        let mut sequence = Array3::zeros((1, t, d));
        for (j, frame) in history.iter().enumerate() {
            sequence.slice_mut(s![0, j, ..]).assign(frame);
        }
        let q = run_q(&mut self.columns, &mut self.head, sequence.view());
        q.row(0).to_owned()
    }

    /// Double-DQN update over a batch of equally long traces, with the
    /// gradient routed back through every column.
    pub fn train_on_batch(&mut self, traces: &[&[Experience]], learning_rate: f32) -> Result<f32> {
        if traces.is_empty() {
            return Err(GridRlError::EmptyBuffer("slice_rdqn trace batch".to_string()));
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

        let next_q_main = run_q(&mut self.columns, &mut self.head, next_states.view());
        let next_q_target = run_q(
            &mut self.target_columns,
            &mut self.target_head,
            next_states.view(),
        );
        // Last forward before the backward pass must be on `states`.
        let q_pred = run_q(&mut self.columns, &mut self.head, states.view());
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
        let (d_features, head_grads) = self.head.backward_batch(q_grads.view());
        let h = self.config.lstm_size;
        let mut column_grads = Vec::with_capacity(self.columns.len());
        for (k, column) in self.columns.iter_mut().enumerate() {
            let d_hidden = d_features.slice(s![.., k * h..(k + 1) * h]).to_owned();
            let lstm_grads = column.lstm.backward_sequence(d_hidden.view());
            let (gb, gt, ge) = lstm_grads.dx.dim();
            let dx_flat = lstm_grads
                .dx
                .clone()
                .into_shape((gb * gt, ge))
                .expect("timestep gradients are contiguous");
            let (_, embed_grads) = column.embed.backward_batch(dx_flat.view());
            column_grads.push((lstm_grads, embed_grads));
        }

        self.head.apply_gradients(&head_grads, learning_rate);
        for (k, (column, (lstm_grads, embed_grads))) in self
            .columns
            .iter_mut()
            .zip(column_grads)
            .enumerate()
        {
            column.embed.apply_gradients(&embed_grads, learning_rate);
            // weight slots k*8.. keep per-column optimizer state disjoint
            column
                .lstm
                .apply_gradients(&lstm_grads, &mut self.lstm_optimizer, k * 8, learning_rate);
        }

        self.train_steps += 1;
        for (target, main) in self.target_columns.iter_mut().zip(self.columns.iter()) {
            target.embed.soft_update_from(&main.embed, self.config.tau);
            target.lstm.soft_update_from(&main.lstm, self.config.tau);
        }
        self.target_head.soft_update_from(&self.head, self.config.tau);
        if let Some(freq) = self.config.update_target_hard_freq {
            if freq > 0 && self.train_steps % freq == 0 {
                self.target_columns = self.columns.clone();
                self.target_head = self.head.clone();
            }
        }

        let predictions = run_q(&mut self.columns, &mut self.head, states.view());
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

/// Sliced recurrent agent. Mirrors the plain recurrent agent: per-instance
/// episode histories for acting, per-instance episode buffers for traces.
pub struct SliceRdqnAgent {
    pub net: SliceRdqnNet,
    buffers: Vec<EpisodeBuffer>,
    histories: Vec<Vec<Array1<f32>>>,
    rng: ThreadRng,
}

impl SliceRdqnAgent {
    pub fn new(net: SliceRdqnNet) -> Self {
        let capacity = net.config.buffer_size.max(1);
        SliceRdqnAgent {
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

impl BaselineAgent for SliceRdqnAgent {
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

/// Build the column layout for `env` and train a sliced recurrent double
/// DQN, persisting it to `save_path/<name>.bin`.
pub fn train<E: VecEnv>(
    env: &mut E,
    name: &str,
    iterations: usize,
    save_path: Option<&Path>,
    logs_dir: Option<&Path>,
    config: &SliceRdqnConfig,
    verbose: bool,
) -> Result<SliceRdqnAgent> {
    config.check()?;
    let descriptor = env.descriptor();
    let mut attr_dims = Vec::with_capacity(config.list_attr_obs.len());
    for attr in &config.list_attr_obs {
        attr_dims.push((attr.clone(), descriptor.attr_dim(attr)?));
    }
    let converter = ActionConverter::new(descriptor, &config.converter_param);
    let net = SliceRdqnNet::new(&attr_dims, converter, config.clone())?;
    let mut agent = SliceRdqnAgent::new(net);

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
/// episodes. `load_path` is the `.bin` path itself.
pub fn evaluate<E: GridEnv>(
    env: &mut E,
    load_path: &Path,
    logs_path: Option<&Path>,
    params: &EvalParam,
) -> Result<(SliceRdqnAgent, Vec<EpisodeResult>)> {
    let net = SliceRdqnNet::load(load_path)?;
    let mut agent = SliceRdqnAgent::new(net);
    let results = run_episodes(env, &mut agent, params, logs_path)?;
    Ok((agent, results))
}
