//! Dueling DQN baseline: the Q-value is recomposed from a state-value head
//! and a mean-centered advantage head sharing one trunk,
//! `Q(s, a) = V(s) + A(s, a) - mean_a A(s, a)`.

use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::ThreadRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
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

pub const DEFAULT_NAME: &str = "DuelQ";

/// A dueling Q-network: shared trunk, one-unit value head and an
/// advantage head with one unit per action.
#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct DuelTower {
    trunk: NeuralNetwork,
    value_head: NeuralNetwork,
    advantage_head: NeuralNetwork,
}

impl DuelTower {
    pub(crate) fn new(
        obs_size: usize,
        n_actions: usize,
        hidden: &[usize],
        activs: &[Activation],
    ) -> Self {
        let mut trunk_sizes = Vec::with_capacity(hidden.len() + 1);
        trunk_sizes.push(obs_size);
        trunk_sizes.extend_from_slice(hidden);
        let trunk = NeuralNetwork::new(
            &trunk_sizes,
            activs,
            OptimizerWrapper::Adam(Adam::default()),
        );
        let trunk_out = hidden.last().copied().unwrap_or(obs_size);
        let value_head = NeuralNetwork::new(
            &[trunk_out, 1],
            &[Activation::Linear],
            OptimizerWrapper::Adam(Adam::default()),
        );
        let advantage_head = NeuralNetwork::new(
            &[trunk_out, n_actions],
            &[Activation::Linear],
            OptimizerWrapper::Adam(Adam::default()),
        );
        DuelTower {
            trunk,
            value_head,
            advantage_head,
        }
    }

    /// Row-wise `Q(s, .) = V(s) + A(s, .) - mean_a A(s, a)`.
    pub(crate) fn q_batch(&mut self, states: ArrayView2<f32>) -> Array2<f32> {
        let hidden = self.trunk.forward_batch(states);
        let advantage = self.advantage_head.forward_batch(hidden.view());
        let value = self.value_head.forward_batch(hidden.view());
        let mut q = advantage;
        for (i, mut row) in q.outer_iter_mut().enumerate() {
            let mean = row.mean().unwrap_or(0.0);
            let v = value[[i, 0]];
            row.mapv_inplace(|a| v + a - mean);
        }
        q
    }

    pub(crate) fn q_single(&mut self, input: ArrayView1<f32>) -> Array1<f32> {
        let q = self.q_batch(input.insert_axis(Axis(0)));
        q.row(0).to_owned()
    }

    /// Backpropagate a Q-gradient through both heads and the trunk, then
    /// apply the updates. The mean subtraction centres the advantage part of
    /// the gradient; the value head receives the per-row gradient sum.
    /// Consumes the caches of the latest `q_batch` call.
    pub(crate) fn apply_q_gradient(&mut self, q_grads: ArrayView2<f32>, learning_rate: f32) {
        let mut d_advantage = q_grads.to_owned();
        for mut row in d_advantage.outer_iter_mut() {
            let mean = row.mean().unwrap_or(0.0);
            row.mapv_inplace(|g| g - mean);
        }
        let d_value = q_grads.sum_axis(Axis(1)).insert_axis(Axis(1));

        let (d_hidden_adv, advantage_grads) =
            self.advantage_head.backward_batch(d_advantage.view());
        let (d_hidden_val, value_grads) = self.value_head.backward_batch(d_value.view());
        let d_hidden = d_hidden_adv + d_hidden_val;
        let (_, trunk_grads) = self.trunk.backward_batch(d_hidden.view());

        self.advantage_head
            .apply_gradients(&advantage_grads, learning_rate);
        self.value_head.apply_gradients(&value_grads, learning_rate);
        self.trunk.apply_gradients(&trunk_grads, learning_rate);
    }

    pub(crate) fn soft_update_from(&mut self, other: &DuelTower, tau: f32) {
        self.trunk.soft_update_from(&other.trunk, tau);
        self.value_head.soft_update_from(&other.value_head, tau);
        self.advantage_head
            .soft_update_from(&other.advantage_head, tau);
    }
}

/// The serialized half of the dueling agent.
#[derive(Serialize, Deserialize, Clone)]
pub struct DuelQNet {
    pub nn_param: NnParam,
    pub converter: ActionConverter,
    main: DuelTower,
    target: DuelTower,
    train_steps: usize,
}

impl DuelQNet {
    pub fn new(obs_size: usize, converter: ActionConverter, nn_param: NnParam) -> Result<Self> {
        let activs = nn_param.parse_activations()?;
        let main = DuelTower::new(obs_size, converter.n_actions(), &nn_param.sizes, &activs);
        let target = main.clone();
        Ok(DuelQNet {
            nn_param,
            converter,
            main,
            target,
            train_steps: 0,
        })
    }

    pub fn q_values(&mut self, input: ArrayView1<f32>) -> Array1<f32> {
        self.main.q_single(input)
    }

    pub fn train_on_batch(
        &mut self,
        batch: &[&Experience],
        params: &TrainingParam,
        learning_rate: f32,
    ) -> Result<f32> {
        if batch.is_empty() {
            return Err(GridRlError::EmptyBuffer("duel_q minibatch".to_string()));
        }
        let (states, actions, rewards, next_states, dones) = stack_batch(batch);

        // Target pass first so the main tower's caches stay on `states`.
        let next_q = self.target.q_batch(next_states.view());
        let q_pred = self.main.q_batch(states.view());
        let mut targets = q_pred.clone();
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

        let q_grads = &q_pred - &targets;
        self.main.apply_q_gradient(q_grads.view(), learning_rate);

        self.train_steps += 1;
        self.target.soft_update_from(&self.main, params.tau);
        if let Some(freq) = params.update_target_hard_freq {
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

/// Epsilon-greedy agent over the dueling network.
pub struct DuelQAgent {
    pub net: DuelQNet,
    pub params: TrainingParam,
    buffer: ReplayBuffer,
    rng: ThreadRng,
}

impl DuelQAgent {
    pub fn new(net: DuelQNet, params: TrainingParam) -> Self {
        let buffer = ReplayBuffer::new(params.buffer_size.max(1));
        DuelQAgent {
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

impl BaselineAgent for DuelQAgent {
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

/// Train a dueling DQN on `env` and persist it under `save_path/<name>/`.
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
) -> Result<DuelQAgent> {
    training_param.check()?;

    let net = match load_path {
        Some(dir) => DuelQNet::load(&dir.join(name).join(AGENT_FILE))?,
        None => {
            let obs_size = NnParam::get_obs_size(env, &nn_param.list_attr_obs)?;
            let converter = ActionConverter::new(env.descriptor(), converter_param);
            DuelQNet::new(obs_size, converter, nn_param.clone())?
        }
    };
    let mut agent = DuelQAgent::new(net, training_param.clone());

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

/// Load the dueling DQN stored under `load_path/<name>/` and run greedy
/// evaluation episodes on `env`.
pub fn evaluate<E: GridEnv>(
    env: &mut E,
    name: &str,
    load_path: &Path,
    logs_path: Option<&Path>,
    params: &EvalParam,
) -> Result<(DuelQAgent, Vec<EpisodeResult>)> {
    let net = DuelQNet::load(&load_path.join(name).join(AGENT_FILE))?;
    let mut agent = DuelQAgent::new(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ToyCase5;
    use ndarray::Array2;

    fn small_tower() -> DuelTower {
        DuelTower::new(6, 4, &[8], &[Activation::Relu])
    }

    #[test]
    fn test_q_invariant_to_advantage_shift() {
        let mut tower = small_tower();
        let states = Array2::from_shape_fn((3, 6), |(i, j)| (i + j) as f32 * 0.1);
        let before = tower.q_batch(states.view());

        // Shifting every advantage output by a constant must not change Q.
        for layer in &mut tower.advantage_head.layers {
            layer.biases += 1.7;
        }
        let after = tower.q_batch(states.view());
        let delta = (&before - &after).mapv(f32::abs);
        assert!(delta.iter().all(|&d| d < 1e-4));
    }

    #[test]
    fn test_zero_gradient_leaves_weights() {
        let mut tower = small_tower();
        let states = Array2::from_shape_fn((2, 6), |(i, j)| (i * 6 + j) as f32 * 0.05);
        let before = tower.q_batch(states.view());
        let zeros = Array2::zeros((2, 4));
        tower.apply_q_gradient(zeros.view(), 0.1);
        let after = tower.q_batch(states.view());
        let delta = (&before - &after).mapv(f32::abs);
        assert!(delta.iter().all(|&d| d < 1e-6));
    }

    #[test]
    fn test_train_on_batch_moves_toward_targets() {
        let mut env = ToyCase5::seeded(5);
        let nn_param = NnParam {
            sizes: vec![16],
            activs: vec!["relu".to_string()],
            list_attr_obs: vec!["rho".to_string()],
        };
        let converter_param = ConverterParam {
            change_bus_vect: true,
            ..Default::default()
        };
        let converter = ActionConverter::new(env.descriptor(), &converter_param);
        let net = DuelQNet::new(8, converter, nn_param).unwrap();
        let mut agent = DuelQAgent::new(
            net,
            TrainingParam {
                buffer_size: 64,
                minibatch_size: 8,
                min_observation: 8,
                lr: 1e-2,
                ..Default::default()
            },
        );

        let mut obs = env.reset();
        for _ in 0..16 {
            let encoded = agent.select_action(0, &obs, 1.0).unwrap();
            let outcome = env.step(agent.decode(encoded).unwrap());
            agent
                .remember(0, &obs, encoded, outcome.reward, &outcome.obs, outcome.done)
                .unwrap();
            obs = if outcome.done { env.reset() } else { outcome.obs };
        }
        let first = agent.learn(0).unwrap();
        assert!(first.is_finite());
        assert_eq!(agent.net.train_steps, 1);
    }

    #[test]
    fn test_save_load_keeps_greedy_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.bin");

        let mut env = ToyCase5::seeded(6);
        let nn_param = NnParam {
            sizes: vec![12],
            activs: vec!["tanh".to_string()],
            list_attr_obs: vec!["rho".to_string(), "line_status".to_string()],
        };
        let converter_param = ConverterParam {
            change_bus_vect: true,
            ..Default::default()
        };
        let converter = ActionConverter::new(env.descriptor(), &converter_param);
        let net = DuelQNet::new(16, converter, nn_param).unwrap();
        let mut agent = DuelQAgent::new(net, TrainingParam::default());
        agent.net.save(&path).unwrap();
        let mut restored = DuelQAgent::new(DuelQNet::load(&path).unwrap(), TrainingParam::default());

        let obs = env.reset();
        assert_eq!(
            agent.select_action(0, &obs, 0.0).unwrap(),
            restored.select_action(0, &obs, 0.0).unwrap()
        );
    }
}
