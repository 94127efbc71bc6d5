//! Leap-net Q baseline: a DQN whose latent state is modulated by the grid
//! structure. The continuous attributes form the `x` input; the structure
//! attributes (line status, topology) form the tau vector applied through
//! an [`LtauLayer`] between the encoder and the Q head.

use std::fs;
use std::path::Path;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
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
use crate::layers::LtauLayer;
use crate::logger::TrainingLogger;
use crate::network::NeuralNetwork;
use crate::optimizer::{Adam, Optimizer, OptimizerWrapper};
use crate::params::{JsonParam, LeapNnParam, NnParam, TrainingParam};
use crate::replay_buffer::{Experience, ReplayBuffer};
use crate::runner::{run_episodes, EpisodeResult, EvalParam};

pub const DEFAULT_NAME: &str = "LeapNet";

/// The serialized half of the agent: encoder, leap block and Q head, with
/// their target copies.
#[derive(Serialize, Deserialize, Clone)]
pub struct LeapQNet {
    pub nn_param: LeapNnParam,
    pub converter: ActionConverter,
    encoder: NeuralNetwork,
    leap: LtauLayer,
    head: NeuralNetwork,
    target_encoder: NeuralNetwork,
    target_leap: LtauLayer,
    target_head: NeuralNetwork,
    leap_optimizer: OptimizerWrapper,
    train_steps: usize,
}

impl LeapQNet {
    pub fn new(converter: ActionConverter, nn_param: LeapNnParam) -> Result<Self> {
        nn_param.check()?;
        let activs = nn_param
            .activs
            .iter()
            .map(|name| Activation::from_name(name))
            .collect::<Result<Vec<_>>>()?;

        let mut encoder_sizes = Vec::with_capacity(nn_param.sizes.len() + 1);
        encoder_sizes.push(nn_param.x_dim);
        encoder_sizes.extend_from_slice(&nn_param.sizes);
        let encoder = NeuralNetwork::new(
            &encoder_sizes,
            &activs,
            OptimizerWrapper::Adam(Adam::default()),
        );

        let latent = nn_param.sizes.last().copied().unwrap_or(nn_param.x_dim);
        let leap = LtauLayer::new(latent, nn_param.tau_dim());
        let head = NeuralNetwork::new(
            &[latent, converter.n_actions()],
            &[Activation::Linear],
            OptimizerWrapper::Adam(Adam::default()),
        );

        let target_encoder = encoder.clone();
        let target_leap = leap.clone();
        let target_head = head.clone();
        Ok(LeapQNet {
            nn_param,
            converter,
            encoder,
            leap,
            head,
            target_encoder,
            target_leap,
            target_head,
            leap_optimizer: OptimizerWrapper::Adam(Adam::default()),
            train_steps: 0,
        })
    }

    pub fn q_batch(&mut self, xs: ArrayView2<f32>, taus: ArrayView2<f32>) -> Array2<f32> {
        let hidden = self.encoder.forward_batch(xs);
        let modulated = self.leap.forward_batch(hidden.view(), taus);
        self.head.forward_batch(modulated.view())
    }

    fn target_q_batch(&mut self, xs: ArrayView2<f32>, taus: ArrayView2<f32>) -> Array2<f32> {
        let hidden = self.target_encoder.forward_batch(xs);
        let modulated = self.target_leap.forward_batch(hidden.view(), taus);
        self.target_head.forward_batch(modulated.view())
    }

    pub fn q_values(&mut self, x: ArrayView1<f32>, tau: ArrayView1<f32>) -> Array1<f32> {
        let q = self.q_batch(x.insert_axis(Axis(0)), tau.insert_axis(Axis(0)));
        q.row(0).to_owned()
    }

    /// Backpropagate a Q-gradient through head, leap block and encoder and
    /// apply the updates. Consumes the caches of the latest `q_batch` call.
    fn apply_q_gradient(&mut self, q_grads: ArrayView2<f32>, learning_rate: f32) {
        let (d_latent, head_grads) = self.head.backward_batch(q_grads);
        let leap_grads = self.leap.backward_batch(d_latent.view());
        let (_, encoder_grads) = self.encoder.backward_batch(leap_grads.d_input.view());

        self.head.apply_gradients(&head_grads, learning_rate);
        self.encoder.apply_gradients(&encoder_grads, learning_rate);
        self.leap_optimizer.update_weights(
            0,
            &mut self.leap.e_weights,
            &leap_grads.d_e,
            learning_rate,
        );
        self.leap_optimizer.update_weights(
            1,
            &mut self.leap.d_weights,
            &leap_grads.d_d,
            learning_rate,
        );
    }

    fn sync_targets(&mut self, tau: f32) {
        self.target_encoder.soft_update_from(&self.encoder, tau);
        self.target_head.soft_update_from(&self.head, tau);
        for (dst, src) in [
            (&mut self.target_leap.e_weights, &self.leap.e_weights),
            (&mut self.target_leap.d_weights, &self.leap.d_weights),
        ] {
            dst.zip_mut_with(src, |d, &s| *d = *d * (1.0 - tau) + s * tau);
        }
    }

    pub fn train_on_batch(
        &mut self,
        batch: &[&Experience],
        params: &TrainingParam,
        learning_rate: f32,
    ) -> Result<f32> {
        if batch.is_empty() {
            return Err(GridRlError::EmptyBuffer("leap_net minibatch".to_string()));
        }
        let x_dim = self.nn_param.x_dim;
        let (states, actions, rewards, next_states, dones) = stack_batch(batch);
        let x = states.slice(s![.., ..x_dim]);
        let tau = states.slice(s![.., x_dim..]);
        let next_x = next_states.slice(s![.., ..x_dim]);
        let next_tau = next_states.slice(s![.., x_dim..]);

        let next_q = self.target_q_batch(next_x, next_tau);
        let q_pred = self.q_batch(x, tau);
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
        self.apply_q_gradient(q_grads.view(), learning_rate);

        self.train_steps += 1;
        self.sync_targets(params.tau);
        if let Some(freq) = params.update_target_hard_freq {
            if freq > 0 && self.train_steps % freq == 0 {
                self.target_encoder = self.encoder.clone();
                self.target_leap = self.leap.clone();
                self.target_head = self.head.clone();
            }
        }

        let predictions = self.q_batch(x, tau);
        Ok(mse(&predictions, &targets))
    }

    /// Tau vector of an observation: the tau attributes flattened in order,
    /// each shifted and scaled by its `(raw + add) * mult` adjustment.
    pub fn encode_tau(&self, obs: &Observation) -> Result<Array1<f32>> {
        let p = &self.nn_param;
        let mut tau = Vec::with_capacity(p.tau_dim());
        for (k, attr) in p.list_attr_obs_tau.iter().enumerate() {
            let add = p.tau_adds[k];
            let mult = p.tau_mults[k];
            for &v in obs.attr(attr)?.iter() {
                tau.push((v + add) * mult);
            }
        }
        Ok(Array1::from_vec(tau))
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

/// Epsilon-greedy agent over the leap network. Transitions are stored with
/// `x` and tau concatenated; the network splits them again at `x_dim`.
pub struct LeapQAgent {
    pub net: LeapQNet,
    pub params: TrainingParam,
    buffer: ReplayBuffer,
    rng: ThreadRng,
}

impl LeapQAgent {
    pub fn new(net: LeapQNet, params: TrainingParam) -> Self {
        let buffer = ReplayBuffer::new(params.buffer_size.max(1));
        LeapQAgent {
            net,
            params,
            buffer,
            rng: rand::thread_rng(),
        }
    }

    fn encode_obs(&self, obs: &Observation) -> Result<Array1<f32>> {
        let x = obs.extract(&self.net.nn_param.list_attr_obs)?;
        let tau = self.net.encode_tau(obs)?;
        let mut data = Vec::with_capacity(x.len() + tau.len());
        data.extend(x.iter().copied());
        data.extend(tau.iter().copied());
        Ok(Array1::from_vec(data))
    }
}

impl BaselineAgent for LeapQAgent {
    fn n_actions(&self) -> usize {
        self.net.converter.n_actions()
    }

    fn select_action(&mut self, _slot: usize, obs: &Observation, epsilon: f32) -> Result<usize> {
        if epsilon > 0.0 && self.rng.gen::<f32>() < epsilon {
            return Ok(self.rng.gen_range(0..self.n_actions()));
        }
        let x = obs.extract(&self.net.nn_param.list_attr_obs)?;
        let tau = self.net.encode_tau(obs)?;
        let q = self.net.q_values(x.view(), tau.view());
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

/// Check the declared architecture against the environment before building
/// the networks.
fn validate_against_env<E: VecEnv>(env: &E, nn_param: &LeapNnParam) -> Result<()> {
    let x_size = NnParam::get_obs_size(env, &nn_param.list_attr_obs)?;
    if x_size != nn_param.x_dim {
        return Err(GridRlError::invalid_parameter(
            "x_dim",
            &format!(
                "declared {} but the listed attributes flatten to {}",
                nn_param.x_dim, x_size
            ),
        ));
    }
    for (k, attr) in nn_param.list_attr_obs_tau.iter().enumerate() {
        let dim = env.descriptor().attr_dim(attr)?;
        if dim != nn_param.tau_dims[k] {
            return Err(GridRlError::invalid_parameter(
                "tau_dims",
                &format!("attribute {} has dimension {}, declared {}", attr, dim, nn_param.tau_dims[k]),
            ));
        }
    }
    Ok(())
}

/// Train a leap-net DQN on `env` and persist it under `save_path/<name>/`.
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
    nn_param: &LeapNnParam,
) -> Result<LeapQAgent> {
    training_param.check()?;

    let net = match load_path {
        Some(dir) => LeapQNet::load(&dir.join(name).join(AGENT_FILE))?,
        None => {
            validate_against_env(env, nn_param)?;
            let converter = ActionConverter::new(env.descriptor(), converter_param);
            LeapQNet::new(converter, nn_param.clone())?
        }
    };
    let mut agent = LeapQAgent::new(net, training_param.clone());

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

/// Load the leap-net DQN stored under `load_path/<name>/` and run greedy
/// evaluation episodes on `env`.
pub fn evaluate<E: GridEnv>(
    env: &mut E,
    name: &str,
    load_path: &Path,
    logs_path: Option<&Path>,
    params: &EvalParam,
) -> Result<(LeapQAgent, Vec<EpisodeResult>)> {
    let net = LeapQNet::load(&load_path.join(name).join(AGENT_FILE))?;
    let mut agent = LeapQAgent::new(
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

    fn small_leap_param() -> LeapNnParam {
        LeapNnParam {
            sizes: vec![16],
            activs: vec!["relu".to_string()],
            list_attr_obs: vec!["prod_p".to_string(), "load_p".to_string(), "rho".to_string()],
            x_dim: 13,
            list_attr_obs_tau: vec!["line_status".to_string()],
            tau_dims: vec![8],
            tau_adds: vec![-1.0],
            tau_mults: vec![1.0],
        }
    }

    fn small_agent(env: &ToyCase5) -> LeapQAgent {
        let converter_param = ConverterParam {
            change_bus_vect: true,
            ..Default::default()
        };
        let converter = ActionConverter::new(env.descriptor(), &converter_param);
        let net = LeapQNet::new(converter, small_leap_param()).unwrap();
        LeapQAgent::new(
            net,
            TrainingParam {
                buffer_size: 64,
                minibatch_size: 8,
                min_observation: 8,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_tau_encoding_applies_adjustment() {
        let mut env = ToyCase5::seeded(11);
        let agent = small_agent(&env);
        let obs = env.reset();
        // All lines in service at reset: (1.0 - 1.0) * 1.0 = 0.0 everywhere.
        let tau = agent.net.encode_tau(&obs).unwrap();
        assert_eq!(tau.len(), 8);
        assert!(tau.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_tau_modulates_q_values() {
        let mut env = ToyCase5::seeded(12);
        let mut agent = small_agent(&env);
        let obs = env.reset();
        let x = obs.extract(&agent.net.nn_param.list_attr_obs).unwrap();

        let tau_zero = Array1::zeros(8);
        let tau_one = Array1::ones(8);
        let q_zero = agent.net.q_values(x.view(), tau_zero.view());
        let q_one = agent.net.q_values(x.view(), tau_one.view());
        let moved = q_zero
            .iter()
            .zip(q_one.iter())
            .any(|(a, b)| (a - b).abs() > 1e-7);
        assert!(moved);
    }

    #[test]
    fn test_train_on_batch_returns_finite_loss() {
        let mut env = ToyCase5::seeded(13);
        let mut agent = small_agent(&env);
        let mut obs = env.reset();
        for _ in 0..16 {
            let encoded = agent.select_action(0, &obs, 1.0).unwrap();
            let outcome = env.step(agent.decode(encoded).unwrap());
            agent
                .remember(0, &obs, encoded, outcome.reward, &outcome.obs, outcome.done)
                .unwrap();
            obs = if outcome.done { env.reset() } else { outcome.obs };
        }
        let loss = agent.learn(0).unwrap();
        assert!(loss.is_finite());
        assert_eq!(agent.net.train_steps, 1);
    }

    #[test]
    fn test_rejects_wrong_x_dim() {
        let mut env = ToyCase5::seeded(14);
        let nn_param = LeapNnParam {
            x_dim: 5,
            ..small_leap_param()
        };
        let err = validate_against_env(&env, &nn_param);
        assert!(err.is_err());
        let _ = env.reset();
    }

    #[test]
    fn test_save_load_keeps_greedy_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.bin");

        let mut env = ToyCase5::seeded(15);
        let mut agent = small_agent(&env);
        agent.net.save(&path).unwrap();
        let mut restored = LeapQAgent::new(LeapQNet::load(&path).unwrap(), TrainingParam::default());

        let obs = env.reset();
        assert_eq!(
            agent.select_action(0, &obs, 0.0).unwrap(),
            restored.select_action(0, &obs, 0.0).unwrap()
        );
    }
}
