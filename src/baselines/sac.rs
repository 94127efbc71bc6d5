//! Discrete soft actor-critic baseline: twin Q-networks, a state-value
//! network with a softly updated target, and a softmax policy trained
//! toward the Boltzmann distribution of the minimum Q-value.

use std::fs;
use std::path::Path;

use ndarray::{Array1, ArrayView1, Axis, Zip};
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
use crate::params::{JsonParam, SacNnParam, TrainingParam};
use crate::replay_buffer::{Experience, ReplayBuffer};
use crate::runner::{run_episodes, EpisodeResult, EvalParam};

pub const DEFAULT_NAME: &str = "Sac";

/// Entropy temperature weighting the log-probability penalty in the value
/// target and the Boltzmann policy target.
pub const DEFAULT_ALPHA: f32 = 0.2;

/// The serialized half of the agent: both Q-networks, the value pair and
/// the softmax policy.
#[derive(Serialize, Deserialize, Clone)]
pub struct SacNet {
    pub nn_param: SacNnParam,
    pub converter: ActionConverter,
    pub alpha: f32,
    q1: NeuralNetwork,
    q2: NeuralNetwork,
    value: NeuralNetwork,
    target_value: NeuralNetwork,
    policy: NeuralNetwork,
    train_steps: usize,
}

impl SacNet {
    pub fn new(obs_size: usize, converter: ActionConverter, nn_param: SacNnParam) -> Result<Self> {
        let n_actions = converter.n_actions();
        let optimizer = || OptimizerWrapper::Adam(Adam::default());

        let q1 = nn_param.q_param().make_network(obs_size, n_actions, optimizer())?;
        let q2 = nn_param.q_param().make_network(obs_size, n_actions, optimizer())?;
        let value = nn_param.value_param().make_network(obs_size, 1, optimizer())?;
        let target_value = value.clone();

        // The policy ends in a softmax head rather than a linear one.
        let policy_param = nn_param.policy_param();
        let mut activs = policy_param.parse_activations()?;
        activs.push(Activation::Softmax);
        let mut sizes = Vec::with_capacity(policy_param.sizes.len() + 2);
        sizes.push(obs_size);
        sizes.extend_from_slice(&policy_param.sizes);
        sizes.push(n_actions);
        let policy = NeuralNetwork::new(&sizes, &activs, optimizer());

        Ok(SacNet {
            nn_param,
            converter,
            alpha: DEFAULT_ALPHA,
            q1,
            q2,
            value,
            target_value,
            policy,
            train_steps: 0,
        })
    }

    pub fn action_probabilities(&mut self, input: ArrayView1<f32>) -> Array1<f32> {
        self.policy.forward(input)
    }

    /// One actor-critic update.
    ///
    /// The twin Q-networks regress toward `r + gamma * V_target(s')`, the
    /// value network toward `E_pi[min(Q1, Q2) - alpha * log pi]`, and the
    /// policy toward `softmax(min(Q1, Q2) / alpha)`. The reported loss is
    /// the Q1 regression error after the update.
    pub fn train_on_batch(
        &mut self,
        batch: &[&Experience],
        params: &TrainingParam,
        learning_rate: f32,
    ) -> Result<f32> {
        if batch.is_empty() {
            return Err(GridRlError::EmptyBuffer("sac minibatch".to_string()));
        }
        let alpha = self.alpha.max(1e-6);
        let (states, actions, rewards, next_states, dones) = stack_batch(batch);

        let v_next = self.target_value.forward_batch(next_states.view());
        let mut q1_targets = self.q1.forward_batch(states.view());
        let mut q2_targets = self.q2.forward_batch(states.view());
        for i in 0..batch.len() {
            let mut y = rewards[i];
            if !dones[i] {
                y += params.discount_factor * v_next[[i, 0]];
            }
            q1_targets[[i, actions[i]]] = y;
            q2_targets[[i, actions[i]]] = y;
        }
        self.q1.train_batch(states.view(), q1_targets.view(), learning_rate);
        self.q2.train_batch(states.view(), q2_targets.view(), learning_rate);

        let probs = self.policy.forward_batch(states.view());
        let q1_now = self.q1.forward_batch(states.view());
        let q2_now = self.q2.forward_batch(states.view());
        let q_min = Zip::from(&q1_now).and(&q2_now).map_collect(|&a, &b| a.min(b));

        let log_probs = probs.mapv(|p| p.max(1e-8).ln());
        let inner = &q_min - &log_probs.mapv(|l| l * alpha);
        let v_targets = (&probs * &inner).sum_axis(Axis(1)).insert_axis(Axis(1));
        self.value.train_batch(states.view(), v_targets.view(), learning_rate);

        let mut policy_targets = q_min.mapv(|q| q / alpha);
        for mut row in policy_targets.outer_iter_mut() {
            let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
        self.policy.train_batch(states.view(), policy_targets.view(), learning_rate);

        self.train_steps += 1;
        self.target_value.soft_update_from(&self.value, params.tau);
        if let Some(freq) = params.update_target_hard_freq {
            if freq > 0 && self.train_steps % freq == 0 {
                self.target_value = self.value.clone();
            }
        }

        let q1_after = self.q1.forward_batch(states.view());
        Ok(mse(&q1_after, &q1_targets))
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

/// Stochastic agent over the SAC networks.
///
/// During training it samples from the policy distribution (on top of a
/// uniform mixture with probability `epsilon`); with exploration disabled it
/// plays the mode of the policy.
pub struct SacAgent {
    pub net: SacNet,
    pub params: TrainingParam,
    buffer: ReplayBuffer,
    rng: ThreadRng,
}

impl SacAgent {
    pub fn new(net: SacNet, params: TrainingParam) -> Self {
        let buffer = ReplayBuffer::new(params.buffer_size.max(1));
        SacAgent {
            net,
            params,
            buffer,
            rng: rand::thread_rng(),
        }
    }

    fn encode_obs(&self, obs: &Observation) -> Result<Array1<f32>> {
        obs.extract(&self.net.nn_param.list_attr_obs)
    }

    fn sample_from(&mut self, probs: &Array1<f32>) -> usize {
        let draw = self.rng.gen::<f32>();
        let mut acc = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            acc += p;
            if draw < acc {
                return i;
            }
        }
        probs.len().saturating_sub(1)
    }
}

impl BaselineAgent for SacAgent {
    fn n_actions(&self) -> usize {
        self.net.converter.n_actions()
    }

    fn select_action(&mut self, _slot: usize, obs: &Observation, epsilon: f32) -> Result<usize> {
        let input = self.encode_obs(obs)?;
        if epsilon > 0.0 {
            if self.rng.gen::<f32>() < epsilon {
                return Ok(self.rng.gen_range(0..self.n_actions()));
            }
            let probs = self.net.action_probabilities(input.view());
            return Ok(self.sample_from(&probs));
        }
        let probs = self.net.action_probabilities(input.view());
        Ok(greedy(probs.view()))
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

/// Train a discrete SAC agent on `env` and persist it under
/// `save_path/<name>/`.
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
    nn_param: &SacNnParam,
) -> Result<SacAgent> {
    training_param.check()?;

    let net = match load_path {
        Some(dir) => SacNet::load(&dir.join(name).join(AGENT_FILE))?,
        None => {
            let obs_size = crate::params::NnParam::get_obs_size(env, &nn_param.list_attr_obs)?;
            let converter = ActionConverter::new(env.descriptor(), converter_param);
            SacNet::new(obs_size, converter, nn_param.clone())?
        }
    };
    let mut agent = SacAgent::new(net, training_param.clone());

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

/// Load the SAC agent stored under `load_path/<name>/` and run greedy
/// evaluation episodes on `env`.
pub fn evaluate<E: GridEnv>(
    env: &mut E,
    name: &str,
    load_path: &Path,
    logs_path: Option<&Path>,
    params: &EvalParam,
) -> Result<(SacAgent, Vec<EpisodeResult>)> {
    let net = SacNet::load(&load_path.join(name).join(AGENT_FILE))?;
    let mut agent = SacAgent::new(
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

    fn small_sac_param() -> SacNnParam {
        SacNnParam {
            sizes: vec![16],
            activs: vec!["relu".to_string()],
            list_attr_obs: vec!["rho".to_string(), "line_status".to_string()],
            sizes_value: vec![12],
            activs_value: vec!["relu".to_string()],
            sizes_policy: vec![12],
            activs_policy: vec!["relu".to_string()],
        }
    }

    fn small_agent(env: &ToyCase5) -> SacAgent {
        let converter_param = ConverterParam {
            change_bus_vect: true,
            ..Default::default()
        };
        let converter = ActionConverter::new(env.descriptor(), &converter_param);
        let net = SacNet::new(16, converter, small_sac_param()).unwrap();
        SacAgent::new(
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
    fn test_policy_is_a_distribution() {
        let mut env = ToyCase5::seeded(7);
        let mut agent = small_agent(&env);
        let obs = env.reset();
        let input = agent.encode_obs(&obs).unwrap();
        let probs = agent.net.action_probabilities(input.view());
        let sum: f32 = probs.sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_act_modes() {
        let mut env = ToyCase5::seeded(8);
        let mut agent = small_agent(&env);
        let obs = env.reset();
        for epsilon in [0.0, 0.5, 1.0] {
            let encoded = agent.select_action(0, &obs, epsilon).unwrap();
            assert!(encoded < agent.n_actions());
        }
    }

    #[test]
    fn test_train_on_batch_updates_all_networks() {
        let mut env = ToyCase5::seeded(9);
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

        // The policy head must still output a distribution afterwards.
        let input = agent.encode_obs(&obs).unwrap();
        let probs = agent.net.action_probabilities(input.view());
        assert!((probs.sum() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_save_load_keeps_greedy_actions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.bin");

        let mut env = ToyCase5::seeded(10);
        let mut agent = small_agent(&env);
        agent.net.save(&path).unwrap();
        let mut restored = SacAgent::new(SacNet::load(&path).unwrap(), TrainingParam::default());

        let obs = env.reset();
        assert_eq!(
            agent.select_action(0, &obs, 0.0).unwrap(),
            restored.select_action(0, &obs, 0.0).unwrap()
        );
    }
}
