//! Shared plumbing for the baseline trainers: the agent trait, the
//! collection/training loop over a vectorized environment, minibatch
//! stacking and the checkpoint layout helpers.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView1};

use crate::env::{GridAction, Observation, VecEnv};
use crate::error::Result;
use crate::logger::TrainingLogger;
use crate::replay_buffer::Experience;
use crate::runner::Policy;

/// File names inside a `save_path/<name>/` checkpoint directory.
pub const AGENT_FILE: &str = "agent.bin";
pub const TRAINING_PARAM_FILE: &str = "training_param.json";
pub const NN_PARAM_FILE: &str = "nn_param.json";

/// One trainable baseline, driven by [`train_loop`].
///
/// `slot` identifies the environment instance inside a vectorized rollout,
/// so stateful agents (frame stacks, recurrent histories) can keep one
/// history per instance. Stateless agents ignore it.
pub trait BaselineAgent {
    /// Size of the discrete action catalogue.
    fn n_actions(&self) -> usize;

    /// Called once before collection starts, with the rollout width.
    fn prepare(&mut self, _n_envs: usize) {}

    /// Called whenever `slot` starts a fresh episode.
    fn begin_episode(&mut self, _slot: usize) {}

    /// Pick an encoded action for `slot`, exploring with probability
    /// `epsilon`. With `epsilon` zero the choice is the agent's greedy one.
    fn select_action(&mut self, slot: usize, obs: &Observation, epsilon: f32) -> Result<usize>;

    /// Decode a catalogue index into a concrete grid action.
    fn decode(&self, encoded: usize) -> Result<GridAction>;

    /// Record one transition observed in `slot`. When `done` is set,
    /// `next_obs` is the first observation of the following episode.
    fn remember(
        &mut self,
        slot: usize,
        obs: &Observation,
        action: usize,
        reward: f32,
        next_obs: &Observation,
        done: bool,
    ) -> Result<()>;

    /// Exploration rate at a given interaction step.
    fn epsilon_at(&self, step: usize) -> f32;

    /// Learning rate at a given training step, for logging.
    fn learning_rate_at(&self, train_step: usize) -> f32;

    /// Train every this many collected transitions.
    fn update_freq(&self) -> usize;

    /// Whether enough experience is stored to start training.
    fn ready(&self) -> bool;

    /// Run one gradient update and return the minibatch loss.
    fn learn(&mut self, train_step: usize) -> Result<f32>;
}

/// Every baseline agent evaluates greedily with exploration off, so the
/// evaluation runner can drive any of them directly.
impl<A: BaselineAgent> Policy for A {
    fn reset(&mut self) {
        self.begin_episode(0);
    }

    fn act(&mut self, obs: &Observation) -> Result<GridAction> {
        let encoded = self.select_action(0, obs, 0.0)?;
        self.decode(encoded)
    }
}

/// Collection and training loop over a vectorized environment.
///
/// Interaction steps are counted across all instances: with `n` instances
/// each iteration advances the step counter by `n`. A gradient update runs
/// every [`BaselineAgent::update_freq`] collected transitions once the agent
/// reports [`BaselineAgent::ready`]. Scalars go to `logger` when given.
pub fn train_loop<E, A>(
    env: &mut E,
    agent: &mut A,
    iterations: usize,
    verbose: bool,
    mut logger: Option<&mut TrainingLogger>,
) -> Result<()>
where
    E: VecEnv,
    A: BaselineAgent,
{
    let n_envs = env.n_envs();
    agent.prepare(n_envs);

    let mut observations = env.reset_all();
    for slot in 0..n_envs {
        agent.begin_episode(slot);
    }

    let update_freq = agent.update_freq().max(1);
    let mut episode_rewards = vec![0.0f32; n_envs];
    let mut total_steps = 0usize;
    let mut train_steps = 0usize;
    let mut since_update = 0usize;

    let mut encoded = Vec::with_capacity(n_envs);
    let mut actions = Vec::with_capacity(n_envs);
    for _ in 0..iterations {
        let epsilon = agent.epsilon_at(total_steps);

        encoded.clear();
        actions.clear();
        for (slot, obs) in observations.iter().enumerate() {
            let choice = agent.select_action(slot, obs, epsilon)?;
            actions.push(agent.decode(choice)?);
            encoded.push(choice);
        }

        let outcomes = env.step_all(&actions);
        for (slot, outcome) in outcomes.into_iter().enumerate() {
            agent.remember(
                slot,
                &observations[slot],
                encoded[slot],
                outcome.reward,
                &outcome.obs,
                outcome.done,
            )?;
            episode_rewards[slot] += outcome.reward;
            if outcome.done {
                if let Some(log) = logger.as_deref_mut() {
                    log.set_step(total_steps as i64);
                    log.add_scalar("episode_reward", episode_rewards[slot])?;
                }
                episode_rewards[slot] = 0.0;
                agent.begin_episode(slot);
            }
            observations[slot] = outcome.obs;
        }
        total_steps += n_envs;
        since_update += n_envs;

        if since_update >= update_freq && agent.ready() {
            since_update = 0;
            let loss = agent.learn(train_steps)?;
            let learning_rate = agent.learning_rate_at(train_steps);
            train_steps += 1;
            if let Some(log) = logger.as_deref_mut() {
                log.set_step(total_steps as i64);
                log.add_scalar("loss", loss)?;
                log.add_scalar("epsilon", epsilon)?;
                log.add_scalar("learning_rate", learning_rate)?;
            }
            if verbose && train_steps % 100 == 0 {
                println!(
                    "step {:>7}: loss {:.5}, epsilon {:.4}, lr {:.2e}",
                    total_steps, loss, epsilon, learning_rate
                );
            }
        }
    }

    if let Some(log) = logger.as_deref_mut() {
        log.flush()?;
    }
    Ok(())
}

/// Index of the highest Q-value, first index winning ties.
pub fn greedy(q_values: ArrayView1<f32>) -> usize {
    q_values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Stack sampled transitions into the matrices a Q-network update consumes.
pub fn stack_batch(
    batch: &[&Experience],
) -> (Array2<f32>, Vec<usize>, Vec<f32>, Array2<f32>, Vec<bool>) {
    let state_dim = batch.first().map_or(0, |e| e.state.len());
    let mut states = Array2::zeros((batch.len(), state_dim));
    let mut next_states = Array2::zeros((batch.len(), state_dim));
    let mut actions = Vec::with_capacity(batch.len());
    let mut rewards = Vec::with_capacity(batch.len());
    let mut dones = Vec::with_capacity(batch.len());
    for (i, experience) in batch.iter().enumerate() {
        states.row_mut(i).assign(&experience.state);
        next_states.row_mut(i).assign(&experience.next_state);
        actions.push(experience.action);
        rewards.push(experience.reward);
        dones.push(experience.done);
    }
    (states, actions, rewards, next_states, dones)
}

/// Mean squared error between two matrices of the same shape.
pub fn mse(predictions: &Array2<f32>, targets: &Array2<f32>) -> f32 {
    let diff = predictions - targets;
    diff.mapv(|x| x * x).mean().unwrap_or(0.0)
}

/// Create (if needed) and return the checkpoint directory `save_path/<name>/`.
pub fn checkpoint_dir(save_path: &Path, name: &str) -> Result<PathBuf> {
    let dir = save_path.join(name);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{ActionConverter, ConverterParam};
    use crate::env::{GridEnv, ToyCase5};
    use ndarray::array;

    struct CountingAgent {
        converter: ActionConverter,
        next: usize,
        remembered: usize,
        learned: usize,
        episodes_begun: usize,
    }

    impl CountingAgent {
        fn new(env: &ToyCase5) -> Self {
            let param = ConverterParam {
                change_bus_vect: true,
                ..Default::default()
            };
            CountingAgent {
                converter: ActionConverter::new(env.descriptor(), &param),
                next: 0,
                remembered: 0,
                learned: 0,
                episodes_begun: 0,
            }
        }
    }

    impl BaselineAgent for CountingAgent {
        fn n_actions(&self) -> usize {
            self.converter.n_actions()
        }

        fn begin_episode(&mut self, _slot: usize) {
            self.episodes_begun += 1;
        }

        fn select_action(&mut self, _slot: usize, _obs: &Observation, _epsilon: f32) -> Result<usize> {
            let choice = self.next % self.n_actions();
            self.next += 1;
            Ok(choice)
        }

        fn decode(&self, encoded: usize) -> Result<GridAction> {
            self.converter.to_grid_action(encoded)
        }

        fn remember(
            &mut self,
            _slot: usize,
            _obs: &Observation,
            _action: usize,
            _reward: f32,
            _next_obs: &Observation,
            _done: bool,
        ) -> Result<()> {
            self.remembered += 1;
            Ok(())
        }

        fn epsilon_at(&self, _step: usize) -> f32 {
            0.5
        }

        fn learning_rate_at(&self, _train_step: usize) -> f32 {
            1e-3
        }

        fn update_freq(&self) -> usize {
            4
        }

        fn ready(&self) -> bool {
            self.remembered >= 8
        }

        fn learn(&mut self, _train_step: usize) -> Result<f32> {
            self.learned += 1;
            Ok(0.0)
        }
    }

    #[test]
    fn test_train_loop_drives_agent() {
        let mut env = ToyCase5::seeded(3);
        let mut agent = CountingAgent::new(&env);
        train_loop(&mut env, &mut agent, 20, false, None).unwrap();
        assert_eq!(agent.remembered, 20);
        // ready after 8 transitions, then one update per 4 collected
        assert!(agent.learned >= 3);
        assert!(agent.episodes_begun >= 1);
    }

    #[test]
    fn test_greedy_picks_max_and_breaks_ties_low() {
        assert_eq!(greedy(array![0.1, 0.9, 0.3].view()), 1);
        assert_eq!(greedy(array![0.5, 0.5].view()), 0);
    }

    #[test]
    fn test_stack_batch_shapes() {
        let e0 = Experience {
            state: array![1.0, 2.0],
            action: 3,
            reward: 0.5,
            next_state: array![3.0, 4.0],
            done: false,
        };
        let e1 = Experience {
            state: array![5.0, 6.0],
            action: 1,
            reward: -1.0,
            next_state: array![7.0, 8.0],
            done: true,
        };
        let (states, actions, rewards, next_states, dones) = stack_batch(&[&e0, &e1]);
        assert_eq!(states.shape(), &[2, 2]);
        assert_eq!(next_states[[1, 0]], 7.0);
        assert_eq!(actions, vec![3, 1]);
        assert_eq!(rewards, vec![0.5, -1.0]);
        assert_eq!(dones, vec![false, true]);
    }

    #[test]
    fn test_mse_zero_for_identical() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(mse(&a, &a.clone()), 0.0);
        let b = &a + 1.0;
        assert!((mse(&a, &b) - 1.0).abs() < 1e-6);
    }
}
