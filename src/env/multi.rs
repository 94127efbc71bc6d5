use super::{GridAction, GridDescriptor, GridEnv, Observation, StepOutcome};
use crate::error::{GridRlError, Result};

/// A batch of environment instances stepped in lockstep.
///
/// Implemented by every [`GridEnv`] (as a batch of one), so training code
/// written against `VecEnv` accepts a bare environment or a [`MultiEnv`]
/// without caring which.
pub trait VecEnv {
    fn n_envs(&self) -> usize;
    fn descriptor(&self) -> &GridDescriptor;
    fn reset_all(&mut self) -> Vec<Observation>;

    /// Step every instance with its action, one action per instance.
    ///
    /// Finished instances reset automatically: the outcome keeps `done`
    /// true but its `obs` is already the first observation of the next
    /// episode, so bootstrapping must be gated on `done`.
    fn step_all(&mut self, actions: &[GridAction]) -> Vec<StepOutcome>;
}

impl<E: GridEnv> VecEnv for E {
    fn n_envs(&self) -> usize {
        1
    }

    fn descriptor(&self) -> &GridDescriptor {
        GridEnv::descriptor(self)
    }

    fn reset_all(&mut self) -> Vec<Observation> {
        vec![self.reset()]
    }

    fn step_all(&mut self, actions: &[GridAction]) -> Vec<StepOutcome> {
        debug_assert_eq!(actions.len(), 1);
        let mut outcome = self.step(actions[0]);
        if outcome.done {
            outcome.obs = self.reset();
        }
        vec![outcome]
    }
}

/// Several copies of the same scenario running side by side, for faster
/// experience collection.
pub struct MultiEnv<E: GridEnv + Clone> {
    envs: Vec<E>,
}

/// Wrap `env` into a batch of `n_envs` independent copies.
pub fn make_multi_env<E: GridEnv + Clone>(env: E, n_envs: usize) -> Result<MultiEnv<E>> {
    if n_envs == 0 {
        return Err(GridRlError::invalid_parameter(
            "n_envs",
            "need at least one environment copy",
        ));
    }
    Ok(MultiEnv { envs: vec![env; n_envs] })
}

impl<E: GridEnv + Clone> VecEnv for MultiEnv<E> {
    fn n_envs(&self) -> usize {
        self.envs.len()
    }

    fn descriptor(&self) -> &GridDescriptor {
        GridEnv::descriptor(&self.envs[0])
    }

    fn reset_all(&mut self) -> Vec<Observation> {
        self.envs.iter_mut().map(|env| env.reset()).collect()
    }

    fn step_all(&mut self, actions: &[GridAction]) -> Vec<StepOutcome> {
        debug_assert_eq!(actions.len(), self.envs.len());
        self.envs
            .iter_mut()
            .zip(actions)
            .map(|(env, &action)| {
                let mut outcome = env.step(action);
                if outcome.done {
                    outcome.obs = env.reset();
                }
                outcome
            })
            .collect()
    }
}
