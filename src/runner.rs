use serde::{Serialize, Deserialize};
use std::fs;
use std::path::Path;

use crate::env::{GridEnv, Observation};
use crate::env::GridAction;
use crate::error::{GridRlError, Result};

/// How a trained agent picks actions during evaluation.
///
/// `reset` is called at every episode start so stateful policies (frame
/// stacks, recurrent trace windows) can clear their history.
pub trait Policy {
    fn reset(&mut self) {}
    fn act(&mut self, obs: &Observation) -> Result<GridAction>;
}

/// Evaluation settings.
///
/// `nb_process` is accepted for interface compatibility and validated, but
/// episodes run sequentially in-process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalParam {
    pub nb_episode: usize,
    pub nb_process: usize,
    /// Per-episode step cap; the environment's own episode cap still applies.
    pub max_steps: Option<usize>,
    pub verbose: bool,
}

impl Default for EvalParam {
    fn default() -> Self {
        EvalParam {
            nb_episode: 1,
            nb_process: 1,
            max_steps: None,
            verbose: false,
        }
    }
}

/// Accounting for one evaluated episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeResult {
    pub episode: usize,
    pub nb_steps: usize,
    /// The step cap that applied to this episode.
    pub max_steps: usize,
    pub total_reward: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct EvalSummary {
    env: String,
    nb_episode: usize,
    results: Vec<EpisodeResult>,
}

/// Run greedy evaluation episodes and collect per-episode statistics.
///
/// When `logs_path` is given, a JSON summary is written to
/// `<logs_path>/eval_summary.json`.
pub fn run_episodes<E, P>(
    env: &mut E,
    policy: &mut P,
    params: &EvalParam,
    logs_path: Option<&Path>,
) -> Result<Vec<EpisodeResult>>
where
    E: GridEnv,
    P: Policy,
{
    if params.nb_process == 0 {
        return Err(GridRlError::invalid_parameter("nb_process", "must be at least 1"));
    }

    let cap = params
        .max_steps
        .map_or(env.max_episode_len(), |m| m.min(env.max_episode_len()));

    let mut results = Vec::with_capacity(params.nb_episode);
    for episode in 0..params.nb_episode {
        let mut obs = env.reset();
        policy.reset();

        let mut nb_steps = 0;
        let mut total_reward = 0.0;
        while nb_steps < cap {
            let action = policy.act(&obs)?;
            let outcome = env.step(action);
            nb_steps += 1;
            total_reward += outcome.reward;
            obs = outcome.obs;
            if outcome.done {
                break;
            }
        }

        if params.verbose {
            println!(
                "episode {:>3}: {:>4}/{} steps, total reward {:.3}",
                episode, nb_steps, cap, total_reward
            );
        }
        results.push(EpisodeResult {
            episode,
            nb_steps,
            max_steps: cap,
            total_reward,
        });
    }

    if let Some(logs_path) = logs_path {
        fs::create_dir_all(logs_path)?;
        let summary = EvalSummary {
            env: env.name().to_string(),
            nb_episode: params.nb_episode,
            results: results.clone(),
        };
        let serialized = serde_json::to_string_pretty(&summary)?;
        fs::write(logs_path.join("eval_summary.json"), serialized)?;
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ToyCase5;

    struct DoNothing;

    impl Policy for DoNothing {
        fn act(&mut self, _obs: &Observation) -> Result<GridAction> {
            Ok(GridAction::DoNothing)
        }
    }

    #[test]
    fn test_episodes_respect_step_cap() {
        let mut env = ToyCase5::new();
        let params = EvalParam {
            nb_episode: 2,
            max_steps: Some(15),
            ..Default::default()
        };
        let results = run_episodes(&mut env, &mut DoNothing, &params, None).unwrap();
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.max_steps, 15);
            assert!(r.nb_steps <= 15 && r.nb_steps > 0);
        }
    }

    #[test]
    fn test_summary_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = ToyCase5::new();
        let params = EvalParam {
            max_steps: Some(5),
            ..Default::default()
        };
        run_episodes(&mut env, &mut DoNothing, &params, Some(dir.path())).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("eval_summary.json")).unwrap();
        assert!(contents.contains("toy_case5"));
        assert!(contents.contains("nb_steps"));
    }

    #[test]
    fn test_zero_processes_rejected() {
        let mut env = ToyCase5::new();
        let params = EvalParam {
            nb_process: 0,
            ..Default::default()
        };
        assert!(run_episodes(&mut env, &mut DoNothing, &params, None).is_err());
    }
}
