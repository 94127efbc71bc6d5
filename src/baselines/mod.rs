//! The seven baseline agents, one module per algorithm.
//!
//! Every module exposes a `train` and an `evaluate` entry point. The
//! feed-forward family (`deep_q`, `duel_q`, `sac`, `leap_net`) is driven by
//! [`crate::params::TrainingParam`] and checkpoints to a directory per run;
//! the config-struct family (`double_duel_q`, `recurrent_q`, `slice_rdqn`)
//! carries its own hyperparameter struct and checkpoints to a single file.

pub mod common;
pub mod deep_q;
pub mod double_duel_q;
pub mod duel_q;
pub mod leap_net;
pub mod recurrent_q;
pub mod sac;
pub mod slice_rdqn;

pub use common::BaselineAgent;
