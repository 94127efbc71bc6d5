//! # GridRL - Reinforcement Learning Baselines for Power Grid Control
//!
//! GridRL is a Rust library of reference agents for the grid operation
//! problem: keep a transmission network inside its thermal limits by
//! switching lines and reassigning substation buses. It bundles a small
//! neural network stack, discrete action encoding for grid topologies,
//! replay storage, and seven trainable baselines with a shared
//! train/evaluate surface.
//!
//! ## Key Features
//!
//! - **Baselines**: DQN, dueling DQN, double dueling DQN with frame
//!   stacking, discrete SAC, latent leap networks, and two recurrent
//!   trace-trained variants
//! - **Neural Networks**: Dense, LSTM and modulation layers with SGD and
//!   Adam optimizers
//! - **Action Encoding**: Enumerated line switching and bus reassignment
//!   actions behind a single integer interface
//! - **Replay Storage**: Step replay and episode-trace replay buffers
//! - **Evaluation**: Greedy episode runner with CSV training logs and JSON
//!   summaries
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gridrl::baselines::deep_q;
//! use gridrl::converter::ConverterParam;
//! use gridrl::env::ToyCase5;
//! use gridrl::params::{NnParam, TrainingParam};
//!
//! let mut env = ToyCase5::new();
//! let training = TrainingParam::default();
//! let nn = NnParam {
//!     sizes: vec![100, 50, 10],
//!     activs: vec!["relu".into(), "relu".into(), "relu".into()],
//!     list_attr_obs: vec!["rho".into(), "line_status".into()],
//! };
//! let converter = ConverterParam { change_bus_vect: true, ..Default::default() };
//!
//! let agent = deep_q::train(
//!     &mut env, "DeepQ", 10_000, None, None, None, &training, false, &converter, &nn,
//! ).unwrap();
//! ```
//!
//! ## Module Organization
//!
//! - [`activations`] - Activation functions (ReLU, Sigmoid, Tanh, etc.)
//! - [`baselines`] - The trainable agents and their entry points
//! - [`converter`] - Discrete action enumeration for grid topologies
//! - [`env`] - The grid environment traits and the bundled toy network
//! - [`error`] - Error types and result handling
//! - [`layers`] - Neural network layers (Dense, LSTM, Ltau)
//! - [`logger`] - CSV training logs
//! - [`network`] - Core neural network implementation
//! - [`optimizer`] - Optimization algorithms
//! - [`params`] - Training and architecture hyperparameter sets
//! - [`replay_buffer`] - Step and episode-trace experience replay
//! - [`runner`] - Greedy evaluation episodes and their summaries

#[macro_use]
pub mod macros;

pub mod activations;
pub mod baselines;
pub mod converter;
pub mod env;
pub mod error;
pub mod layers;
pub mod logger;
pub mod network;
pub mod optimizer;
pub mod params;
pub mod replay_buffer;
pub mod runner;
