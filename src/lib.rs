//! rnnlm: Recurrent Neural-Network Language Model
//!
//! Single-layer sigmoid RNN trained with truncated backpropagation through
//! time, scoring the next word with either a full softmax or a binary-tree
//! hierarchical softmax.
//!
//! ## Modules
//!
//! - **rnn**: parameter store, hierarchical softmax tree, BPTT engine,
//!   sequence generator and gradient checker
//! - **config**: TOML-backed hyper-parameters

pub mod config;
pub mod rnn;

// Re-export configuration
pub use config::{ConfigError, ModelConfig, OutputKind};

// Re-export the model surface
pub use rnn::eval::{adjust_loss, perplexity, AdjustMode};
pub use rnn::{GradCheckEntry, GradCheckReport, Matrix, ModelError, RnnLm};
