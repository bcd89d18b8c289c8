//! Model Configuration Module
//!
//! Hyper-parameters loaded from TOML files instead of being hardcoded at the
//! call sites that build and train a model.
//!
//! ## Loading Order
//!
//! 1. `RNNLM_CONFIG` environment variable (path to TOML file)
//! 2. `rnnlm.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! ```ignore
//! let config = ModelConfig::load();
//! let model = RnnLm::new(l0, None, &config)?;
//! ```

mod model_config;

pub use model_config::*;
