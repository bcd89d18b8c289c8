//! Model Configuration - hyper-parameters as TOML values
//!
//! Each section implements `Default` with the values the training core has
//! always used, so a missing file or a partial file behaves identically to
//! the built-in settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "RNNLM_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "rnnlm.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a language-model run.
///
/// Load with `ModelConfig::load()` which searches:
/// 1. `$RNNLM_CONFIG` env var
/// 2. `./rnnlm.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    /// Architecture and initialization
    #[serde(default)]
    pub model: ArchitectureConfig,

    /// SGD hyper-parameters
    #[serde(default)]
    pub training: TrainingConfig,

    /// Sampling limits
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Finite-difference gradient check settings
    #[serde(default)]
    pub grad_check: GradCheckConfig,
}

impl ModelConfig {
    /// Load configuration using the standard search order, falling back to
    /// defaults when no usable file is found.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded model config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(
                            path = %p.display(),
                            error = %e,
                            "Failed to load config from {}, falling back",
                            CONFIG_ENV_VAR
                        );
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./rnnlm.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded model config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No model config file found, using built-in defaults");
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Save config to a file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Model config saved");
        Ok(())
    }

    /// Validate every hyper-parameter, collecting all violations.
    ///
    /// Rules:
    /// - Learning rate must be finite and positive
    /// - L2 strength must be finite and non-negative
    /// - Gradient-check epsilon and tolerance must be finite and positive
    /// - Generation length must be > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let lr = self.training.learning_rate;
        if !(lr.is_finite() && lr > 0.0) {
            errors.push(format!("training.learning_rate ({lr}) must be finite and > 0"));
        }
        let l2 = self.training.l2_reg;
        if !(l2.is_finite() && l2 >= 0.0) {
            errors.push(format!("training.l2_reg ({l2}) must be finite and >= 0"));
        }
        Self::check_positive(self.grad_check.epsilon, "grad_check.epsilon", &mut errors);
        Self::check_positive(self.grad_check.tolerance, "grad_check.tolerance", &mut errors);
        if self.generation.max_len == 0 {
            errors.push("generation.max_len must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_positive(value: f64, name: &str, errors: &mut Vec<String>) {
        if !(value.is_finite() && value > 0.0) {
            errors.push(format!("{name} ({value}) must be finite and > 0"));
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Architecture
// ============================================================================

/// Which output layer scores the next word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Full-vocabulary softmax over `U·h`.
    Flat,
    /// Binary-tree hierarchical softmax.
    #[default]
    Hierarchical,
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputKind::Flat => write!(f, "flat"),
            OutputKind::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Output layer variant
    #[serde(default)]
    pub output_layer: OutputKind,

    /// Truncation window: extra timesteps each output's gradient is pushed
    /// back through (0 = current step only)
    #[serde(default = "default_bptt")]
    pub bptt: usize,

    /// Seed for all random initialization
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_bptt() -> usize {
    1
}
fn default_seed() -> u64 {
    10
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            output_layer: OutputKind::default(),
            bptt: default_bptt(),
            seed: default_seed(),
        }
    }
}

// ============================================================================
// Training
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// SGD step size (alpha)
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// L2 regularization strength (lambda)
    #[serde(default = "default_l2_reg")]
    pub l2_reg: f64,
}

fn default_learning_rate() -> f64 {
    0.005
}
fn default_l2_reg() -> f64 {
    0.00001
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            l2_reg: default_l2_reg(),
        }
    }
}

// ============================================================================
// Generation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of sampled words per sequence
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

fn default_max_len() -> usize {
    100
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_len: default_max_len() }
    }
}

// ============================================================================
// Gradient Check
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradCheckConfig {
    /// Perturbation size for central differences
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Maximum accepted error norm per parameter group
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_epsilon() -> f64 {
    1e-4
}
fn default_tolerance() -> f64 {
    1e-6
}

impl Default for GradCheckConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            tolerance: default_tolerance(),
        }
    }
}
