use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EncoderConfig, FeatureConfig, OptimConfig};

/// Update rule selected for training.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam with bias correction.
    #[default]
    Adam,
    /// Plain gradient descent.
    Sgd,
}

/// Hyper-parameters of a training run.
///
/// Read from an optional TOML file, overridden by command-line flags, then
/// checked once with [`TrainOptions::validate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainOptions {
    /// Passes over the training triples.
    pub epochs: usize,
    /// Positives per optimizer step.
    pub batch_size: usize,
    /// Hidden and relation-embedding width.
    pub hidden_dim: usize,
    /// Aggregation layers.
    pub layers: usize,
    /// Per-hop sample sizes, one per layer.
    pub fanouts: Vec<usize>,
    /// Corrupted tails drawn per positive.
    pub negatives: usize,
    /// Weight of the relation-classification loss.
    pub lambda_rel: f32,
    /// Learning rate.
    pub lr: f32,
    /// Update rule.
    pub optimizer: OptimizerKind,
    /// Use `log1p(in_degree)` when a reverse graph is available.
    pub use_in_degree: bool,
    /// Add deterministic per-node feature noise.
    pub add_noise: bool,
    /// ReLU after every projection.
    pub use_relu: bool,
    /// Seed of the run's random stream.
    pub seed: u64,
    /// Where to write checkpoints; nothing is saved when unset.
    pub checkpoint: Option<PathBuf>,
    /// Save every this many epochs in addition to the final save; 0 saves
    /// only at the end.
    pub checkpoint_every: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 256,
            hidden_dim: 64,
            layers: 2,
            fanouts: vec![20, 10],
            negatives: 5,
            lambda_rel: 1.0,
            lr: 0.001,
            optimizer: OptimizerKind::Adam,
            use_in_degree: true,
            add_noise: false,
            use_relu: true,
            seed: 1,
            checkpoint: None,
            checkpoint_every: 0,
        }
    }
}

impl TrainOptions {
    /// Loads options from `explicit`, else from the default config file if
    /// one exists, else returns the defaults.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => read_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => read_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parses TOML text; absent keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Checks ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::Invalid { field, reason };
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be positive".into()));
        }
        if self.hidden_dim == 0 {
            return Err(invalid("hidden_dim", "must be positive".into()));
        }
        if self.layers == 0 {
            return Err(invalid("layers", "must be positive".into()));
        }
        if self.fanouts.len() != self.layers {
            return Err(invalid(
                "fanouts",
                format!("has {} entries for {} layers", self.fanouts.len(), self.layers),
            ));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(invalid("lr", format!("{} is not a positive step size", self.lr)));
        }
        if !(self.lambda_rel.is_finite() && self.lambda_rel >= 0.0) {
            return Err(invalid("lambda_rel", format!("{} must be >= 0", self.lambda_rel)));
        }
        Ok(())
    }

    /// Encoder shape derived from these options.
    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            hidden_dim: self.hidden_dim,
            layers: self.layers,
            fanouts: self.fanouts.clone(),
            use_relu: self.use_relu,
        }
    }

    /// Requested feature flags, before resolution against a reverse graph.
    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig {
            use_in_degree: self.use_in_degree,
            add_noise: self.add_noise,
        }
    }

    /// Optimizer settings derived from these options.
    pub fn optim_config(&self) -> OptimConfig {
        OptimConfig {
            lr: self.lr,
            use_adam: self.optimizer == OptimizerKind::Adam,
            ..OptimConfig::default()
        }
    }
}

fn read_file(path: &Path) -> Result<TrainOptions, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `<config dir>/relsage/train.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("relsage").join("train.toml"))
}

/// Failures while reading or checking [`TrainOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The option file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that was opened.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The option file is not valid TOML for [`TrainOptions`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A value is out of range or inconsistent with another.
    #[error("invalid option {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}
