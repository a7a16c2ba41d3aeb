//! Engine configuration file support.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use vigil_core::{TaskType, TrainerArguments};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for exports and default checkpoint locations
    pub default_root_dir: PathBuf,

    pub max_epochs: u32,

    /// Training step budget; -1 means unlimited
    pub max_steps: i64,

    pub task: TaskType,

    pub image_metrics: Vec<String>,

    /// Only evaluated for pixel-level tasks
    pub pixel_metrics: Vec<String>,

    pub train_batch_size: usize,

    pub eval_batch_size: usize,
}

fn default_metrics() -> Vec<String> {
    vec!["F1Score".to_string(), "AUROC".to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_root_dir: PathBuf::from("results"),
            max_epochs: 1,
            max_steps: -1,
            task: TaskType::Segmentation,
            image_metrics: default_metrics(),
            pixel_metrics: default_metrics(),
            train_batch_size: 32,
            eval_batch_size: 32,
        }
    }
}

/// Loop limits after unit overrides were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_epochs: u32,
    pub max_steps: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::ReadError(format!("Failed to write file: {}", e)))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_steps < -1 {
            return Err(ConfigError::InvalidValue(format!("max_steps must be -1 or >= 0, got {}", self.max_steps)));
        }
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(ConfigError::InvalidValue("batch sizes must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Applies the overrides a unit asks for on top of this config.
    #[must_use]
    pub fn limits(&self, overrides: &TrainerArguments) -> LoopLimits {
        let max_epochs = overrides.max_epochs.unwrap_or(self.max_epochs);
        let max_steps = overrides.max_steps.unwrap_or(self.max_steps);
        LoopLimits { max_epochs, max_steps: u64::try_from(max_steps).ok() }
    }
}
