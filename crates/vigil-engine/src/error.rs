use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;
use vigil_core::{CheckpointError, UnitError};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("data error: {0}")]
    Data(String),

    #[error("unknown datamodule `{0}` (expected `folder` or `clips`)")]
    UnknownDataModule(String),

    #[error("dataset path not found: {}", .0.display())]
    DatasetNotFound(PathBuf),

    #[error("export error: {0}")]
    Export(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::ser::Error),
}
