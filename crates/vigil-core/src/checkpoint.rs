//! Versioned on-disk checkpoint schema.
//!
//! A unit's state dict is nested under `state_dict`; loop bookkeeping
//! (epoch, step, hyperparameters) lives beside it.

use crate::error::UnitResult;
use crate::state::StateDict;
use crate::unit::AnomalyModule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported checkpoint format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub model_name: String,
    pub epoch: u32,
    pub global_step: u64,
    #[serde(default)]
    pub hyper_parameters: serde_json::Value,
    pub state_dict: StateDict,
}

/// A written checkpoint and its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointArtifact {
    pub path: PathBuf,
    pub sha256: String,
}

impl Checkpoint {
    /// Captures the current state of `unit`.
    pub fn capture(unit: &dyn AnomalyModule, epoch: u32, global_step: u64) -> UnitResult<Self> {
        Ok(Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            created_at: Utc::now(),
            model_name: unit.name().to_string(),
            epoch,
            global_step,
            hyper_parameters: unit.hyperparameters(),
            state_dict: unit.state_dict()?,
        })
    }

    pub fn save(&self, path: &Path) -> CheckpointResult<CheckpointArtifact> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, &bytes)?;
        debug!(path = %path.display(), entries = self.state_dict.len(), "Saved checkpoint");
        Ok(CheckpointArtifact { path: path.to_path_buf(), sha256: sha256_bytes(&bytes) })
    }

    pub fn load(path: &Path) -> CheckpointResult<Self> {
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        let checkpoint: Self = serde_json::from_slice(&bytes)?;
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.format_version,
                expected: CHECKPOINT_FORMAT_VERSION,
            });
        }
        Ok(checkpoint)
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> CheckpointResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}
