//! Self-contained model bundles for deployment.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use vigil_core::{StateDict, TaskType};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportType {
    Json,
    Toml,
}

impl ExportType {
    pub const ALL: [Self; 2] = [Self::Json, Self::Toml];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Toml => "toml",
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ExportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            other => Err(EngineError::Export(format!("unknown export type `{other}` (expected json or toml)"))),
        }
    }
}

/// Everything needed to score images outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub model_name: String,
    pub task: TaskType,
    /// `(height, width)` the model expects
    pub input_size: (usize, usize),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_threshold: Option<f32>,
    #[serde(default)]
    pub normalization: StateDict,
    pub state_dict: StateDict,
}

impl ExportBundle {
    pub fn write(&self, path: &Path, export_type: ExportType) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = match export_type {
            ExportType::Json => serde_json::to_string_pretty(self)?,
            ExportType::Toml => toml::to_string_pretty(self)?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reads a bundle, picking the format from the file extension.
    pub fn read(path: &Path) -> EngineResult<Self> {
        let export_type: ExportType = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| EngineError::Export(format!("{}: missing file extension", path.display())))?
            .parse()?;
        let content = std::fs::read_to_string(path)?;
        let bundle: Self = match export_type {
            ExportType::Json => serde_json::from_str(&content)?,
            ExportType::Toml => {
                toml::from_str(&content).map_err(|e| EngineError::Export(format!("{}: {}", path.display(), e)))?
            }
        };
        if bundle.format_version != EXPORT_FORMAT_VERSION {
            return Err(EngineError::Export(format!(
                "unsupported export format version {}",
                bundle.format_version
            )));
        }
        Ok(bundle)
    }
}
