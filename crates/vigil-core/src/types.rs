use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a model learns from the training split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningType {
    OneClass,
    ZeroShot,
    FewShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Classification,
    Detection,
    #[default]
    Segmentation,
}

impl TaskType {
    /// Whether pixel-level outputs (maps, masks) are evaluated.
    #[must_use]
    pub fn is_pixel_level(self) -> bool {
        !matches!(self, Self::Classification)
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "classification" => Ok(Self::Classification),
            "detection" => Ok(Self::Detection),
            "segmentation" => Ok(Self::Segmentation),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Classification => "classification",
            Self::Detection => "detection",
            Self::Segmentation => "segmentation",
        };
        f.write_str(s)
    }
}

/// Overrides a model imposes on the engine's loop settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient_clip_val: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sanity_val_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_val_every_n_epoch: Option<u32>,
}

impl TrainerArguments {
    /// Single-pass fitting, as used by statistics-based models.
    #[must_use]
    pub fn single_epoch() -> Self {
        Self { max_epochs: Some(1), num_sanity_val_steps: Some(0), ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_parse_and_display() {
        assert_eq!("Detection".parse::<TaskType>().unwrap(), TaskType::Detection);
        assert!("bogus".parse::<TaskType>().is_err());
        assert_eq!(TaskType::Segmentation.to_string(), "segmentation");
        assert!(!TaskType::Classification.is_pixel_level());
    }

    #[test]
    fn test_trainer_arguments_skip_unset_fields() {
        let json = serde_json::to_value(TrainerArguments::single_epoch()).unwrap();
        assert_eq!(json, serde_json::json!({"max_epochs": 1, "num_sanity_val_steps": 0}));
    }
}
