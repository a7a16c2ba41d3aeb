//! Model factory: builds units by name.

use crate::{FrameDiff, Gaussian, MemoryBank, PcaDensity};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error};
use vigil_core::{AnomalyModule, UnitError};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model `{0}`; available models: {}", get_available_models().join(", "))]
    UnknownModel(String),

    #[error("model `{model}` requires the `{argument}` argument")]
    MissingArgument { model: &'static str, argument: &'static str },

    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// Every model the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    FrameDiff,
    Gaussian,
    MemoryBank,
    PcaDensity,
}

impl ModelType {
    pub const ALL: [Self; 4] = [Self::FrameDiff, Self::Gaussian, Self::MemoryBank, Self::PcaDensity];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FrameDiff => crate::frame_diff::NAME,
            Self::Gaussian => crate::gaussian::NAME,
            Self::MemoryBank => crate::memory_bank::NAME,
            Self::PcaDensity => crate::pca_density::NAME,
        }
    }

    /// Video models consume `[B, T, H, W]` clip batches.
    #[must_use]
    pub const fn is_video(self) -> bool {
        matches!(self, Self::FrameDiff)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "frame_diff" | "framediff" => Ok(Self::FrameDiff),
            "gaussian" => Ok(Self::Gaussian),
            "memory_bank" | "memorybank" => Ok(Self::MemoryBank),
            "pca_density" | "pcadensity" | "pca" => Ok(Self::PcaDensity),
            _ => Err(ModelError::UnknownModel(s.to_string())),
        }
    }
}

/// Optional constructor arguments; each model reads the ones it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelArgs {
    pub input_size: Option<(usize, usize)>,
    pub n_pca_components: Option<usize>,
}

impl ModelArgs {
    #[must_use]
    pub fn with_input_size(mut self, height: usize, width: usize) -> Self {
        self.input_size = Some((height, width));
        self
    }

    #[must_use]
    pub fn with_n_pca_components(mut self, n: usize) -> Self {
        self.n_pca_components = Some(n);
        self
    }
}

/// Names accepted by [`get_model`], sorted.
#[must_use]
pub fn get_available_models() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = ModelType::ALL.iter().map(|m| m.name()).collect();
    names.sort_unstable();
    names
}

/// Builds the model registered under `name`.
///
/// # Errors
/// Returns [`ModelError::UnknownModel`] for an unregistered name and
/// [`ModelError::MissingArgument`] when a required argument is absent.
pub fn get_model(name: &str, args: &ModelArgs) -> Result<Box<dyn AnomalyModule>, ModelError> {
    let model_type = ModelType::from_str(name).inspect_err(|_| {
        error!(model = %name, "Unrecognized model");
    })?;
    debug!(model = %model_type, ?args, "Creating model instance");

    let unit: Box<dyn AnomalyModule> = match model_type {
        ModelType::FrameDiff => Box::new(FrameDiff::new()),
        ModelType::Gaussian => Box::new(Gaussian::new()),
        ModelType::MemoryBank => {
            let (h, w) = args
                .input_size
                .ok_or(ModelError::MissingArgument { model: model_type.name(), argument: "input_size" })?;
            Box::new(MemoryBank::new((h, w))?)
        }
        ModelType::PcaDensity => {
            let n = args
                .n_pca_components
                .ok_or(ModelError::MissingArgument { model: model_type.name(), argument: "n_pca_components" })?;
            Box::new(PcaDensity::new(n)?)
        }
    };
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_models_sorted() {
        let names = get_available_models();
        assert_eq!(names, vec!["frame_diff", "gaussian", "memory_bank", "pca_density"]);
    }

    #[test]
    fn test_model_type_from_str() {
        assert_eq!("Gaussian".parse::<ModelType>().unwrap(), ModelType::Gaussian);
        assert_eq!("memory-bank".parse::<ModelType>().unwrap(), ModelType::MemoryBank);
        assert!("patchcore".parse::<ModelType>().is_err());
        assert!(ModelType::FrameDiff.is_video());
    }

    #[test]
    fn test_get_model_by_name() {
        let args = ModelArgs::default().with_input_size(8, 8).with_n_pca_components(2);
        for name in get_available_models() {
            let unit = get_model(name, &args).unwrap();
            assert_eq!(unit.name(), name);
        }
    }

    #[test]
    fn test_unknown_model() {
        let err = get_model("patchcore", &ModelArgs::default()).err().unwrap();
        assert!(matches!(&err, ModelError::UnknownModel(n) if n == "patchcore"));
        assert!(err.to_string().contains("gaussian"));
    }

    #[test]
    fn test_missing_arguments() {
        assert!(matches!(
            get_model("memory_bank", &ModelArgs::default()),
            Err(ModelError::MissingArgument { argument: "input_size", .. })
        ));
        assert!(matches!(
            get_model("pca_density", &ModelArgs::default()),
            Err(ModelError::MissingArgument { argument: "n_pca_components", .. })
        ));
    }
}
