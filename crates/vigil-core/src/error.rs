use crate::checkpoint::CheckpointError;
use crate::registry::RegistryError;
use thiserror::Error;

pub type UnitResult<T> = std::result::Result<T, UnitError>;

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("{0} is not implemented for this model")]
    NotImplemented(&'static str),

    #[error("attribute `{0}` is not set")]
    MissingAttribute(&'static str),

    #[error("batch is missing key `{0}`")]
    MissingBatchKey(String),

    /// A type path or metric name in a state dict did not resolve.
    #[error("Class {class_name} not found in {namespace}")]
    Import {
        class_name: String,
        namespace: String,
        #[source]
        source: RegistryError,
    },

    #[error("unexpected keys in state dict: {}", .0.join(", "))]
    UnexpectedKeys(Vec<String>),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("invalid state: {0}")]
    State(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UnitError {
    pub fn import(class_name: impl Into<String>, source: RegistryError) -> Self {
        let namespace = match &source {
            RegistryError::NotFound { namespace, .. } => namespace.clone(),
            RegistryError::Poisoned(_) => "registry".to_string(),
        };
        Self::Import { class_name: class_name.into(), namespace, source }
    }
}
