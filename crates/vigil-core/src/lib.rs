//! Vigil Core
//!
//! Building blocks shared by every anomaly model:
//! - The training-unit contract (`AnomalyModule`, `UnitState`)
//! - Batches, tensors and persisted state dicts
//! - Thresholds, normalization and metric collections
//! - Registries that rebuild components from checkpoints
//! - The versioned checkpoint format

pub mod batch;
pub mod callback;
pub mod checkpoint;
pub mod error;
pub mod metrics;
pub mod normalization;
pub mod registry;
pub mod state;
pub mod threshold;
pub mod types;
pub mod unit;

pub use batch::{Batch, BatchExt, BatchValue, StepOutput, Tensor};
pub use callback::{Callback, CallbackContext, Stage};
pub use checkpoint::{Checkpoint, CheckpointArtifact, CheckpointError, CheckpointResult};
pub use error::{UnitError, UnitResult};
pub use metrics::{Metric, MetricCollection, AUPR, AUROC, F1Max, F1Score};
pub use normalization::{MinMax, Normalizer};
pub use registry::{Registry, RegistryError};
pub use state::{StateDict, StateDictExt};
pub use threshold::{F1AdaptiveThreshold, ManualThreshold, Threshold};
pub use types::{LearningType, TaskType, TrainerArguments};
pub use unit::{AnomalyModule, Loss, Model, TrainStepOutput, UnitState};
