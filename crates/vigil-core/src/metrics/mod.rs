//! Evaluation metrics for anomaly scores.
//!
//! Metrics are registered by class name (see [`crate::registry::metrics`])
//! so collections can be rebuilt from the keys of a saved state dict:
//! - Ranking: AUROC, AUPR
//! - Thresholded: F1Score, F1Max

mod classification;
mod collection;
pub(crate) mod curve;
mod ranking;

pub use classification::{F1Max, F1Score};
pub use collection::MetricCollection;
pub use ranking::{AUPR, AUROC};

use crate::state::StateDict;
use serde_json::json;

/// Trait for evaluation metrics accumulated over batches.
pub trait Metric: std::fmt::Debug + Send + Sync {
    /// Class name; also the registry key.
    fn name(&self) -> &'static str;

    fn update(&mut self, preds: &[f32], targets: &[f32]);

    fn compute(&self) -> f64;

    fn reset(&mut self);

    fn num_samples(&self) -> usize;

    /// Threshold used by label-based metrics. Others ignore it.
    fn set_threshold(&mut self, _threshold: f32) {}

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("num_samples".to_string(), json!(self.num_samples()));
        state
    }
}

/// Accumulated predictions and binary targets.
#[derive(Debug, Clone, Default)]
pub(crate) struct Samples {
    pub preds: Vec<f32>,
    pub targets: Vec<f32>,
}

impl Samples {
    pub fn extend(&mut self, preds: &[f32], targets: &[f32]) {
        let n = preds.len().min(targets.len());
        self.preds.extend_from_slice(&preds[..n]);
        self.targets.extend_from_slice(&targets[..n]);
    }

    pub fn clear(&mut self) {
        self.preds.clear();
        self.targets.clear();
    }

    pub fn len(&self) -> usize {
        self.preds.len()
    }
}
