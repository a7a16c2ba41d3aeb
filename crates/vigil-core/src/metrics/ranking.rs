//! Threshold-free ranking metrics.

use super::curve::{auroc, average_precision};
use super::{Metric, Samples};

/// Area under the ROC curve.
#[derive(Debug, Clone, Default)]
pub struct AUROC {
    samples: Samples,
}

impl Metric for AUROC {
    fn name(&self) -> &'static str {
        "AUROC"
    }

    fn update(&mut self, preds: &[f32], targets: &[f32]) {
        self.samples.extend(preds, targets);
    }

    fn compute(&self) -> f64 {
        auroc(&self.samples.preds, &self.samples.targets)
    }

    fn reset(&mut self) {
        self.samples.clear();
    }

    fn num_samples(&self) -> usize {
        self.samples.len()
    }
}

/// Area under the precision-recall curve (average precision).
#[derive(Debug, Clone, Default)]
pub struct AUPR {
    samples: Samples,
}

impl Metric for AUPR {
    fn name(&self) -> &'static str {
        "AUPR"
    }

    fn update(&mut self, preds: &[f32], targets: &[f32]) {
        self.samples.extend(preds, targets);
    }

    fn compute(&self) -> f64 {
        average_precision(&self.samples.preds, &self.samples.targets)
    }

    fn reset(&mut self) {
        self.samples.clear();
    }

    fn num_samples(&self) -> usize {
        self.samples.len()
    }
}
