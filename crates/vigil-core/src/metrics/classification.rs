//! Label-based metrics: F1 at a threshold, and the best achievable F1.

use super::curve::{best_f1_threshold, f1};
use super::{Metric, Samples};
use crate::state::StateDict;
use serde_json::json;

/// F1 score with predictions binarized at `threshold`.
///
/// Scores are normally min-max normalized before reaching the metric, which
/// puts the fitted threshold at 0.5.
#[derive(Debug, Clone)]
pub struct F1Score {
    threshold: f32,
    samples: Samples,
}

impl Default for F1Score {
    fn default() -> Self {
        Self { threshold: 0.5, samples: Samples::default() }
    }
}

impl Metric for F1Score {
    fn name(&self) -> &'static str {
        "F1Score"
    }

    fn update(&mut self, preds: &[f32], targets: &[f32]) {
        self.samples.extend(preds, targets);
    }

    fn compute(&self) -> f64 {
        let (mut tp, mut fp, mut fn_) = (0, 0, 0);
        for (&p, &t) in self.samples.preds.iter().zip(&self.samples.targets) {
            match (p >= self.threshold, t >= 0.5) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => {}
            }
        }
        f1(tp, fp, fn_)
    }

    fn reset(&mut self) {
        self.samples.clear();
    }

    fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("num_samples".to_string(), json!(self.num_samples()));
        state.insert("threshold".to_string(), json!(self.threshold));
        state
    }
}

/// Maximum F1 over every candidate threshold.
#[derive(Debug, Clone, Default)]
pub struct F1Max {
    samples: Samples,
}

impl Metric for F1Max {
    fn name(&self) -> &'static str {
        "F1Max"
    }

    fn update(&mut self, preds: &[f32], targets: &[f32]) {
        self.samples.extend(preds, targets);
    }

    fn compute(&self) -> f64 {
        best_f1_threshold(&self.samples.preds, &self.samples.targets).map_or(0.0, |(_, score)| score)
    }

    fn reset(&mut self) {
        self.samples.clear();
    }

    fn num_samples(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f1_score_at_threshold() {
        let mut m = F1Score::default();
        m.update(&[0.9, 0.6, 0.4, 0.1], &[1.0, 0.0, 1.0, 0.0]);
        // tp=1 fp=1 fn=1
        assert!((m.compute() - 0.5).abs() < 1e-9);

        m.set_threshold(0.3);
        // tp=2 fp=1 fn=0
        assert!((m.compute() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_f1_max_ignores_threshold() {
        let mut m = F1Max::default();
        m.update(&[0.9, 0.6, 0.4, 0.1], &[1.0, 0.0, 1.0, 0.0]);
        assert!((m.compute() - 0.8).abs() < 1e-9);
        m.reset();
        assert_eq!(m.num_samples(), 0);
        assert_eq!(m.compute(), 0.0);
    }
}
