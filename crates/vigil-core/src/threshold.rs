//! Threshold components turning continuous scores into binary decisions.

use crate::error::UnitResult;
use crate::metrics::curve::best_f1_threshold;
use crate::state::{StateDict, StateDictExt};
use serde_json::json;

const DEFAULT_THRESHOLD: f32 = 0.5;

pub trait Threshold: std::fmt::Debug + Send + Sync {
    /// Stable identifier recorded in checkpoints.
    fn type_path(&self) -> &'static str;

    fn update(&mut self, preds: &[f32], targets: &[f32]);

    /// Recomputes the threshold from accumulated data and returns it.
    fn compute(&mut self) -> f32;

    fn value(&self) -> f32;

    fn reset(&mut self);

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("value".to_string(), json!(self.value()));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> UnitResult<()>;
}

/// Picks the threshold that maximizes F1 over the observed scores.
#[derive(Debug, Clone)]
pub struct F1AdaptiveThreshold {
    value: f32,
    preds: Vec<f32>,
    targets: Vec<f32>,
}

impl F1AdaptiveThreshold {
    pub const TYPE_PATH: &'static str = "vigil_core.threshold.F1AdaptiveThreshold";
}

impl Default for F1AdaptiveThreshold {
    fn default() -> Self {
        Self { value: DEFAULT_THRESHOLD, preds: Vec::new(), targets: Vec::new() }
    }
}

impl Threshold for F1AdaptiveThreshold {
    fn type_path(&self) -> &'static str {
        Self::TYPE_PATH
    }

    fn update(&mut self, preds: &[f32], targets: &[f32]) {
        let n = preds.len().min(targets.len());
        self.preds.extend_from_slice(&preds[..n]);
        self.targets.extend_from_slice(&targets[..n]);
    }

    fn compute(&mut self) -> f32 {
        if self.preds.is_empty() {
            return self.value;
        }
        if !self.targets.iter().any(|t| *t >= 0.5) {
            // Only normal samples: anything above the highest normal score is anomalous.
            self.value = self.preds.iter().copied().fold(f32::MIN, f32::max);
            return self.value;
        }
        if let Some((threshold, _)) = best_f1_threshold(&self.preds, &self.targets) {
            self.value = threshold;
        }
        self.value
    }

    fn value(&self) -> f32 {
        self.value
    }

    fn reset(&mut self) {
        self.preds.clear();
        self.targets.clear();
    }

    fn load_state_dict(&mut self, state: &StateDict) -> UnitResult<()> {
        self.value = state.get_f32("value")?;
        Ok(())
    }
}

/// Fixed threshold value.
#[derive(Debug, Clone)]
pub struct ManualThreshold {
    value: f32,
}

impl ManualThreshold {
    pub const TYPE_PATH: &'static str = "vigil_core.threshold.ManualThreshold";

    #[must_use]
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl Default for ManualThreshold {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl Threshold for ManualThreshold {
    fn type_path(&self) -> &'static str {
        Self::TYPE_PATH
    }

    fn update(&mut self, _preds: &[f32], _targets: &[f32]) {}

    fn compute(&mut self) -> f32 {
        self.value
    }

    fn value(&self) -> f32 {
        self.value
    }

    fn reset(&mut self) {}

    fn load_state_dict(&mut self, state: &StateDict) -> UnitResult<()> {
        self.value = state.get_f32("value")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_threshold_separates_classes() {
        let mut t = F1AdaptiveThreshold::default();
        t.update(&[0.1, 0.2, 0.3], &[0.0, 0.0, 0.0]);
        t.update(&[0.8, 0.9], &[1.0, 1.0]);
        let value = t.compute();
        assert!(value > 0.3 && value <= 0.8, "threshold {value} should separate the classes");
    }

    #[test]
    fn test_adaptive_threshold_without_data_keeps_default() {
        let mut t = F1AdaptiveThreshold::default();
        assert!((t.compute() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_adaptive_threshold_normal_only_uses_max() {
        let mut t = F1AdaptiveThreshold::default();
        t.update(&[0.1, 0.7, 0.4], &[0.0, 0.0, 0.0]);
        assert!((t.compute() - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_threshold_state_roundtrip() {
        let mut saved = ManualThreshold::new(0.25);
        saved.update(&[1.0], &[1.0]);
        let mut restored = ManualThreshold::default();
        restored.load_state_dict(&saved.state_dict()).unwrap();
        assert!((restored.value() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_adaptive_threshold_ignores_unpaired_scores() {
        let mut t = F1AdaptiveThreshold::default();
        t.update(&[0.1, 0.2, 0.9, 0.95], &[0.0, 0.0]);
        t.update(&[0.8], &[1.0]);
        assert_eq!(t.preds.len(), t.targets.len());
        assert_eq!(t.preds, vec![0.1, 0.2, 0.8]);
        let value = t.compute();
        assert!(value > 0.2 && value <= 0.8, "threshold {value} should separate the classes");
    }
}
