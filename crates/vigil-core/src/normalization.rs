//! Score normalization fitted on validation outputs.

use crate::error::UnitResult;
use crate::state::{StateDict, StateDictExt};
use serde_json::json;

pub trait Normalizer: std::fmt::Debug + Send + Sync {
    fn type_path(&self) -> &'static str;

    fn update(&mut self, scores: &[f32]);

    /// Maps `value` into [0, 1] so that `threshold` lands on 0.5.
    fn normalize(&self, value: f32, threshold: f32) -> f32;

    fn reset(&mut self);

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> UnitResult<()>;
}

/// Min-max normalization over observed anomaly scores.
#[derive(Debug, Clone)]
pub struct MinMax {
    min: f32,
    max: f32,
}

impl MinMax {
    pub const TYPE_PATH: &'static str = "vigil_core.normalization.MinMax";

    #[must_use]
    pub fn min(&self) -> f32 {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> f32 {
        self.max
    }
}

impl Default for MinMax {
    fn default() -> Self {
        Self { min: f32::INFINITY, max: f32::NEG_INFINITY }
    }
}

impl Normalizer for MinMax {
    fn type_path(&self) -> &'static str {
        Self::TYPE_PATH
    }

    fn update(&mut self, scores: &[f32]) {
        for &s in scores {
            if s.is_finite() {
                self.min = self.min.min(s);
                self.max = self.max.max(s);
            }
        }
    }

    fn normalize(&self, value: f32, threshold: f32) -> f32 {
        let range = self.max - self.min;
        let range = if range.is_finite() && range > 0.0 { range } else { 1.0 };
        ((value - threshold) / range + 0.5).clamp(0.0, 1.0)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        // Unfitted bounds are stored as zero; JSON has no infinities.
        let (min, max) = if self.min <= self.max { (self.min, self.max) } else { (0.0, 0.0) };
        state.insert("min".to_string(), json!(min));
        state.insert("max".to_string(), json!(max));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> UnitResult<()> {
        self.min = state.get_f32("min")?;
        self.max = state.get_f32("max")?;
        Ok(())
    }
}
