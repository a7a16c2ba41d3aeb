//! Persisted state mapping shared by units, components and checkpoints.

use crate::batch::Tensor;
use crate::error::{UnitError, UnitResult};
use serde_json::Value;
use std::collections::BTreeMap;

pub const IMAGE_THRESHOLD_CLASS: &str = "image_threshold_class";
pub const PIXEL_THRESHOLD_CLASS: &str = "pixel_threshold_class";
pub const NORMALIZATION_CLASS: &str = "normalization_class";

pub type StateDict = BTreeMap<String, Value>;

/// Prefix-scoped helpers over a [`StateDict`].
pub trait StateDictExt {
    /// Entries under `prefix.` with the prefix stripped.
    fn with_prefix(&self, prefix: &str) -> StateDict;

    /// Removes and returns entries under `prefix.`, prefix stripped.
    fn take_prefixed(&mut self, prefix: &str) -> StateDict;

    fn insert_prefixed(&mut self, prefix: &str, sub: StateDict);

    fn get_f32(&self, key: &str) -> UnitResult<f32>;

    fn get_tensor(&self, key: &str) -> UnitResult<Tensor>;
}

impl StateDictExt for StateDict {
    fn with_prefix(&self, prefix: &str) -> StateDict {
        let dotted = format!("{prefix}.");
        self.iter()
            .filter_map(|(k, v)| k.strip_prefix(&dotted).map(|rest| (rest.to_string(), v.clone())))
            .collect()
    }

    fn take_prefixed(&mut self, prefix: &str) -> StateDict {
        let dotted = format!("{prefix}.");
        let keys: Vec<String> = self.keys().filter(|k| k.starts_with(&dotted)).cloned().collect();
        let mut out = StateDict::new();
        for key in keys {
            if let Some(value) = self.remove(&key) {
                out.insert(key[dotted.len()..].to_string(), value);
            }
        }
        out
    }

    fn insert_prefixed(&mut self, prefix: &str, sub: StateDict) {
        for (k, v) in sub {
            self.insert(format!("{prefix}.{k}"), v);
        }
    }

    fn get_f32(&self, key: &str) -> UnitResult<f32> {
        self.get(key)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .ok_or_else(|| UnitError::State(format!("missing numeric entry `{key}`")))
    }

    fn get_tensor(&self, key: &str) -> UnitResult<Tensor> {
        let value = self
            .get(key)
            .ok_or_else(|| UnitError::State(format!("missing tensor entry `{key}`")))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Serializes a tensor into a state value.
pub fn tensor_value(tensor: &Tensor) -> UnitResult<Value> {
    Ok(serde_json::to_value(tensor)?)
}
