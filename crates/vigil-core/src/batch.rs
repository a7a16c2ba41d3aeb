//! Batch and tensor types passed through the step functions.

use crate::error::{UnitError, UnitResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const IMAGE: &str = "image";
pub const LABEL: &str = "label";
pub const MASK: &str = "mask";
pub const IMAGE_PATH: &str = "image_path";
pub const VIDEO_PATH: &str = "video_path";
pub const ANOMALY_MAPS: &str = "anomaly_maps";
pub const PRED_SCORES: &str = "pred_scores";
pub const PRED_LABELS: &str = "pred_labels";
pub const PRED_MASKS: &str = "pred_masks";
pub const PRED_BOXES: &str = "pred_boxes";

/// Dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> UnitResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(UnitError::Shape(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self { shape, data: vec![0.0; n] }
    }

    /// One-dimensional tensor over `values`.
    #[must_use]
    pub fn scalar_vec(values: Vec<f32>) -> Self {
        Self { shape: vec![values.len()], data: values }
    }

    #[must_use]
    pub fn dims(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<f32> {
        self.data.get(idx).copied()
    }

    /// Leading dimension (batch size); 0 for a rank-0 tensor.
    #[must_use]
    pub fn batch_len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Slice of the `i`-th entry along the leading dimension.
    pub fn row(&self, i: usize) -> UnitResult<&[f32]> {
        let rows = self.batch_len();
        if i >= rows {
            return Err(UnitError::Shape(format!("row {i} out of range for {rows} rows")));
        }
        let stride = self.data.len() / rows;
        Ok(&self.data[i * stride..(i + 1) * stride])
    }

    /// Stack equally-shaped rows under a new leading dimension.
    pub fn stack(inner_shape: &[usize], rows: &[Vec<f32>]) -> UnitResult<Self> {
        let mut shape = Vec::with_capacity(inner_shape.len() + 1);
        shape.push(rows.len());
        shape.extend_from_slice(inner_shape);
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        Self::new(shape, data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchValue {
    Tensor(Tensor),
    Text(Vec<String>),
}

impl From<Tensor> for BatchValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<Vec<String>> for BatchValue {
    fn from(v: Vec<String>) -> Self {
        Self::Text(v)
    }
}

/// A batch keyed by string; step outputs use the same shape.
pub type Batch = BTreeMap<String, BatchValue>;

pub type StepOutput = Batch;

/// Typed access to batch entries.
pub trait BatchExt {
    fn tensor(&self, key: &str) -> UnitResult<&Tensor>;
    fn text(&self, key: &str) -> UnitResult<&[String]>;
    fn set_tensor(&mut self, key: &str, tensor: Tensor);
}

impl BatchExt for Batch {
    fn tensor(&self, key: &str) -> UnitResult<&Tensor> {
        match self.get(key) {
            Some(BatchValue::Tensor(t)) => Ok(t),
            _ => Err(UnitError::MissingBatchKey(key.to_string())),
        }
    }

    fn text(&self, key: &str) -> UnitResult<&[String]> {
        match self.get(key) {
            Some(BatchValue::Text(t)) => Ok(t),
            _ => Err(UnitError::MissingBatchKey(key.to_string())),
        }
    }

    fn set_tensor(&mut self, key: &str, tensor: Tensor) {
        self.insert(key.to_string(), BatchValue::Tensor(tensor));
    }
}
