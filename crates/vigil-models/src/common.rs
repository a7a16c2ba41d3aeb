//! Helpers shared by the model implementations.

use vigil_core::batch::{ANOMALY_MAPS, IMAGE, PRED_SCORES};
use vigil_core::state::tensor_value;
use vigil_core::{
    Batch, BatchExt, F1AdaptiveThreshold, MinMax, StateDict, StateDictExt, Tensor, UnitError, UnitResult,
    UnitState,
};

/// Unit state with the default post-processing components.
pub(crate) fn default_unit_state(model_name: &str) -> UnitState {
    let mut state = UnitState::new(model_name);
    state.image_threshold = Some(Box::new(F1AdaptiveThreshold::default()));
    state.pixel_threshold = Some(Box::new(F1AdaptiveThreshold::default()));
    state.normalization_metrics = Some(Box::new(MinMax::default()));
    state
}

/// Image batch viewed as `(images, height, width)`; `image` must be `[B, H, W]`.
pub(crate) fn images(batch: &Batch) -> UnitResult<(Vec<&[f32]>, usize, usize)> {
    let tensor = batch.tensor(IMAGE)?;
    if tensor.dims() != 3 {
        return Err(UnitError::Shape(format!("expected image batch [B, H, W], got {:?}", tensor.shape)));
    }
    let (h, w) = (tensor.shape[1], tensor.shape[2]);
    let rows = (0..tensor.batch_len()).map(|i| tensor.row(i)).collect::<UnitResult<Vec<_>>>()?;
    Ok((rows, h, w))
}

/// Returns `batch` with `anomaly_maps` `[B, H, W]` and `pred_scores` `[B]` attached.
pub(crate) fn with_predictions(
    batch: &Batch,
    maps: &[Vec<f32>],
    height: usize,
    width: usize,
    scores: Vec<f32>,
) -> UnitResult<Batch> {
    let mut out = batch.clone();
    out.set_tensor(ANOMALY_MAPS, Tensor::stack(&[height, width], maps)?);
    out.set_tensor(PRED_SCORES, Tensor::scalar_vec(scores));
    Ok(out)
}

pub(crate) fn max_of(values: &[f32]) -> f32 {
    values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

pub(crate) fn not_fitted(model: &str) -> UnitError {
    UnitError::State(format!("{model} has not been fitted; run fit or load a checkpoint"))
}

/// Stores an optional fitted tensor; unfitted models store nothing.
pub(crate) fn insert_tensor(state: &mut StateDict, key: &str, tensor: Option<&Tensor>) -> UnitResult<()> {
    if let Some(t) = tensor {
        state.insert(key.to_string(), tensor_value(t)?);
    }
    Ok(())
}

pub(crate) fn optional_tensor(state: &StateDict, key: &str) -> UnitResult<Option<Tensor>> {
    if state.contains_key(key) { state.get_tensor(key).map(Some) } else { Ok(None) }
}

/// Rejects keys a model does not know when loading strictly.
pub(crate) fn check_known_keys(state: &StateDict, known: &[&str], strict: bool) -> UnitResult<()> {
    if !strict {
        return Ok(());
    }
    let unexpected: Vec<String> = state
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .map(|k| format!("model.{k}"))
        .collect();
    if unexpected.is_empty() { Ok(()) } else { Err(UnitError::UnexpectedKeys(unexpected)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_images_requires_rank_three() {
        let mut batch = Batch::new();
        batch.set_tensor(IMAGE, Tensor::zeros(vec![2, 4]));
        assert!(matches!(images(&batch), Err(UnitError::Shape(_))));

        batch.set_tensor(IMAGE, Tensor::zeros(vec![2, 3, 4]));
        let (rows, h, w) = images(&batch).unwrap();
        assert_eq!((rows.len(), h, w), (2, 3, 4));
    }

    #[test]
    fn test_check_known_keys() {
        let mut state = StateDict::new();
        state.insert("mean".to_string(), serde_json::json!(0));
        state.insert("extra".to_string(), serde_json::json!(0));
        assert!(check_known_keys(&state, &["mean"], false).is_ok());
        let err = check_known_keys(&state, &["mean"], true).unwrap_err();
        assert!(matches!(err, UnitError::UnexpectedKeys(keys) if keys == vec!["model.extra".to_string()]));
    }
}
