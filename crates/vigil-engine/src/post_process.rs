//! Turning raw step outputs into decisions.
//!
//! Validation fits the unit's thresholds and normalization statistics on raw
//! scores. Every evaluated output is then normalized and thresholded, and
//! pixel-level tasks also get binary masks (plus boxes for detection).

use crate::error::EngineResult;
use tracing::debug;
use vigil_core::batch::{ANOMALY_MAPS, LABEL, MASK, PRED_BOXES, PRED_LABELS, PRED_MASKS, PRED_SCORES};
use vigil_core::{BatchExt, StepOutput, TaskType, Tensor, UnitState};

/// Threshold applied once scores are min-max normalized.
pub const NORMALIZED_THRESHOLD: f32 = 0.5;

/// Re-estimates thresholds and normalization statistics from `outputs`.
pub fn fit_components(state: &mut UnitState, outputs: &[StepOutput], task: TaskType) -> EngineResult<()> {
    if let Some(threshold) = state.image_threshold.as_deref_mut() {
        threshold.reset();
    }
    if let Some(threshold) = state.pixel_threshold.as_deref_mut() {
        threshold.reset();
    }
    if let Some(normalizer) = state.normalization_metrics.as_deref_mut() {
        normalizer.reset();
    }

    for output in outputs {
        let scores = output.tensor(PRED_SCORES)?;
        if let (Some(threshold), Ok(labels)) = (state.image_threshold.as_deref_mut(), output.tensor(LABEL)) {
            threshold.update(&scores.data, &labels.data);
        }
        if let Some(normalizer) = state.normalization_metrics.as_deref_mut() {
            normalizer.update(&scores.data);
        }

        if !task.is_pixel_level() {
            continue;
        }
        if let Ok(maps) = output.tensor(ANOMALY_MAPS) {
            if let (Some(threshold), Ok(masks)) = (state.pixel_threshold.as_deref_mut(), output.tensor(MASK)) {
                threshold.update(&maps.data, &masks.data);
            }
            if let Some(normalizer) = state.normalization_metrics.as_deref_mut() {
                normalizer.update(&maps.data);
            }
        }
    }

    let image = state.image_threshold.as_deref_mut().map(|t| t.compute());
    let pixel = state.pixel_threshold.as_deref_mut().map(|t| t.compute());
    debug!(?image, ?pixel, "Computed adaptive thresholds");
    Ok(())
}

/// Threshold values that apply to post-processed outputs as `(image, pixel)`.
#[must_use]
pub fn effective_thresholds(state: &UnitState) -> (f32, f32) {
    if state.normalization_metrics.is_some() {
        return (NORMALIZED_THRESHOLD, NORMALIZED_THRESHOLD);
    }
    let image = state.image_threshold.as_deref().map_or(NORMALIZED_THRESHOLD, |t| t.value());
    let pixel = state.pixel_threshold.as_deref().map_or(image, |t| t.value());
    (image, pixel)
}

/// Normalizes scores and maps, then attaches labels, masks and boxes.
pub fn apply(state: &UnitState, output: &mut StepOutput, task: TaskType) -> EngineResult<()> {
    let raw_image = state.image_threshold.as_deref().map_or(NORMALIZED_THRESHOLD, |t| t.value());
    let raw_pixel = state.pixel_threshold.as_deref().map_or(raw_image, |t| t.value());

    if let Some(normalizer) = state.normalization_metrics.as_deref() {
        let mut scores = output.tensor(PRED_SCORES)?.clone();
        scores.data.iter_mut().for_each(|s| *s = normalizer.normalize(*s, raw_image));
        output.set_tensor(PRED_SCORES, scores);

        if let Ok(maps) = output.tensor(ANOMALY_MAPS) {
            let mut maps = maps.clone();
            maps.data.iter_mut().for_each(|v| *v = normalizer.normalize(*v, raw_pixel));
            output.set_tensor(ANOMALY_MAPS, maps);
        }
    }

    let (image_threshold, pixel_threshold) = effective_thresholds(state);
    let labels = binarize(output.tensor(PRED_SCORES)?, image_threshold);
    output.set_tensor(PRED_LABELS, labels);

    if task.is_pixel_level()
        && let Ok(maps) = output.tensor(ANOMALY_MAPS)
    {
        let masks = binarize(maps, pixel_threshold);
        if task == TaskType::Detection {
            output.set_tensor(PRED_BOXES, boxes(&masks)?);
        }
        output.set_tensor(PRED_MASKS, masks);
    }
    Ok(())
}

fn binarize(tensor: &Tensor, threshold: f32) -> Tensor {
    Tensor {
        shape: tensor.shape.clone(),
        data: tensor.data.iter().map(|&v| if v >= threshold { 1.0 } else { 0.0 }).collect(),
    }
}

/// Bounding boxes of the 4-connected regions of `[B, H, W]` masks, as
/// `[N, 5]` rows of `(batch_index, x1, y1, x2, y2)` with inclusive corners.
pub fn boxes(masks: &Tensor) -> EngineResult<Tensor> {
    let &[b, h, w] = masks.shape.as_slice() else {
        return Err(vigil_core::UnitError::Shape(format!("masks must be [B, H, W], got {:?}", masks.shape)).into());
    };
    let mut rows = Vec::new();
    for i in 0..b {
        let mask = masks.row(i)?;
        let mut seen = vec![false; h * w];
        for start in 0..h * w {
            if mask[start] < 0.5 || seen[start] {
                continue;
            }
            let (mut x1, mut y1, mut x2, mut y2) = (w, h, 0, 0);
            let mut stack = vec![start];
            seen[start] = true;
            while let Some(p) = stack.pop() {
                let (y, x) = (p / w, p % w);
                x1 = x1.min(x);
                y1 = y1.min(y);
                x2 = x2.max(x);
                y2 = y2.max(y);
                let neighbours = [
                    (y > 0).then(|| p - w),
                    (y + 1 < h).then(|| p + w),
                    (x > 0).then(|| p - 1),
                    (x + 1 < w).then(|| p + 1),
                ];
                for q in neighbours.into_iter().flatten() {
                    if !seen[q] && mask[q] >= 0.5 {
                        seen[q] = true;
                        stack.push(q);
                    }
                }
            }
            rows.push(vec![i as f32, x1 as f32, y1 as f32, x2 as f32, y2 as f32]);
        }
    }
    Ok(Tensor::stack(&[5], &rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{F1AdaptiveThreshold, ManualThreshold, MinMax};

    fn output(scores: Vec<f32>, labels: Vec<f32>, maps: Tensor) -> StepOutput {
        let mut out = StepOutput::new();
        out.set_tensor(PRED_SCORES, Tensor::scalar_vec(scores));
        out.set_tensor(LABEL, Tensor::scalar_vec(labels));
        out.set_tensor(ANOMALY_MAPS, maps);
        out
    }

    #[test]
    fn test_boxes_per_region() {
        #[rustfmt::skip]
        let mask = Tensor::new(vec![1, 3, 4], vec![
            1.0, 1.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 0.0, 1.0,
        ]).unwrap();
        let found = boxes(&mask).unwrap();
        assert_eq!(found.shape, vec![2, 5]);
        assert_eq!(found.row(0).unwrap(), &[0.0, 0.0, 0.0, 1.0, 1.0]);
        assert_eq!(found.row(1).unwrap(), &[0.0, 3.0, 1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_fit_then_apply_separates_classes() {
        let mut state = UnitState::default();
        state.image_threshold = Some(Box::new(F1AdaptiveThreshold::default()));
        state.normalization_metrics = Some(Box::new(MinMax::default()));

        let maps = Tensor::zeros(vec![4, 1, 1]);
        let outputs = vec![output(vec![1.0, 2.0, 8.0, 9.0], vec![0.0, 0.0, 1.0, 1.0], maps)];
        fit_components(&mut state, &outputs, TaskType::Classification).unwrap();

        let mut out = outputs[0].clone();
        apply(&state, &mut out, TaskType::Classification).unwrap();
        assert_eq!(out.tensor(PRED_LABELS).unwrap().data, vec![0.0, 0.0, 1.0, 1.0]);
        assert!(out.tensor(PRED_SCORES).unwrap().data.iter().all(|s| (0.0..=1.0).contains(s)));
        assert!(out.get(PRED_MASKS).is_none());
    }

    #[test]
    fn test_detection_gets_masks_and_boxes() {
        let mut state = UnitState::default();
        state.image_threshold = Some(Box::new(ManualThreshold::new(0.5)));
        state.pixel_threshold = Some(Box::new(ManualThreshold::new(0.5)));

        let maps = Tensor::new(vec![1, 2, 2], vec![0.9, 0.0, 0.0, 0.0]).unwrap();
        let mut out = output(vec![0.9], vec![1.0], maps);
        apply(&state, &mut out, TaskType::Detection).unwrap();
        assert_eq!(out.tensor(PRED_MASKS).unwrap().data, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(out.tensor(PRED_BOXES).unwrap().data, vec![0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(effective_thresholds(&state), (0.5, 0.5));
    }
}
