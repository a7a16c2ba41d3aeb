//! Frame-difference video model.
//!
//! Learns how much each pixel normally changes between consecutive frames.
//! A clip's map is the largest standardized change seen at each pixel.

use crate::common::{
    check_known_keys, default_unit_state, insert_tensor, max_of, not_fitted, optional_tensor, with_predictions,
};
use vigil_core::batch::IMAGE;
use vigil_core::{
    AnomalyModule, Batch, BatchExt, LearningType, Model, StateDict, StepOutput, Tensor, TrainStepOutput,
    TrainerArguments, UnitError, UnitResult, UnitState,
};

pub const NAME: &str = "frame_diff";

const MIN_STD: f32 = 1e-2;

/// Clip batch `[B, T, H, W]` as per-clip frame lists.
fn clips(batch: &Batch) -> UnitResult<(Vec<Vec<&[f32]>>, usize, usize)> {
    let tensor = batch.tensor(IMAGE)?;
    let &[b, t, h, w] = tensor.shape.as_slice() else {
        return Err(UnitError::Shape(format!("expected clip batch [B, T, H, W], got {:?}", tensor.shape)));
    };
    if t < 2 {
        return Err(UnitError::Shape(format!("clips need at least two frames, got {t}")));
    }
    let frame = h * w;
    if frame == 0 {
        return Err(UnitError::Shape("clip frames are empty".to_string()));
    }
    if tensor.data.len() != b * t * frame {
        return Err(UnitError::Shape(format!(
            "clip batch {:?} needs {} values, got {}",
            tensor.shape,
            b * t * frame,
            tensor.data.len()
        )));
    }
    let clips: Vec<Vec<&[f32]>> = (0..b)
        .map(|i| tensor.data[i * t * frame..(i + 1) * t * frame].chunks(frame).collect::<Vec<_>>())
        .collect();
    Ok((clips, h, w))
}

/// Absolute change per pixel between every pair of consecutive frames.
fn frame_diffs<'a>(frames: &'a [&'a [f32]]) -> impl Iterator<Item = Vec<f32>> + 'a {
    frames.windows(2).map(|pair| pair[0].iter().zip(pair[1]).map(|(a, b)| (b - a).abs()).collect::<Vec<f32>>())
}

#[derive(Debug, Default)]
pub struct FrameDiffModel {
    count: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    mean: Option<Tensor>,
    std: Option<Tensor>,
}

impl Model for FrameDiffModel {
    fn forward(&self, batch: &Batch) -> UnitResult<Batch> {
        let (Some(mean), Some(std)) = (&self.mean, &self.std) else {
            return Err(not_fitted(NAME));
        };
        let (clips, h, w) = clips(batch)?;
        if mean.numel() != h * w {
            return Err(UnitError::Shape(format!("{NAME} was fitted on {} pixels, got ({h}, {w})", mean.numel())));
        }

        let mut maps = Vec::with_capacity(clips.len());
        let mut scores = Vec::with_capacity(clips.len());
        for frames in clips {
            let mut map = vec![0.0_f32; h * w];
            for diff in frame_diffs(&frames) {
                for (((cell, d), m), s) in map.iter_mut().zip(&diff).zip(&mean.data).zip(&std.data) {
                    *cell = cell.max(((d - m) / s).max(0.0));
                }
            }
            scores.push(max_of(&map));
            maps.push(map);
        }
        with_predictions(batch, &maps, h, w, scores)
    }

    fn learn(&mut self, batch: &Batch) -> UnitResult<Option<f32>> {
        let (clips, h, w) = clips(batch)?;
        if self.sum.is_empty() {
            self.sum = vec![0.0; h * w];
            self.sum_sq = vec![0.0; h * w];
        } else if self.sum.len() != h * w {
            return Err(UnitError::Shape(format!("training clips changed frame size to ({h}, {w})")));
        }
        for frames in clips {
            for diff in frame_diffs(&frames) {
                for (i, d) in diff.into_iter().enumerate() {
                    self.sum[i] += f64::from(d);
                    self.sum_sq[i] += f64::from(d) * f64::from(d);
                }
                self.count += 1;
            }
        }
        Ok(None)
    }

    fn finish_epoch(&mut self) -> UnitResult<()> {
        if self.count == 0 {
            return Err(UnitError::State(format!("{NAME} saw no training clips")));
        }
        let n = self.count as f64;
        let (mean, std): (Vec<f32>, Vec<f32>) = self
            .sum
            .iter()
            .zip(&self.sum_sq)
            .map(|(s, sq)| {
                let m = s / n;
                (m as f32, ((sq / n - m * m).max(0.0).sqrt() as f32).max(MIN_STD))
            })
            .unzip();
        let len = mean.len();
        self.mean = Some(Tensor::new(vec![len], mean)?);
        self.std = Some(Tensor::new(vec![len], std)?);
        self.count = 0;
        self.sum.clear();
        self.sum_sq.clear();
        Ok(())
    }

    fn state_dict(&self) -> UnitResult<StateDict> {
        let mut state = StateDict::new();
        insert_tensor(&mut state, "mean", self.mean.as_ref())?;
        insert_tensor(&mut state, "std", self.std.as_ref())?;
        Ok(state)
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> UnitResult<()> {
        check_known_keys(&state, &["mean", "std"], strict)?;
        self.mean = optional_tensor(&state, "mean")?;
        self.std = optional_tensor(&state, "std")?;
        Ok(())
    }
}

/// Training unit wrapping [`FrameDiffModel`].
#[derive(Debug)]
pub struct FrameDiff {
    state: UnitState,
}

impl FrameDiff {
    #[must_use]
    pub fn new() -> Self {
        let mut state = default_unit_state(NAME);
        state.model = Some(Box::new(FrameDiffModel::default()));
        Self { state }
    }
}

impl Default for FrameDiff {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyModule for FrameDiff {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> &UnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UnitState {
        &mut self.state
    }

    fn training_step(&mut self, batch: &Batch, _batch_idx: usize) -> UnitResult<TrainStepOutput> {
        let loss = self.state.model_mut()?.learn(batch)?;
        Ok(TrainStepOutput { loss })
    }

    fn on_train_epoch_end(&mut self) -> UnitResult<()> {
        self.state.model_mut()?.finish_epoch()
    }

    fn validation_step(&self, batch: Batch, _batch_idx: usize) -> UnitResult<StepOutput> {
        self.forward(&batch)
    }

    fn trainer_arguments(&self) -> UnitResult<TrainerArguments> {
        Ok(TrainerArguments::single_epoch())
    }

    fn learning_type(&self) -> UnitResult<LearningType> {
        Ok(LearningType::OneClass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::batch::{ANOMALY_MAPS, PRED_SCORES};

    fn clip_batch(clips: &[Vec<f32>], frames: usize, h: usize, w: usize) -> Batch {
        let mut batch = Batch::new();
        batch.set_tensor(IMAGE, Tensor::stack(&[frames, h, w], clips).unwrap());
        batch
    }

    #[test]
    fn test_rejects_single_frame_clips() {
        let mut unit = FrameDiff::new();
        let err = unit.training_step(&clip_batch(&[vec![0.0; 4]], 1, 2, 2), 0).unwrap_err();
        assert!(matches!(err, UnitError::Shape(_)));

        let mut batch = Batch::new();
        batch.set_tensor(IMAGE, Tensor::zeros(vec![1, 2, 2]));
        assert!(unit.training_step(&batch, 0).is_err());
    }

    #[test]
    fn test_sudden_change_is_localized() {
        let mut unit = FrameDiff::new();
        let still = vec![0.5; 3 * 4];
        unit.training_step(&clip_batch(&[still.clone(), still.clone()], 3, 2, 2), 0).unwrap();
        unit.on_train_epoch_end().unwrap();

        let mut flash = still.clone();
        flash[2 * 4 + 1] = 1.0;
        let out = unit.validation_step(clip_batch(&[still, flash], 3, 2, 2), 0).unwrap();

        let scores = &out.tensor(PRED_SCORES).unwrap().data;
        assert_eq!(scores[0], 0.0);
        assert!(scores[1] > 10.0);
        let map = out.tensor(ANOMALY_MAPS).unwrap();
        assert_eq!(map.shape, vec![2, 2, 2]);
        assert_eq!(map.row(1).unwrap()[0], 0.0);
    }

    #[test]
    fn test_rejects_data_shorter_than_shape() {
        let mut unit = FrameDiff::new();
        let mut batch = Batch::new();
        batch.set_tensor(IMAGE, Tensor { shape: vec![1, 2, 2, 2], data: vec![0.0; 4] });
        let err = unit.training_step(&batch, 0).unwrap_err();
        assert!(matches!(err, UnitError::Shape(_)), "{err}");
    }
}
