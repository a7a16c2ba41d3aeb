//! Per-pixel Gaussian model.
//!
//! Fits an independent mean and variance to every pixel of the normal
//! training images. The anomaly map is the absolute z-score and the image
//! score is the map maximum.

use crate::common::{
    check_known_keys, default_unit_state, images, insert_tensor, max_of, not_fitted, optional_tensor,
    with_predictions,
};
use vigil_core::{
    AnomalyModule, Batch, LearningType, Model, StateDict, StepOutput, Tensor, TrainStepOutput,
    TrainerArguments, UnitError, UnitResult, UnitState,
};

pub const NAME: &str = "gaussian";

const MIN_VARIANCE: f32 = 1e-4;

#[derive(Debug, Default)]
pub struct GaussianModel {
    count: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    shape: Option<(usize, usize)>,
    mean: Option<Tensor>,
    variance: Option<Tensor>,
}

impl GaussianModel {
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        self.mean.is_some() && self.variance.is_some()
    }
}

impl Model for GaussianModel {
    fn forward(&self, batch: &Batch) -> UnitResult<Batch> {
        let (Some(mean), Some(variance)) = (&self.mean, &self.variance) else {
            return Err(not_fitted(NAME));
        };
        let (rows, h, w) = images(batch)?;
        if mean.shape != [h, w] {
            return Err(UnitError::Shape(format!("model fitted on {:?}, got images of [{h}, {w}]", mean.shape)));
        }

        let mut maps = Vec::with_capacity(rows.len());
        let mut scores = Vec::with_capacity(rows.len());
        for image in rows {
            let map: Vec<f32> = image
                .iter()
                .zip(&mean.data)
                .zip(&variance.data)
                .map(|((x, m), v)| (x - m).abs() / v.sqrt())
                .collect();
            scores.push(max_of(&map));
            maps.push(map);
        }
        with_predictions(batch, &maps, h, w, scores)
    }

    fn learn(&mut self, batch: &Batch) -> UnitResult<Option<f32>> {
        let (rows, h, w) = images(batch)?;
        if let Some(shape) = self.shape
            && shape != (h, w)
        {
            return Err(UnitError::Shape(format!("training images changed size from {shape:?} to ({h}, {w})")));
        }
        self.shape = Some((h, w));
        if self.sum.len() != h * w {
            self.sum = vec![0.0; h * w];
            self.sum_sq = vec![0.0; h * w];
        }
        for image in rows {
            for (i, &x) in image.iter().enumerate() {
                self.sum[i] += f64::from(x);
                self.sum_sq[i] += f64::from(x) * f64::from(x);
            }
            self.count += 1;
        }
        Ok(None)
    }

    fn finish_epoch(&mut self) -> UnitResult<()> {
        let (Some((h, w)), true) = (self.shape, self.count > 0) else {
            return Err(UnitError::State("gaussian model saw no training images".to_string()));
        };
        let n = self.count as f64;
        let mut mean = Vec::with_capacity(h * w);
        let mut variance = Vec::with_capacity(h * w);
        for (s, sq) in self.sum.iter().zip(&self.sum_sq) {
            let m = s / n;
            mean.push(m as f32);
            variance.push(((sq / n - m * m) as f32).max(MIN_VARIANCE));
        }
        self.mean = Some(Tensor::new(vec![h, w], mean)?);
        self.variance = Some(Tensor::new(vec![h, w], variance)?);
        self.count = 0;
        self.sum.iter_mut().for_each(|v| *v = 0.0);
        self.sum_sq.iter_mut().for_each(|v| *v = 0.0);
        Ok(())
    }

    fn state_dict(&self) -> UnitResult<StateDict> {
        let mut state = StateDict::new();
        insert_tensor(&mut state, "mean", self.mean.as_ref())?;
        insert_tensor(&mut state, "variance", self.variance.as_ref())?;
        Ok(state)
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> UnitResult<()> {
        check_known_keys(&state, &["mean", "variance"], strict)?;
        self.mean = optional_tensor(&state, "mean")?;
        self.variance = optional_tensor(&state, "variance")?;
        self.shape = match self.mean.as_ref().map(|m| m.shape.as_slice()) {
            Some(&[h, w]) => Some((h, w)),
            Some(other) => return Err(UnitError::Shape(format!("gaussian mean must be [H, W], got {other:?}"))),
            None => None,
        };
        if let (Some(mean), Some(variance)) = (&self.mean, &self.variance)
            && mean.shape != variance.shape
        {
            return Err(UnitError::Shape(format!(
                "gaussian variance {:?} does not match mean {:?}",
                variance.shape, mean.shape
            )));
        }
        Ok(())
    }
}

/// Training unit wrapping [`GaussianModel`].
#[derive(Debug)]
pub struct Gaussian {
    state: UnitState,
}

impl Gaussian {
    #[must_use]
    pub fn new() -> Self {
        let mut state = default_unit_state(NAME);
        state.model = Some(Box::new(GaussianModel::default()));
        Self { state }
    }
}

impl Default for Gaussian {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyModule for Gaussian {
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
