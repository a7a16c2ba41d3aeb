//! Patch memory bank.
//!
//! Training stores overlapping `PATCH x PATCH` descriptors of the normal
//! images. At inference every patch is scored by its distance to the
//! nearest stored descriptor; a pixel takes the largest score of the
//! patches covering it.

use crate::common::{
    check_known_keys, default_unit_state, images, insert_tensor, max_of, not_fitted, optional_tensor,
    with_predictions,
};
use serde_json::{json, Value};
use tracing::debug;
use vigil_core::{
    AnomalyModule, Batch, LearningType, Model, StateDict, StepOutput, Tensor, TrainStepOutput,
    TrainerArguments, UnitError, UnitResult, UnitState,
};

pub const NAME: &str = "memory_bank";

const PATCH: usize = 4;
const STRIDE: usize = 2;
const MAX_BANK: usize = 4096;

#[derive(Debug)]
pub struct MemoryBankModel {
    input_size: (usize, usize),
    pending: Vec<Vec<f32>>,
    bank: Option<Tensor>,
}

impl MemoryBankModel {
    pub fn new(input_size: (usize, usize)) -> UnitResult<Self> {
        let (h, w) = input_size;
        if h < PATCH || w < PATCH {
            return Err(UnitError::Shape(format!("input size {input_size:?} is smaller than the {PATCH}x{PATCH} patch")));
        }
        Ok(Self { input_size, pending: Vec::new(), bank: None })
    }

    #[must_use]
    pub fn bank_len(&self) -> usize {
        self.bank.as_ref().map_or(0, Tensor::batch_len)
    }

    fn check_size(&self, h: usize, w: usize) -> UnitResult<()> {
        if (h, w) == self.input_size {
            Ok(())
        } else {
            Err(UnitError::Shape(format!(
                "{NAME} expects images of {:?}, got ({h}, {w})",
                self.input_size
            )))
        }
    }

    /// Top-left corners of every patch; the last row and column are always covered.
    fn origins(&self) -> Vec<(usize, usize)> {
        let (h, w) = self.input_size;
        let axis = |len: usize| {
            let mut starts: Vec<usize> = (0..=len - PATCH).step_by(STRIDE).collect();
            if starts.last() != Some(&(len - PATCH)) {
                starts.push(len - PATCH);
            }
            starts
        };
        let cols = axis(w);
        axis(h).into_iter().flat_map(|y| cols.iter().map(move |&x| (y, x))).collect()
    }

    fn patch(image: &[f32], width: usize, (y, x): (usize, usize)) -> Vec<f32> {
        (0..PATCH).flat_map(|dy| image[(y + dy) * width + x..(y + dy) * width + x + PATCH].iter().copied()).collect()
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl Model for MemoryBankModel {
    fn forward(&self, batch: &Batch) -> UnitResult<Batch> {
        let Some(bank) = &self.bank else {
            return Err(not_fitted(NAME));
        };
        let (rows, h, w) = images(batch)?;
        self.check_size(h, w)?;
        let stored = (0..bank.batch_len()).map(|i| bank.row(i)).collect::<UnitResult<Vec<_>>>()?;

        let origins = self.origins();
        let mut maps = Vec::with_capacity(rows.len());
        let mut scores = Vec::with_capacity(rows.len());
        for image in rows {
            let mut map = vec![0.0_f32; h * w];
            for &origin in &origins {
                let query = Self::patch(image, w, origin);
                let nearest = stored
                    .iter()
                    .map(|s| squared_distance(&query, s))
                    .fold(f32::INFINITY, f32::min)
                    .sqrt();
                let (y, x) = origin;
                for dy in 0..PATCH {
                    for cell in &mut map[(y + dy) * w + x..(y + dy) * w + x + PATCH] {
                        *cell = cell.max(nearest);
                    }
                }
            }
            scores.push(max_of(&map));
            maps.push(map);
        }
        with_predictions(batch, &maps, h, w, scores)
    }

    fn learn(&mut self, batch: &Batch) -> UnitResult<Option<f32>> {
        let (rows, h, w) = images(batch)?;
        self.check_size(h, w)?;
        let origins = self.origins();
        for image in rows {
            self.pending.extend(origins.iter().map(|&o| Self::patch(image, w, o)));
        }
        Ok(None)
    }

    fn finish_epoch(&mut self) -> UnitResult<()> {
        if self.pending.is_empty() {
            return Err(UnitError::State(format!("{NAME} saw no training images")));
        }
        let step = self.pending.len().div_ceil(MAX_BANK);
        let kept: Vec<Vec<f32>> = std::mem::take(&mut self.pending).into_iter().step_by(step).collect();
        debug!(patches = kept.len(), step, "Built memory bank");
        self.bank = Some(Tensor::stack(&[PATCH * PATCH], &kept)?);
        Ok(())
    }

    fn state_dict(&self) -> UnitResult<StateDict> {
        let mut state = StateDict::new();
        state.insert("input_size".to_string(), json!([self.input_size.0, self.input_size.1]));
        insert_tensor(&mut state, "bank", self.bank.as_ref())?;
        Ok(state)
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> UnitResult<()> {
        check_known_keys(&state, &["input_size", "bank"], strict)?;
        if let Some(size) = state.get("input_size") {
            let size: (usize, usize) = serde_json::from_value(size.clone())?;
            if size != self.input_size {
                return Err(UnitError::Shape(format!(
                    "checkpoint was trained on {size:?}, model configured for {:?}",
                    self.input_size
                )));
            }
        }
        self.bank = optional_tensor(&state, "bank")?;
        Ok(())
    }
}

/// Training unit wrapping [`MemoryBankModel`].
#[derive(Debug)]
pub struct MemoryBank {
    input_size: (usize, usize),
    state: UnitState,
}

impl MemoryBank {
    pub fn new(input_size: (usize, usize)) -> UnitResult<Self> {
        let mut state = default_unit_state(NAME);
        state.model = Some(Box::new(MemoryBankModel::new(input_size)?));
        Ok(Self { input_size, state })
    }
}

impl AnomalyModule for MemoryBank {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> &UnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UnitState {
        &mut self.state
    }

    fn hyperparameters(&self) -> Value {
        json!({ "input_size": [self.input_size.0, self.input_size.1] })
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
