//! Linear subspace model.
//!
//! Flattened normal images are projected onto their leading principal
//! directions, found by power iteration with deflation. Anything the
//! subspace cannot reconstruct is treated as anomalous: the map holds the
//! squared residual per pixel and the score is its mean.

use crate::common::{
    check_known_keys, default_unit_state, images, insert_tensor, not_fitted, optional_tensor, with_predictions,
};
use serde_json::{json, Value};
use tracing::{debug, warn};
use vigil_core::batch::ANOMALY_MAPS;
use vigil_core::{
    AnomalyModule, Batch, BatchExt, LearningType, Loss, Model, StateDict, StepOutput, Tensor, TrainStepOutput,
    TrainerArguments, UnitError, UnitResult, UnitState,
};

pub const NAME: &str = "pca_density";

const POWER_ITERATIONS: usize = 64;
const MIN_EIGENVALUE: f64 = 1e-9;

/// Mean squared reconstruction residual of a scored batch.
#[derive(Debug, Default)]
pub struct ReconstructionLoss;

impl Loss for ReconstructionLoss {
    fn name(&self) -> &'static str {
        "ReconstructionLoss"
    }

    fn compute(&self, _batch: &Batch, output: &Batch) -> UnitResult<f32> {
        let maps = output.tensor(ANOMALY_MAPS)?;
        if maps.numel() == 0 {
            return Ok(0.0);
        }
        Ok(maps.data.iter().sum::<f32>() / maps.numel() as f32)
    }
}

#[derive(Debug)]
pub struct PcaDensityModel {
    n_components: usize,
    samples: Vec<Vec<f32>>,
    shape: Option<(usize, usize)>,
    mean: Option<Tensor>,
    components: Option<Tensor>,
}

impl PcaDensityModel {
    pub fn new(n_components: usize) -> UnitResult<Self> {
        if n_components == 0 {
            return Err(UnitError::State("n_pca_components must be at least 1".to_string()));
        }
        Ok(Self { n_components, samples: Vec::new(), shape: None, mean: None, components: None })
    }

    #[must_use]
    pub fn is_fitted(&self) -> bool {
        self.mean.is_some()
    }

    /// Number of principal directions actually retained.
    #[must_use]
    pub fn fitted_components(&self) -> usize {
        self.components.as_ref().map_or(0, Tensor::batch_len)
    }

    fn fit(&mut self) -> UnitResult<()> {
        let Some((h, w)) = self.shape else {
            return Err(UnitError::State(format!("{NAME} saw no training images")));
        };
        let dim = h * w;
        let n = self.samples.len() as f64;

        let mut mean = vec![0.0_f64; dim];
        for sample in &self.samples {
            for (m, &x) in mean.iter_mut().zip(sample) {
                *m += f64::from(x) / n;
            }
        }
        let centered: Vec<Vec<f64>> = self
            .samples
            .iter()
            .map(|s| s.iter().zip(&mean).map(|(&x, m)| f64::from(x) - m).collect())
            .collect();

        let target = self.n_components.min(self.samples.len()).min(dim);
        let mut components: Vec<Vec<f64>> = Vec::with_capacity(target);
        for k in 0..target {
            match leading_direction(&centered, &components, dim, k) {
                Some(v) => components.push(v),
                None => {
                    debug!(found = k, requested = self.n_components, "Training data spans fewer directions");
                    break;
                }
            }
        }
        if components.len() < self.n_components {
            warn!(
                kept = components.len(),
                requested = self.n_components,
                "Fewer principal components than requested"
            );
        }

        self.mean = Some(Tensor::new(vec![dim], mean.iter().map(|&m| m as f32).collect())?);
        let rows: Vec<Vec<f32>> = components.iter().map(|c| c.iter().map(|&v| v as f32).collect()).collect();
        self.components = Some(Tensor::stack(&[dim], &rows)?);
        self.samples.clear();
        Ok(())
    }
}

/// Power iteration on `XᵀX`, orthogonalized against `found`.
fn leading_direction(data: &[Vec<f64>], found: &[Vec<f64>], dim: usize, seed: usize) -> Option<Vec<f64>> {
    let mut v: Vec<f64> = (0..dim).map(|i| 1.0 + ((i * 7 + seed * 13) % 11) as f64 / 11.0).collect();
    orthogonalize(&mut v, found);
    normalize(&mut v)?;

    let mut eigenvalue = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let mut next = vec![0.0_f64; dim];
        for row in data {
            let proj: f64 = row.iter().zip(&v).map(|(a, b)| a * b).sum();
            for (n, r) in next.iter_mut().zip(row) {
                *n += proj * r;
            }
        }
        orthogonalize(&mut next, found);
        eigenvalue = normalize(&mut next)?;
        v = next;
    }
    (eigenvalue > MIN_EIGENVALUE).then_some(v)
}

fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let dot: f64 = v.iter().zip(b).map(|(x, y)| x * y).sum();
        for (x, y) in v.iter_mut().zip(b) {
            *x -= dot * y;
        }
    }
}

/// Scales `v` to unit length, returning its previous norm.
fn normalize(v: &mut [f64]) -> Option<f64> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm <= MIN_EIGENVALUE {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(norm)
}

impl Model for PcaDensityModel {
    fn forward(&self, batch: &Batch) -> UnitResult<Batch> {
        let (Some(mean), Some(components)) = (&self.mean, &self.components) else {
            return Err(not_fitted(NAME));
        };
        let (rows, h, w) = images(batch)?;
        if mean.numel() != h * w {
            return Err(UnitError::Shape(format!(
                "{NAME} was fitted on {} pixels, got images of ({h}, {w})",
                mean.numel()
            )));
        }
        let basis = (0..components.batch_len()).map(|i| components.row(i)).collect::<UnitResult<Vec<_>>>()?;

        let mut maps = Vec::with_capacity(rows.len());
        let mut scores = Vec::with_capacity(rows.len());
        for image in rows {
            let mut residual: Vec<f32> = image.iter().zip(&mean.data).map(|(x, m)| x - m).collect();
            for direction in &basis {
                let coeff: f32 = residual.iter().zip(*direction).map(|(a, b)| a * b).sum();
                for (r, d) in residual.iter_mut().zip(*direction) {
                    *r -= coeff * d;
                }
            }
            let map: Vec<f32> = residual.iter().map(|r| r * r).collect();
            scores.push(map.iter().sum::<f32>() / map.len() as f32);
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
        self.samples.extend(rows.into_iter().map(<[f32]>::to_vec));
        Ok(None)
    }

    fn finish_epoch(&mut self) -> UnitResult<()> {
        self.fit()
    }

    fn state_dict(&self) -> UnitResult<StateDict> {
        let mut state = StateDict::new();
        state.insert("n_components".to_string(), json!(self.n_components));
        insert_tensor(&mut state, "mean", self.mean.as_ref())?;
        insert_tensor(&mut state, "components", self.components.as_ref())?;
        Ok(state)
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> UnitResult<()> {
        check_known_keys(&state, &["n_components", "mean", "components"], strict)?;
        self.mean = optional_tensor(&state, "mean")?;
        self.components = optional_tensor(&state, "components")?;
        if let (Some(mean), Some(components)) = (&self.mean, &self.components)
            && components.numel() > 0
            && components.shape.get(1) != Some(&mean.numel())
        {
            return Err(UnitError::Shape(format!(
                "components {:?} do not match mean of {} pixels",
                components.shape,
                mean.numel()
            )));
        }
        Ok(())
    }
}

/// Training unit wrapping [`PcaDensityModel`].
#[derive(Debug)]
pub struct PcaDensity {
    n_components: usize,
    state: UnitState,
}

impl PcaDensity {
    pub fn new(n_components: usize) -> UnitResult<Self> {
        let mut state = default_unit_state(NAME);
        state.model = Some(Box::new(PcaDensityModel::new(n_components)?));
        state.loss = Some(Box::new(ReconstructionLoss));
        Ok(Self { n_components, state })
    }
}

impl AnomalyModule for PcaDensity {
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
        json!({ "n_pca_components": self.n_components })
    }

    /// Collects the batch; once a subspace exists the reconstruction loss is reported too.
    fn training_step(&mut self, batch: &Batch, _batch_idx: usize) -> UnitResult<TrainStepOutput> {
        let loss = match (self.forward(batch), self.state.loss.as_deref()) {
            (Ok(output), Some(loss)) => Some(loss.compute(batch, &output)?),
            _ => None,
        };
        self.state.model_mut()?.learn(batch)?;
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
