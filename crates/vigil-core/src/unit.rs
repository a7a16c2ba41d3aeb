//! Base contract for anomaly-detection training units.
//!
//! A unit owns a model plus the components needed to turn raw anomaly
//! scores into decisions and metrics. Every slot starts empty; concrete
//! units fill them in their constructors, or they are restored lazily from
//! a checkpoint in [`AnomalyModule::load_state_dict`].
//!
//! Evaluation converges on one routine: `test_step` calls `predict_step`,
//! which calls `validation_step`.

use crate::batch::{Batch, StepOutput};
use crate::callback::Callback;
use crate::error::{UnitError, UnitResult};
use crate::metrics::MetricCollection;
use crate::normalization::Normalizer;
use crate::registry::{self, Registry};
use crate::state::{
    StateDict, StateDictExt, IMAGE_THRESHOLD_CLASS, NORMALIZATION_CLASS, PIXEL_THRESHOLD_CLASS,
};
use crate::threshold::Threshold;
use crate::types::{LearningType, TrainerArguments};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, info};

const IMAGE_THRESHOLD_KEY: &str = "image_threshold";
const PIXEL_THRESHOLD_KEY: &str = "pixel_threshold";
const NORMALIZATION_KEY: &str = "normalization_metrics";
const MODEL_KEY: &str = "model";

/// The learnable function wrapped by a unit.
pub trait Model: std::fmt::Debug + Send {
    fn forward(&self, batch: &Batch) -> UnitResult<Batch>;

    /// Consumes one training batch; returns a loss when the model has one.
    fn learn(&mut self, _batch: &Batch) -> UnitResult<Option<f32>> {
        Ok(None)
    }

    /// Called once all training batches of an epoch were seen.
    fn finish_epoch(&mut self) -> UnitResult<()> {
        Ok(())
    }

    fn state_dict(&self) -> UnitResult<StateDict>;

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> UnitResult<()>;
}

pub trait Loss: std::fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn compute(&self, batch: &Batch, output: &Batch) -> UnitResult<f32>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainStepOutput {
    pub loss: Option<f32>,
}

/// Declared attributes of a unit. Presence is explicit.
#[derive(Debug, Default)]
pub struct UnitState {
    pub model: Option<Box<dyn Model>>,
    pub loss: Option<Box<dyn Loss>>,
    pub callbacks: Vec<Box<dyn Callback>>,

    pub image_threshold: Option<Box<dyn Threshold>>,
    pub pixel_threshold: Option<Box<dyn Threshold>>,

    pub normalization_metrics: Option<Box<dyn Normalizer>>,

    pub image_metrics: Option<MetricCollection>,
    pub pixel_metrics: Option<MetricCollection>,
}

impl UnitState {
    pub fn new(model_name: &str) -> Self {
        info!("Initializing {} model.", model_name);
        Self::default()
    }

    pub fn model(&self) -> UnitResult<&dyn Model> {
        self.model.as_deref().ok_or(UnitError::MissingAttribute("model"))
    }

    pub fn model_mut(&mut self) -> UnitResult<&mut (dyn Model + 'static)> {
        self.model.as_deref_mut().ok_or(UnitError::MissingAttribute("model"))
    }

    fn metrics_slot(&mut self, name: &str) -> &mut Option<MetricCollection> {
        if name == "pixel" {
            &mut self.pixel_metrics
        } else {
            &mut self.image_metrics
        }
    }
}

/// Contract every anomaly model implements.
pub trait AnomalyModule: Send {
    /// Registry name of the concrete model.
    fn name(&self) -> &str;

    fn state(&self) -> &UnitState;

    fn state_mut(&mut self) -> &mut UnitState;

    /// Constructor arguments, stored alongside checkpoints.
    fn hyperparameters(&self) -> Value {
        json!({})
    }

    /// Runs the wrapped model on `batch`.
    fn forward(&self, batch: &Batch) -> UnitResult<Batch> {
        self.state().model()?.forward(batch)
    }

    fn training_step(&mut self, _batch: &Batch, _batch_idx: usize) -> UnitResult<TrainStepOutput> {
        Err(UnitError::NotImplemented("training_step"))
    }

    fn on_train_epoch_end(&mut self) -> UnitResult<()> {
        Ok(())
    }

    /// Scores `batch`; the returned batch carries the prediction keys.
    fn validation_step(&self, _batch: Batch, _batch_idx: usize) -> UnitResult<StepOutput> {
        Err(UnitError::NotImplemented("validation_step"))
    }

    fn predict_step(&self, batch: Batch, batch_idx: usize, _dataloader_idx: usize) -> UnitResult<StepOutput> {
        self.validation_step(batch, batch_idx)
    }

    fn test_step(&self, batch: Batch, batch_idx: usize) -> UnitResult<StepOutput> {
        self.predict_step(batch, batch_idx, 0)
    }

    /// Engine settings this model needs to train correctly.
    fn trainer_arguments(&self) -> UnitResult<TrainerArguments> {
        Err(UnitError::NotImplemented("trainer_arguments"))
    }

    fn learning_type(&self) -> UnitResult<LearningType> {
        Err(UnitError::NotImplemented("learning_type"))
    }

    fn state_dict(&self) -> UnitResult<StateDict> {
        save_state(self.state())
    }

    fn load_state_dict(&mut self, state: StateDict, strict: bool) -> UnitResult<()> {
        load_state(self.state_mut(), state, strict)
    }
}

/// Serializes `unit`: component type paths, component values, metric
/// entries, then the model's own parameters under `model.`.
pub fn save_state(unit: &UnitState) -> UnitResult<StateDict> {
    let mut dest = StateDict::new();

    if let Some(threshold) = &unit.image_threshold {
        dest.insert(IMAGE_THRESHOLD_CLASS.to_string(), json!(threshold.type_path()));
        dest.insert_prefixed(IMAGE_THRESHOLD_KEY, threshold.state_dict());
    }
    if let Some(threshold) = &unit.pixel_threshold {
        dest.insert(PIXEL_THRESHOLD_CLASS.to_string(), json!(threshold.type_path()));
        dest.insert_prefixed(PIXEL_THRESHOLD_KEY, threshold.state_dict());
    }
    if let Some(normalizer) = &unit.normalization_metrics {
        dest.insert(NORMALIZATION_CLASS.to_string(), json!(normalizer.type_path()));
        dest.insert_prefixed(NORMALIZATION_KEY, normalizer.state_dict());
    }

    for collection in [&unit.image_metrics, &unit.pixel_metrics].into_iter().flatten() {
        dest.extend(collection.state_dict());
    }

    if let Some(model) = &unit.model {
        dest.insert_prefixed(MODEL_KEY, model.state_dict()?);
    }

    Ok(dest)
}

/// Restores `unit` from `state`, rebuilding components through the registries.
pub fn load_state(unit: &mut UnitState, mut state: StateDict, strict: bool) -> UnitResult<()> {
    if let Some(threshold) = take_instance(&mut state, IMAGE_THRESHOLD_CLASS, registry::thresholds())? {
        unit.image_threshold = Some(threshold);
    }
    if let Some(threshold) = take_instance(&mut state, PIXEL_THRESHOLD_CLASS, registry::thresholds())? {
        unit.pixel_threshold = Some(threshold);
    }
    if let Some(normalizer) = take_instance(&mut state, NORMALIZATION_CLASS, registry::normalizers())? {
        unit.normalization_metrics = Some(normalizer);
    }

    if let Some(threshold) = unit.image_threshold.as_deref_mut() {
        let values = state.take_prefixed(IMAGE_THRESHOLD_KEY);
        if !values.is_empty() {
            threshold.load_state_dict(&values)?;
        }
    }
    if let Some(threshold) = unit.pixel_threshold.as_deref_mut() {
        let values = state.take_prefixed(PIXEL_THRESHOLD_KEY);
        if !values.is_empty() {
            threshold.load_state_dict(&values)?;
        }
    }
    if let Some(normalizer) = unit.normalization_metrics.as_deref_mut() {
        let values = state.take_prefixed(NORMALIZATION_KEY);
        if !values.is_empty() {
            normalizer.load_state_dict(&values)?;
        }
    }

    load_metrics(unit, &mut state)?;

    // Without a model, its keys stay behind and count as unexpected.
    if let Some(model) = unit.model.as_deref_mut() {
        model.load_state_dict(state.take_prefixed(MODEL_KEY), strict)?;
    }

    if strict && !state.is_empty() {
        return Err(UnitError::UnexpectedKeys(state.into_keys().collect()));
    }
    Ok(())
}

fn take_instance<T: ?Sized>(
    state: &mut StateDict,
    key: &str,
    registry: &Registry<T>,
) -> UnitResult<Option<Box<T>>> {
    let Some(value) = state.remove(key) else {
        return Ok(None);
    };
    let path = value
        .as_str()
        .ok_or_else(|| UnitError::State(format!("`{key}` must be a type path string")))?;
    debug!(key, class = path, "Restoring component from state dict");
    registry.create(path).map(Some).map_err(|e| UnitError::import(path, e))
}

fn load_metrics(unit: &mut UnitState, state: &mut StateDict) -> UnitResult<()> {
    add_metrics(unit, "pixel", state)?;
    add_metrics(unit, "image", state)
}

/// Rebuilds the `{name}_metrics` collection from the class names embedded
/// in its keys (`{name}_metrics.<Class>.<field>`).
fn add_metrics(unit: &mut UnitState, name: &str, state: &mut StateDict) -> UnitResult<()> {
    let prefix = format!("{name}_metrics");
    let metric_keys: Vec<String> = state.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
    if metric_keys.is_empty() {
        return Ok(());
    }

    let mut class_names = BTreeSet::new();
    for key in &metric_keys {
        let class_name = key
            .split('.')
            .nth(1)
            .ok_or_else(|| UnitError::State(format!("metric key `{key}` has no class name")))?;
        class_names.insert(class_name.to_string());
    }

    let metrics = unit.metrics_slot(name).get_or_insert_with(|| MetricCollection::new(name));
    for class_name in class_names {
        let metric = registry::metrics()
            .create(&class_name)
            .map_err(|e| UnitError::import(class_name.as_str(), e))?;
        info!("Loading {} metrics from state dict", class_name);
        metrics.add_metrics(metric);
    }

    for key in metric_keys {
        state.remove(&key);
    }
    Ok(())
}
