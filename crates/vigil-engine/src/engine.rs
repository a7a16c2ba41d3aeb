//! The engine drives a unit through training, evaluation and export.
//!
//! Every entry point optionally restores a checkpoint first. Evaluation
//! stages share one routine: run the unit's step, post-process the outputs,
//! then update the image and pixel metric collections.

use crate::config::EngineConfig;
use crate::datamodule::DataModule;
use crate::error::{EngineError, EngineResult};
use crate::export::{ExportBundle, ExportType, EXPORT_FORMAT_VERSION};
use crate::layout::EngineLayout;
use crate::post_process;
use crate::progress::{ProgressEvent, ProgressSink, RunId, TracingProgressSink};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vigil_core::batch::{ANOMALY_MAPS, IMAGE, LABEL, MASK, PRED_SCORES};
use vigil_core::{
    AnomalyModule, Batch, BatchExt, Callback, CallbackContext, Checkpoint, MetricCollection, Stage, StateDictExt,
    StepOutput, TaskType, Tensor, TrainerArguments, UnitError,
};

pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy)]
enum Hook {
    FitStart,
    TrainEpochEnd,
    ValidationEnd,
    FitEnd,
    TestEnd,
}

impl Hook {
    fn call(
        self,
        callback: &mut dyn Callback,
        ctx: &CallbackContext,
        unit: &dyn AnomalyModule,
    ) -> vigil_core::UnitResult<()> {
        match self {
            Self::FitStart => callback.on_fit_start(ctx, unit),
            Self::TrainEpochEnd => callback.on_train_epoch_end(ctx, unit),
            Self::ValidationEnd => callback.on_validation_end(ctx, unit),
            Self::FitEnd => callback.on_fit_end(ctx, unit),
            Self::TestEnd => callback.on_test_end(ctx, unit),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    callbacks: Vec<Box<dyn Callback>>,
    progress: Arc<dyn ProgressSink>,
    cancel: Arc<AtomicBool>,
    run_id: RunId,
    epoch: u32,
    global_step: u64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .field("run_id", &self.run_id)
            .field("epoch", &self.epoch)
            .field("global_step", &self.global_step)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
            progress: Arc::new(TracingProgressSink),
            cancel: Arc::new(AtomicBool::new(false)),
            run_id: RunId::new(),
            epoch: 0,
            global_step: 0,
        }
    }

    #[must_use]
    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Shares `flag` as the cancellation signal; setting it stops the run
    /// before the next batch.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> EngineLayout {
        EngineLayout::new(self.config.default_root_dir.clone())
    }

    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Trains `model` and validates it once training ends.
    pub fn fit(&mut self, model: &mut dyn AnomalyModule, datamodule: &mut dyn DataModule) -> EngineResult<Metrics> {
        datamodule.setup()?;
        let task = self.resolve_task(datamodule);
        let overrides = match model.trainer_arguments() {
            Ok(args) => args,
            Err(UnitError::NotImplemented(_)) => {
                warn!(model = model.name(), "Model declares no trainer arguments; using engine config");
                TrainerArguments::default()
            }
            Err(e) => return Err(e.into()),
        };
        let limits = self.config.limits(&overrides);
        info!(
            model = model.name(),
            datamodule = datamodule.name(),
            %task,
            max_epochs = limits.max_epochs,
            max_steps = ?limits.max_steps,
            "Starting fit"
        );
        self.setup_metrics(model, task)?;
        self.progress.on_event(ProgressEvent::Started { run_id: self.run_id.clone(), stage: Stage::Fit });
        self.run_hooks(model, Hook::FitStart, Stage::Fit, Metrics::new())?;

        let train = datamodule.train_batches()?;
        let total = u64::try_from(train.len()).ok().map(|n| n * u64::from(limits.max_epochs));
        let mut metrics = Metrics::new();
        for epoch in 0..limits.max_epochs {
            self.epoch = epoch;
            let mut budget_spent = false;
            for (batch_idx, batch) in train.iter().enumerate() {
                self.check_cancelled()?;
                if limits.max_steps.is_some_and(|max| self.global_step >= max) {
                    budget_spent = true;
                    break;
                }
                let out = model.training_step(batch, batch_idx)?;
                self.global_step += 1;
                if let Some(loss) = out.loss {
                    debug!(epoch, step = self.global_step, loss, "train step");
                }
                self.progress.on_event(ProgressEvent::Step {
                    run_id: self.run_id.clone(),
                    stage: Stage::Fit,
                    step: self.global_step,
                    total,
                });
            }
            model.on_train_epoch_end()?;
            self.run_hooks(model, Hook::TrainEpochEnd, Stage::Fit, Metrics::new())?;

            let (_, val_metrics) = self.evaluate(model, datamodule.val_batches()?, Stage::Validate, task)?;
            self.run_hooks(model, Hook::ValidationEnd, Stage::Fit, val_metrics.clone())?;
            metrics = val_metrics;
            if budget_spent {
                info!(step = self.global_step, "Reached max_steps");
                break;
            }
        }

        self.run_hooks(model, Hook::FitEnd, Stage::Fit, metrics.clone())?;
        self.progress.on_event(ProgressEvent::Finished { run_id: self.run_id.clone(), stage: Stage::Fit });
        Ok(metrics)
    }

    /// Validates on the validation split, refitting thresholds and normalization.
    pub fn validate(
        &mut self,
        model: &mut dyn AnomalyModule,
        datamodule: &mut dyn DataModule,
        ckpt_path: Option<&Path>,
    ) -> EngineResult<Metrics> {
        self.prepare(model, datamodule, ckpt_path)?;
        let task = self.resolve_task(datamodule);
        self.setup_metrics(model, task)?;
        let (_, metrics) = self.evaluate(model, datamodule.val_batches()?, Stage::Validate, task)?;
        self.run_hooks(model, Hook::ValidationEnd, Stage::Validate, metrics.clone())?;
        log_metrics(Stage::Validate, &metrics);
        Ok(metrics)
    }

    /// Evaluates on the test split with the unit's current post-processing.
    pub fn test(
        &mut self,
        model: &mut dyn AnomalyModule,
        datamodule: &mut dyn DataModule,
        ckpt_path: Option<&Path>,
    ) -> EngineResult<Metrics> {
        self.prepare(model, datamodule, ckpt_path)?;
        let task = self.resolve_task(datamodule);
        self.setup_metrics(model, task)?;
        let (_, metrics) = self.evaluate(model, datamodule.test_batches()?, Stage::Test, task)?;
        self.run_hooks(model, Hook::TestEnd, Stage::Test, metrics.clone())?;
        log_metrics(Stage::Test, &metrics);
        Ok(metrics)
    }

    /// Fits, then tests.
    pub fn train(
        &mut self,
        model: &mut dyn AnomalyModule,
        datamodule: &mut dyn DataModule,
        ckpt_path: Option<&Path>,
    ) -> EngineResult<Metrics> {
        self.prepare(model, datamodule, ckpt_path)?;
        self.fit(model, datamodule)?;
        self.test(model, datamodule, None)
    }

    /// Scores the predict split; outputs carry normalized scores and labels.
    pub fn predict(
        &mut self,
        model: &mut dyn AnomalyModule,
        datamodule: &mut dyn DataModule,
        ckpt_path: Option<&Path>,
    ) -> EngineResult<Vec<StepOutput>> {
        self.prepare(model, datamodule, ckpt_path)?;
        let task = self.resolve_task(datamodule);
        let (outputs, _) = self.evaluate(model, datamodule.predict_batches()?, Stage::Predict, task)?;
        info!(batches = outputs.len(), "Prediction finished");
        Ok(outputs)
    }

    /// Writes an [`ExportBundle`] to `<root>/weights/<format>/model.<ext>`.
    ///
    /// The model is run once on a blank batch of `input_size` (defaulting to
    /// the data module's image size) to check it accepts that shape.
    pub fn export(
        &mut self,
        model: &mut dyn AnomalyModule,
        datamodule: &mut dyn DataModule,
        ckpt_path: Option<&Path>,
        export_type: ExportType,
        input_size: Option<(usize, usize)>,
    ) -> EngineResult<PathBuf> {
        if datamodule.is_video() {
            return Err(EngineError::Export("Export fails for video models.".to_string()));
        }
        self.prepare(model, datamodule, ckpt_path)?;
        let input_size = input_size
            .or_else(|| datamodule.image_size())
            .ok_or_else(|| EngineError::Export("input size is unknown; pass one explicitly".to_string()))?;

        let (h, w) = input_size;
        let mut probe = Batch::new();
        probe.set_tensor(IMAGE, Tensor::zeros(vec![1, h, w]));
        model
            .forward(&probe)
            .map_err(|e| EngineError::Export(format!("{} rejects input size {input_size:?}: {e}", model.name())))?;

        let state = model.state();
        let bundle = ExportBundle {
            format_version: EXPORT_FORMAT_VERSION,
            created_at: Utc::now(),
            model_name: model.name().to_string(),
            task: self.resolve_task(datamodule),
            input_size,
            image_threshold: state.image_threshold.as_deref().map(|t| t.value()),
            pixel_threshold: state.pixel_threshold.as_deref().map(|t| t.value()),
            normalization: state.normalization_metrics.as_deref().map(|n| n.state_dict()).unwrap_or_default(),
            state_dict: model.state_dict()?.with_prefix("model"),
        };
        let path = self.layout().export_path(export_type);
        bundle.write(&path, export_type)?;
        info!(path = %path.display(), format = %export_type, "Exported model");
        Ok(path)
    }

    fn prepare(
        &mut self,
        model: &mut dyn AnomalyModule,
        datamodule: &mut dyn DataModule,
        ckpt_path: Option<&Path>,
    ) -> EngineResult<()> {
        datamodule.setup()?;
        if let Some(path) = ckpt_path {
            self.load_checkpoint(model, path)?;
        }
        Ok(())
    }

    fn load_checkpoint(&mut self, model: &mut dyn AnomalyModule, path: &Path) -> EngineResult<()> {
        let checkpoint = Checkpoint::load(path)?;
        if checkpoint.model_name != model.name() {
            return Err(UnitError::State(format!(
                "checkpoint {} belongs to `{}`, not `{}`",
                path.display(),
                checkpoint.model_name,
                model.name()
            ))
            .into());
        }
        model.load_state_dict(checkpoint.state_dict, true)?;
        self.epoch = checkpoint.epoch;
        self.global_step = checkpoint.global_step;
        info!(path = %path.display(), step = self.global_step, "Restored checkpoint");
        Ok(())
    }

    fn resolve_task(&self, datamodule: &dyn DataModule) -> TaskType {
        let task = datamodule.task();
        if task != self.config.task {
            debug!(engine = %self.config.task, datamodule = %task, "Using the datamodule task");
        }
        task
    }

    /// Creates the metric collections a unit lacks; pixel metrics only for pixel-level tasks.
    fn setup_metrics(&self, model: &mut dyn AnomalyModule, task: TaskType) -> EngineResult<()> {
        let state = model.state_mut();
        if state.image_metrics.is_none() {
            state.image_metrics = Some(MetricCollection::from_names("image", &self.config.image_metrics)?);
        }
        if task.is_pixel_level() && state.pixel_metrics.is_none() && !self.config.pixel_metrics.is_empty() {
            state.pixel_metrics = Some(MetricCollection::from_names("pixel", &self.config.pixel_metrics)?);
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        model: &mut dyn AnomalyModule,
        batches: Vec<Batch>,
        stage: Stage,
        task: TaskType,
    ) -> EngineResult<(Vec<StepOutput>, Metrics)> {
        let total = u64::try_from(batches.len()).ok();
        let mut outputs = Vec::with_capacity(batches.len());
        for (batch_idx, batch) in batches.into_iter().enumerate() {
            self.check_cancelled()?;
            let output = match stage {
                Stage::Test => model.test_step(batch, batch_idx)?,
                Stage::Predict => model.predict_step(batch, batch_idx, 0)?,
                _ => model.validation_step(batch, batch_idx)?,
            };
            self.progress.on_event(ProgressEvent::Step {
                run_id: self.run_id.clone(),
                stage,
                step: batch_idx as u64 + 1,
                total,
            });
            outputs.push(output);
        }

        if stage == Stage::Validate {
            post_process::fit_components(model.state_mut(), &outputs, task)?;
        }
        for output in &mut outputs {
            post_process::apply(model.state(), output, task)?;
        }
        if stage == Stage::Predict {
            return Ok((outputs, Metrics::new()));
        }

        let (image_threshold, pixel_threshold) = post_process::effective_thresholds(model.state());
        let state = model.state_mut();
        let mut metrics = Metrics::new();
        if let Some(collection) = state.image_metrics.as_mut() {
            collection.reset();
            collection.set_threshold(image_threshold);
            for output in &outputs {
                if let (Ok(scores), Ok(labels)) = (output.tensor(PRED_SCORES), output.tensor(LABEL)) {
                    collection.update(&scores.data, &labels.data);
                }
            }
            metrics.extend(collection.compute());
        }
        if task.is_pixel_level()
            && let Some(collection) = state.pixel_metrics.as_mut()
        {
            collection.reset();
            collection.set_threshold(pixel_threshold);
            for output in &outputs {
                if let (Ok(maps), Ok(masks)) = (output.tensor(ANOMALY_MAPS), output.tensor(MASK)) {
                    collection.update(&maps.data, &masks.data);
                }
            }
            metrics.extend(collection.compute());
        }
        Ok((outputs, metrics))
    }

    fn run_hooks(
        &mut self,
        model: &mut dyn AnomalyModule,
        hook: Hook,
        stage: Stage,
        metrics: Metrics,
    ) -> EngineResult<()> {
        let ctx = CallbackContext { stage, epoch: self.epoch, global_step: self.global_step, metrics };
        // Unit callbacks are detached so they can observe the unit.
        let mut unit_callbacks = std::mem::take(&mut model.state_mut().callbacks);
        let mut result = Ok(());
        for callback in self.callbacks.iter_mut().chain(unit_callbacks.iter_mut()) {
            if let Err(e) = hook.call(callback.as_mut(), &ctx, &*model) {
                warn!(callback = callback.name(), ?hook, error = %e, "Callback failed");
                result = Err(e.into());
                break;
            }
        }
        model.state_mut().callbacks = unit_callbacks;
        result
    }

    fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            warn!(run_id = %self.run_id, "Cancellation requested");
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

fn log_metrics(stage: Stage, metrics: &Metrics) {
    for (name, value) in metrics {
        info!(?stage, metric = %name, value, "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::ModelCheckpoint;
    use crate::datamodule::{DataOptions, ImageFolder, VideoClips};
    use crate::progress::RecordingProgressSink;
    use crate::synthetic::{generate_image_folder, generate_video_clips, SyntheticSpec};
    use tempfile::TempDir;
    use vigil_core::batch::PRED_LABELS;
    use vigil_models::{get_model, ModelArgs};

    fn small_spec() -> SyntheticSpec {
        SyntheticSpec { image_size: (8, 8), n_train: 4, ..SyntheticSpec::default() }
    }

    fn folder(temp: &TempDir) -> ImageFolder {
        generate_image_folder(&temp.path().join("data"), &small_spec()).unwrap();
        let options = DataOptions { train_batch_size: 2, eval_batch_size: 4, ..DataOptions::default() };
        ImageFolder::new(&temp.path().join("data"), options)
    }

    fn engine(temp: &TempDir) -> Engine {
        let config = EngineConfig { default_root_dir: temp.path().join("results"), ..EngineConfig::default() };
        Engine::new(config)
    }

    #[test]
    fn test_fit_reports_metrics_and_counts_steps() {
        let temp = TempDir::new().unwrap();
        let mut datamodule = folder(&temp);
        let mut model = get_model("gaussian", &ModelArgs::default()).unwrap();
        let sink = Arc::new(RecordingProgressSink::default());
        let mut engine = engine(&temp).with_progress(sink.clone());

        let metrics = engine.fit(model.as_mut(), &mut datamodule).unwrap();
        assert!(metrics.contains_key("image_AUROC"));
        assert!(metrics.contains_key("pixel_F1Score"));
        assert_eq!(engine.global_step(), 2);
        assert!(model.state().image_metrics.is_some());

        let events = sink.events();
        assert!(matches!(events.first(), Some(ProgressEvent::Started { stage: Stage::Fit, .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::Finished { stage: Stage::Fit, .. })));
    }

    #[test]
    fn test_checkpoint_feeds_test_and_predict() {
        let temp = TempDir::new().unwrap();
        let mut datamodule = folder(&temp);
        let weights = temp.path().join("weights");
        let mut engine = engine(&temp).with_callback(ModelCheckpoint::new(&weights));

        let mut model = get_model("gaussian", &ModelArgs::default()).unwrap();
        engine.fit(model.as_mut(), &mut datamodule).unwrap();
        let ckpt = weights.join("last.ckpt");
        assert!(ckpt.exists());

        let mut restored = get_model("gaussian", &ModelArgs::default()).unwrap();
        let mut fresh_engine = Engine::new(engine.config().clone());
        let metrics = fresh_engine.test(restored.as_mut(), &mut datamodule, Some(&ckpt)).unwrap();
        assert!(metrics.contains_key("image_F1Score"));
        assert_eq!(fresh_engine.global_step(), 2);

        let outputs = fresh_engine.predict(restored.as_mut(), &mut datamodule, None).unwrap();
        let scores = outputs[0].tensor(PRED_SCORES).unwrap();
        assert!(scores.data.iter().all(|s| (0.0..=1.0).contains(s)));
        assert!(outputs[0].tensor(PRED_LABELS).is_ok());
    }

    #[test]
    fn test_checkpoint_of_another_model_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut datamodule = folder(&temp);
        let weights = temp.path().join("weights");
        let mut engine = engine(&temp).with_callback(ModelCheckpoint::new(&weights));
        let mut model = get_model("gaussian", &ModelArgs::default()).unwrap();
        engine.fit(model.as_mut(), &mut datamodule).unwrap();

        let mut other = get_model("pca_density", &ModelArgs::default().with_n_pca_components(2)).unwrap();
        let err = engine.test(other.as_mut(), &mut datamodule, Some(&weights.join("last.ckpt"))).unwrap_err();
        assert!(err.to_string().contains("belongs to `gaussian`"));
    }

    #[test]
    fn test_cancel_flag_stops_fit() {
        let temp = TempDir::new().unwrap();
        let mut datamodule = folder(&temp);
        let mut model = get_model("gaussian", &ModelArgs::default()).unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let mut engine = engine(&temp).with_cancel_flag(Arc::clone(&flag));

        let err = engine.fit(model.as_mut(), &mut datamodule).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(engine.global_step(), 0);
    }

    #[test]
    fn test_export_writes_bundle() {
        let temp = TempDir::new().unwrap();
        let mut datamodule = folder(&temp);
        let mut model = get_model("gaussian", &ModelArgs::default()).unwrap();
        let mut engine = engine(&temp);
        engine.fit(model.as_mut(), &mut datamodule).unwrap();

        let path = engine.export(model.as_mut(), &mut datamodule, None, ExportType::Json, None).unwrap();
        assert_eq!(path, temp.path().join("results/weights/json/model.json"));
        let bundle = ExportBundle::read(&path).unwrap();
        assert_eq!(bundle.model_name, "gaussian");
        assert_eq!(bundle.input_size, (8, 8));
        assert!(bundle.state_dict.contains_key("mean"));
        assert!(bundle.image_threshold.is_some());
    }

    #[test]
    fn test_export_rejects_wrong_input_size() {
        let temp = TempDir::new().unwrap();
        let mut datamodule = folder(&temp);
        let mut model = get_model("gaussian", &ModelArgs::default()).unwrap();
        let mut engine = engine(&temp);
        engine.fit(model.as_mut(), &mut datamodule).unwrap();

        let err = engine.export(model.as_mut(), &mut datamodule, None, ExportType::Toml, Some((5, 5)));
        assert!(matches!(err, Err(EngineError::Export(_))));
    }

    #[test]
    fn test_export_fails_for_video() {
        let temp = TempDir::new().unwrap();
        let spec = SyntheticSpec { n_train: 2, n_test_good: 2, n_test_defect: 2, ..small_spec() };
        generate_video_clips(temp.path(), &spec).unwrap();
        let mut datamodule = VideoClips::new(temp.path(), DataOptions::default());
        let mut model = get_model("frame_diff", &ModelArgs::default()).unwrap();

        let err = engine(&temp).export(model.as_mut(), &mut datamodule, None, ExportType::Json, None).unwrap_err();
        assert_eq!(err.to_string(), "export error: Export fails for video models.");
    }
}
