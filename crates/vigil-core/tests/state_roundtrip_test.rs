//! Save/load round trips of the training-unit state.

use serde_json::json;
use vigil_core::registry;
use vigil_core::{
    AnomalyModule, Batch, F1AdaptiveThreshold, ManualThreshold, MetricCollection, MinMax, Model,
    Normalizer, StateDict, StateDictExt, Threshold, UnitError, UnitResult, UnitState, AUPR, AUROC, F1Score,
};

#[derive(Debug, Default)]
struct ConstantModel {
    offset: f32,
}

impl Model for ConstantModel {
    fn forward(&self, batch: &Batch) -> UnitResult<Batch> {
        Ok(batch.clone())
    }

    fn state_dict(&self) -> UnitResult<StateDict> {
        let mut state = StateDict::new();
        state.insert("offset".to_string(), json!(self.offset));
        Ok(state)
    }

    fn load_state_dict(&mut self, state: StateDict, _strict: bool) -> UnitResult<()> {
        self.offset = state.get_f32("offset")?;
        Ok(())
    }
}

struct TestUnit {
    state: UnitState,
}

impl TestUnit {
    fn fresh() -> Self {
        let mut state = UnitState::new("test_unit");
        state.model = Some(Box::new(ConstantModel::default()));
        Self { state }
    }

    fn configured() -> Self {
        let mut unit = Self::fresh();
        unit.state.model = Some(Box::new(ConstantModel { offset: 2.5 }));

        let mut image_threshold = F1AdaptiveThreshold::default();
        image_threshold.update(&[0.1, 0.2, 0.9], &[0.0, 0.0, 1.0]);
        image_threshold.compute();
        unit.state.image_threshold = Some(Box::new(image_threshold));
        unit.state.pixel_threshold = Some(Box::new(ManualThreshold::new(0.3)));

        let mut normalizer = MinMax::default();
        normalizer.update(&[0.0, 4.0]);
        unit.state.normalization_metrics = Some(Box::new(normalizer));

        let mut image_metrics = MetricCollection::new("image");
        image_metrics.add_metrics(Box::new(AUROC::default()));
        image_metrics.add_metrics(Box::new(F1Score::default()));
        unit.state.image_metrics = Some(image_metrics);

        let mut pixel_metrics = MetricCollection::new("pixel");
        pixel_metrics.add_metrics(Box::new(AUPR::default()));
        unit.state.pixel_metrics = Some(pixel_metrics);
        unit
    }
}

impl AnomalyModule for TestUnit {
    fn name(&self) -> &str {
        "test_unit"
    }

    fn state(&self) -> &UnitState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut UnitState {
        &mut self.state
    }
}

#[test]
fn test_save_records_component_type_paths() {
    let state = TestUnit::configured().state_dict().unwrap();

    assert_eq!(state["image_threshold_class"], json!(F1AdaptiveThreshold::TYPE_PATH));
    assert_eq!(state["pixel_threshold_class"], json!(ManualThreshold::TYPE_PATH));
    assert_eq!(state["normalization_class"], json!(MinMax::TYPE_PATH));
    assert!(state.contains_key("image_metrics.AUROC.num_samples"));
    assert!(state.contains_key("pixel_metrics.AUPR.num_samples"));
    assert_eq!(state["model.offset"], json!(2.5));
}

#[test]
fn test_absent_components_are_not_recorded() {
    let state = TestUnit::fresh().state_dict().unwrap();
    assert!(!state.contains_key("image_threshold_class"));
    assert!(!state.contains_key("pixel_threshold_class"));
    assert!(!state.contains_key("normalization_class"));
    assert_eq!(state.keys().collect::<Vec<_>>(), vec!["model.offset"]);
}

#[test]
fn test_roundtrip_restores_component_types() {
    let saved = TestUnit::configured();
    let state = saved.state_dict().unwrap();

    let mut restored = TestUnit::fresh();
    restored.load_state_dict(state, true).unwrap();

    let s = restored.state();
    assert_eq!(s.image_threshold.as_ref().unwrap().type_path(), F1AdaptiveThreshold::TYPE_PATH);
    assert_eq!(s.pixel_threshold.as_ref().unwrap().type_path(), ManualThreshold::TYPE_PATH);
    assert_eq!(s.normalization_metrics.as_ref().unwrap().type_path(), MinMax::TYPE_PATH);

    let saved_value = saved.state().image_threshold.as_ref().unwrap().value();
    assert!((s.image_threshold.as_ref().unwrap().value() - saved_value).abs() < 1e-6);
    assert!((s.pixel_threshold.as_ref().unwrap().value() - 0.3).abs() < 1e-6);
    let normalizer = s.normalization_metrics.as_ref().unwrap();
    assert!((normalizer.normalize(2.0, 2.0) - 0.5).abs() < 1e-6);
}

#[test]
fn test_roundtrip_restores_metric_collections() {
    let state = TestUnit::configured().state_dict().unwrap();

    let mut restored = TestUnit::fresh();
    restored.load_state_dict(state, true).unwrap();

    let image = restored.state().image_metrics.as_ref().unwrap();
    assert_eq!(image.prefix(), "image");
    assert_eq!(image.names(), vec!["AUROC", "F1Score"]);

    let pixel = restored.state().pixel_metrics.as_ref().unwrap();
    assert_eq!(pixel.prefix(), "pixel");
    assert_eq!(pixel.names(), vec!["AUPR"]);
}

#[test]
fn test_load_extends_existing_collection_without_duplicates() {
    let state = TestUnit::configured().state_dict().unwrap();

    let mut restored = TestUnit::fresh();
    let mut existing = MetricCollection::new("image");
    existing.add_metrics(Box::new(AUROC::default()));
    restored.state_mut().image_metrics = Some(existing);
    restored.load_state_dict(state, true).unwrap();

    assert_eq!(restored.state().image_metrics.as_ref().unwrap().len(), 2);
}

#[test]
fn test_unknown_threshold_class_is_an_import_error() {
    let mut state = TestUnit::configured().state_dict().unwrap();
    state.insert("image_threshold_class".to_string(), json!("vigil_core.threshold.Missing"));

    let err = TestUnit::fresh().load_state_dict(state, true).unwrap_err();
    match err {
        UnitError::Import { class_name, .. } => assert_eq!(class_name, "vigil_core.threshold.Missing"),
        other => panic!("expected import error, got {other:?}"),
    }
}

#[test]
fn test_unknown_metric_class_is_an_import_error() {
    let mut state = StateDict::new();
    state.insert("pixel_metrics.PRO.num_samples".to_string(), json!(0));

    let err = TestUnit::fresh().load_state_dict(state, false).unwrap_err();
    assert!(matches!(err, UnitError::Import { ref class_name, .. } if class_name == "PRO"));
    assert_eq!(err.to_string(), "Class PRO not found in vigil_core.metrics");
    assert!(std::error::Error::source(&err).is_some());
}

#[test]
fn test_custom_registered_threshold_roundtrips() {
    #[derive(Debug, Default)]
    struct DoubledThreshold {
        value: f32,
    }

    impl Threshold for DoubledThreshold {
        fn type_path(&self) -> &'static str {
            "tests.DoubledThreshold"
        }

        fn update(&mut self, preds: &[f32], _targets: &[f32]) {
            self.value = preds.iter().copied().fold(0.0, f32::max) * 2.0;
        }

        fn compute(&mut self) -> f32 {
            self.value
        }

        fn value(&self) -> f32 {
            self.value
        }

        fn reset(&mut self) {}

        fn load_state_dict(&mut self, state: &StateDict) -> UnitResult<()> {
            self.value = state.get_f32("value")?;
            Ok(())
        }
    }

    registry::thresholds()
        .register("tests.DoubledThreshold", || Box::new(DoubledThreshold::default()) as Box<dyn Threshold>)
        .unwrap();

    let mut unit = TestUnit::fresh();
    let mut threshold = DoubledThreshold::default();
    threshold.update(&[0.5], &[1.0]);
    unit.state.image_threshold = Some(Box::new(threshold));

    let mut restored = TestUnit::fresh();
    restored.load_state_dict(unit.state_dict().unwrap(), true).unwrap();
    let restored_threshold = restored.state().image_threshold.as_ref().unwrap();
    assert_eq!(restored_threshold.type_path(), "tests.DoubledThreshold");
    assert!((restored_threshold.value() - 1.0).abs() < f32::EPSILON);
}
