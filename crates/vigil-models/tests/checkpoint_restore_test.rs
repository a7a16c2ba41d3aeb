use tempfile::TempDir;
use vigil_core::batch::{IMAGE, PRED_SCORES};
use vigil_core::{AnomalyModule, Batch, BatchExt, Checkpoint, Tensor};
use vigil_models::{get_model, ModelArgs};

fn image_batch(seed: usize, count: usize) -> Batch {
    let rows: Vec<Vec<f32>> = (0..count)
        .map(|i| (0..64).map(|p| ((p * 31 + i * 17 + seed * 7) % 23) as f32 / 46.0 + 0.25).collect())
        .collect();
    let mut batch = Batch::new();
    batch.set_tensor(IMAGE, Tensor::stack(&[8, 8], &rows).unwrap());
    batch
}

fn trained(name: &str, args: &ModelArgs) -> Box<dyn AnomalyModule> {
    let mut unit = get_model(name, args).unwrap();
    unit.training_step(&image_batch(0, 4), 0).unwrap();
    unit.training_step(&image_batch(1, 4), 1).unwrap();
    unit.on_train_epoch_end().unwrap();
    unit
}

#[test]
fn test_image_models_restore_from_checkpoint() {
    let args = ModelArgs::default().with_input_size(8, 8).with_n_pca_components(2);
    let temp = TempDir::new().unwrap();

    for name in ["gaussian", "memory_bank", "pca_density"] {
        let unit = trained(name, &args);
        let path = temp.path().join(format!("{name}.ckpt"));
        Checkpoint::capture(unit.as_ref(), 0, 2).unwrap().save(&path).unwrap();

        let mut restored = get_model(name, &args).unwrap();
        let checkpoint = Checkpoint::load(&path).unwrap();
        assert_eq!(checkpoint.model_name, name);
        restored.load_state_dict(checkpoint.state_dict, true).unwrap();

        let expected = unit.test_step(image_batch(9, 2), 0).unwrap();
        let actual = restored.test_step(image_batch(9, 2), 0).unwrap();
        assert_eq!(
            expected.tensor(PRED_SCORES).unwrap(),
            actual.tensor(PRED_SCORES).unwrap(),
            "{name} scores differ after restore"
        );
    }
}

#[test]
fn test_unfitted_model_state_is_loadable() {
    let args = ModelArgs::default().with_input_size(8, 8).with_n_pca_components(2);
    for name in vigil_models::get_available_models() {
        let unit = get_model(name, &args).unwrap();
        let state = unit.state_dict().unwrap();
        let mut fresh = get_model(name, &args).unwrap();
        fresh.load_state_dict(state, true).unwrap();
        assert!(fresh.test_step(image_batch(0, 1), 0).is_err());
    }
}
