//! Seeded dummy datasets in the `folder` and `clips` layouts.
//!
//! Normal samples are low-amplitude noise around a flat background. Defects
//! are bright squares with a matching ground-truth mask.

use crate::datamodule::{ClipSample, ImageSample, CLIP_FILE, GOOD_DIR};
use crate::error::{EngineError, EngineResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

const BACKGROUND: f32 = 0.3;
const NOISE: f32 = 0.05;
const DEFECT: f32 = 0.95;
const DEFECT_DIR: &str = "defect";

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpec {
    pub category: String,
    /// `(height, width)` of generated images and frames
    pub image_size: (usize, usize),
    pub n_train: usize,
    pub n_test_good: usize,
    pub n_test_defect: usize,
    /// Frames per clip in the `clips` layout
    pub frames: usize,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            category: "dummy".to_string(),
            image_size: (32, 32),
            n_train: 6,
            n_test_good: 4,
            n_test_defect: 4,
            frames: 4,
            seed: 42,
        }
    }
}

impl SyntheticSpec {
    fn validate(&self) -> EngineResult<()> {
        let (h, w) = self.image_size;
        if h < 4 || w < 4 {
            return Err(EngineError::Data(format!("synthetic images must be at least 4x4, got {h}x{w}")));
        }
        if self.n_train == 0 || self.n_test_good + self.n_test_defect == 0 {
            return Err(EngineError::Data("synthetic dataset needs train and test samples".to_string()));
        }
        if self.frames < 2 {
            return Err(EngineError::Data("synthetic clips need at least two frames".to_string()));
        }
        Ok(())
    }
}

fn noise_plane(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| BACKGROUND + rng.gen_range(-NOISE..NOISE)).collect()
}

/// Paints a random square onto `plane`, returning its mask.
fn paint_defect(rng: &mut StdRng, plane: &mut [f32], (h, w): (usize, usize)) -> Vec<f32> {
    let side = (h.min(w) / 4).max(2);
    let y0 = rng.gen_range(0..=h - side);
    let x0 = rng.gen_range(0..=w - side);
    let mut mask = vec![0.0; h * w];
    for y in y0..y0 + side {
        for x in x0..x0 + side {
            plane[y * w + x] = DEFECT;
            mask[y * w + x] = 1.0;
        }
    }
    mask
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec(value)?)?;
    Ok(())
}

/// Writes a `folder` dataset under `root/<category>`; returns the category dir.
pub fn generate_image_folder(root: &Path, spec: &SyntheticSpec) -> EngineResult<PathBuf> {
    spec.validate()?;
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let (h, w) = spec.image_size;
    let base = root.join(&spec.category);

    let image = |pixels: Vec<f32>, mask: Option<Vec<f32>>| ImageSample { width: w, height: h, pixels, mask };
    for i in 0..spec.n_train {
        let sample = image(noise_plane(&mut rng, h * w), None);
        write_json(&base.join("train").join(GOOD_DIR).join(format!("{i:03}.json")), &sample)?;
    }
    for i in 0..spec.n_test_good {
        let sample = image(noise_plane(&mut rng, h * w), Some(vec![0.0; h * w]));
        write_json(&base.join("test").join(GOOD_DIR).join(format!("{i:03}.json")), &sample)?;
    }
    for i in 0..spec.n_test_defect {
        let mut pixels = noise_plane(&mut rng, h * w);
        let mask = paint_defect(&mut rng, &mut pixels, spec.image_size);
        let sample = image(pixels, Some(mask));
        write_json(&base.join("test").join(DEFECT_DIR).join(format!("{i:03}.json")), &sample)?;
    }

    info!(root = %base.display(), train = spec.n_train, "Generated synthetic image folder");
    Ok(base)
}

/// Writes a `clips` dataset under `root/<category>`; returns the category dir.
///
/// In an abnormal clip the square appears halfway through and stays.
pub fn generate_video_clips(root: &Path, spec: &SyntheticSpec) -> EngineResult<PathBuf> {
    spec.validate()?;
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let (h, w) = spec.image_size;
    let base = root.join(&spec.category);

    let clip = |rng: &mut StdRng, abnormal: bool| {
        let mut frames: Vec<Vec<f32>> = (0..spec.frames).map(|_| noise_plane(rng, h * w)).collect();
        let mask = if abnormal {
            let onset = spec.frames / 2;
            let mut scratch = frames[onset].clone();
            let mask = paint_defect(rng, &mut scratch, spec.image_size);
            for frame in &mut frames[onset..] {
                for (v, m) in frame.iter_mut().zip(&mask) {
                    if *m > 0.5 {
                        *v = DEFECT;
                    }
                }
            }
            mask
        } else {
            vec![0.0; h * w]
        };
        ClipSample { width: w, height: h, frames, label: u8::from(abnormal), mask: Some(mask) }
    };

    for i in 0..spec.n_train {
        let mut sample = clip(&mut rng, false);
        sample.mask = None;
        write_json(&base.join("train").join(format!("clip_{i:03}")).join(CLIP_FILE), &sample)?;
    }
    for i in 0..spec.n_test_good + spec.n_test_defect {
        let sample = clip(&mut rng, i >= spec.n_test_good);
        write_json(&base.join("test").join(format!("clip_{i:03}")).join(CLIP_FILE), &sample)?;
    }

    info!(root = %base.display(), train = spec.n_train, "Generated synthetic video clips");
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodule::{DataModule, DataOptions, ImageFolder, VideoClips};
    use tempfile::TempDir;
    use vigil_core::batch::{IMAGE, LABEL, MASK};
    use vigil_core::BatchExt;

    #[test]
    fn test_same_seed_same_data() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let spec = SyntheticSpec::default();
        generate_image_folder(a.path(), &spec).unwrap();
        generate_image_folder(b.path(), &spec).unwrap();
        let file = Path::new("dummy/test/defect/000.json");
        assert_eq!(std::fs::read(a.path().join(file)).unwrap(), std::fs::read(b.path().join(file)).unwrap());
    }

    #[test]
    fn test_folder_roundtrip_through_datamodule() {
        let temp = TempDir::new().unwrap();
        generate_image_folder(temp.path(), &SyntheticSpec::default()).unwrap();

        let options = DataOptions { image_size: Some((16, 16)), train_batch_size: 4, ..DataOptions::default() };
        let mut module = ImageFolder::new(temp.path(), options);
        module.setup().unwrap();
        assert_eq!(module.image_size(), Some((16, 16)));

        let train = module.train_batches().unwrap();
        assert_eq!(train.len(), 2);
        assert_eq!(train[0].tensor(IMAGE).unwrap().shape, vec![4, 16, 16]);

        let test = module.test_batches().unwrap();
        let labels = &test[0].tensor(LABEL).unwrap().data;
        assert!(labels.contains(&0.0) && labels.contains(&1.0));
        let masks = test[0].tensor(MASK).unwrap();
        assert_eq!(masks.shape, vec![labels.len(), 16, 16]);
        assert!(masks.data.iter().any(|&m| m > 0.5));
    }

    #[test]
    fn test_clips_roundtrip_through_datamodule() {
        let temp = TempDir::new().unwrap();
        let spec = SyntheticSpec {
            image_size: (8, 8),
            n_train: 2,
            n_test_good: 2,
            n_test_defect: 2,
            ..SyntheticSpec::default()
        };
        generate_video_clips(temp.path(), &spec).unwrap();

        let mut module = VideoClips::new(temp.path(), DataOptions::default());
        module.setup().unwrap();
        assert!(module.is_video());
        let train = module.train_batches().unwrap();
        assert_eq!(train[0].tensor(IMAGE).unwrap().shape, vec![2, 4, 8, 8]);
        let val = module.val_batches().unwrap();
        assert_eq!(val[0].tensor(LABEL).unwrap().data, vec![0.0, 1.0]);
    }

    #[test]
    fn test_rejects_tiny_images() {
        let temp = TempDir::new().unwrap();
        let spec = SyntheticSpec { image_size: (2, 2), ..SyntheticSpec::default() };
        assert!(generate_image_folder(temp.path(), &spec).is_err());
    }
}
