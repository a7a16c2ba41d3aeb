//! Data modules: on-disk datasets served as batches.
//!
//! Two layouts are understood:
//!
//! - `folder`: `root/<category>/train/good/*.json` and
//!   `root/<category>/test/<good|defect type>/*.json`, one [`ImageSample`]
//!   per file.
//! - `clips`: `root/<category>/{train,test}/<clip>/clip.json`, one
//!   [`ClipSample`] per clip directory.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vigil_core::batch::{IMAGE, IMAGE_PATH, LABEL, MASK, VIDEO_PATH};
use vigil_core::{Batch, BatchExt, TaskType, Tensor};
use walkdir::WalkDir;

pub const GOOD_DIR: &str = "good";
pub const CLIP_FILE: &str = "clip.json";

/// A grayscale image in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSample {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<f32>>,
}

/// A grayscale clip: `frames[t]` is one row-major frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSample {
    pub width: usize,
    pub height: usize,
    pub frames: Vec<Vec<f32>>,
    pub label: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataOptions {
    pub category: String,
    pub task: TaskType,
    /// Resize target `(height, width)`; `None` keeps the native size
    pub image_size: Option<(usize, usize)>,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    /// Share of each test class moved to the validation split
    pub val_split_ratio: f32,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            category: "dummy".to_string(),
            task: TaskType::Segmentation,
            image_size: None,
            train_batch_size: 32,
            eval_batch_size: 32,
            val_split_ratio: 0.5,
        }
    }
}

pub trait DataModule: Send {
    fn name(&self) -> &'static str;

    fn category(&self) -> &str;

    fn task(&self) -> TaskType;

    /// Video modules yield `[B, T, H, W]` image tensors.
    fn is_video(&self) -> bool {
        false
    }

    /// `(height, width)` of served images; known after `setup`.
    fn image_size(&self) -> Option<(usize, usize)>;

    /// Reads the dataset from disk. Calling it again is a no-op.
    fn setup(&mut self) -> EngineResult<()>;

    fn train_batches(&self) -> EngineResult<Vec<Batch>>;

    fn val_batches(&self) -> EngineResult<Vec<Batch>>;

    fn test_batches(&self) -> EngineResult<Vec<Batch>>;

    fn predict_batches(&self) -> EngineResult<Vec<Batch>> {
        self.test_batches()
    }
}

/// Builds the data module registered under `name`.
pub fn get_datamodule(name: &str, root: &Path, options: DataOptions) -> EngineResult<Box<dyn DataModule>> {
    match name.to_lowercase().as_str() {
        "folder" => Ok(Box::new(ImageFolder::new(root, options))),
        "clips" => Ok(Box::new(VideoClips::new(root, options))),
        _ => Err(EngineError::UnknownDataModule(name.to_string())),
    }
}

/// One loaded and resized sample.
#[derive(Debug, Clone)]
struct Item {
    path: String,
    /// One entry per frame; images have a single frame
    frames: Vec<Vec<f32>>,
    label: f32,
    mask: Vec<f32>,
}

#[derive(Debug, Default)]
struct Splits {
    size: Option<(usize, usize)>,
    train: Vec<Item>,
    val: Vec<Item>,
    test: Vec<Item>,
}

/// Nearest-neighbour resize of a row-major `(h, w)` plane.
pub fn resize_nearest(data: &[f32], from: (usize, usize), to: (usize, usize)) -> Vec<f32> {
    if from == to {
        return data.to_vec();
    }
    let (fh, fw) = from;
    let (th, tw) = to;
    let mut out = Vec::with_capacity(th * tw);
    for y in 0..th {
        let sy = (y * fh / th).min(fh - 1);
        for x in 0..tw {
            let sx = (x * fw / tw).min(fw - 1);
            out.push(data[sy * fw + sx]);
        }
    }
    out
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> EngineResult<T> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::Data(format!("{}: {}", path.display(), e)))
}

/// Sorted entries directly under `dir`.
fn list_dir(dir: &Path, want_dirs: bool) -> EngineResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| EngineError::Data(e.to_string()))?;
        let is_dir = entry.file_type().is_dir();
        if want_dirs && is_dir {
            paths.push(entry.into_path());
        } else if !want_dirs && !is_dir && entry.path().extension().is_some_and(|e| e == "json") {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

fn check_plane(path: &Path, what: &str, len: usize, height: usize, width: usize) -> EngineResult<()> {
    if height == 0 || width == 0 || len != height * width {
        return Err(EngineError::Data(format!(
            "{}: {what} has {len} values, expected {height}x{width}",
            path.display()
        )));
    }
    Ok(())
}

/// Moves `ratio` of each class of `test` into a validation split.
///
/// A class with a single sample is shared by both splits.
fn split_validation(test: Vec<Item>, ratio: f32) -> (Vec<Item>, Vec<Item>) {
    let (mut val, mut kept) = (Vec::new(), Vec::new());
    let (normal, abnormal): (Vec<Item>, Vec<Item>) = test.into_iter().partition(|i| i.label < 0.5);
    for class in [normal, abnormal] {
        let n = class.len();
        if n == 0 {
            continue;
        }
        if n == 1 {
            val.extend(class.iter().cloned());
            kept.extend(class);
            continue;
        }
        let n_val = ((n as f32 * ratio).round() as usize).clamp(1, n - 1);
        for (i, item) in class.into_iter().enumerate() {
            // Spread the validation picks evenly across the class.
            if (i + 1) * n_val / n > i * n_val / n {
                val.push(item);
            } else {
                kept.push(item);
            }
        }
    }
    (val, kept)
}

fn check_size(splits: &Splits, path: &str, size: (usize, usize)) -> EngineResult<()> {
    match splits.size {
        Some(expected) if expected != size => Err(EngineError::Data(format!(
            "{path}: size {size:?} differs from {expected:?}"
        ))),
        _ => Ok(()),
    }
}

fn batches(items: &[Item], batch_size: usize, size: (usize, usize), video: bool) -> EngineResult<Vec<Batch>> {
    let (h, w) = size;
    items
        .chunks(batch_size.max(1))
        .map(|chunk| -> EngineResult<Batch> {
            let mut batch = Batch::new();
            let rows: Vec<Vec<f32>> = chunk.iter().map(|i| i.frames.concat()).collect();
            let image = if video {
                let frames = chunk[0].frames.len();
                if chunk.iter().any(|i| i.frames.len() != frames) {
                    return Err(EngineError::Data("clips in a batch must have the same length".to_string()));
                }
                Tensor::stack(&[frames, h, w], &rows)?
            } else {
                Tensor::stack(&[h, w], &rows)?
            };
            batch.set_tensor(IMAGE, image);
            batch.set_tensor(LABEL, Tensor::scalar_vec(chunk.iter().map(|i| i.label).collect()));
            let masks: Vec<Vec<f32>> = chunk.iter().map(|i| i.mask.clone()).collect();
            batch.set_tensor(MASK, Tensor::stack(&[h, w], &masks)?);
            let key = if video { VIDEO_PATH } else { IMAGE_PATH };
            batch.insert(key.to_string(), chunk.iter().map(|i| i.path.clone()).collect::<Vec<_>>().into());
            Ok(batch)
        })
        .collect()
}

/// Folder-of-images dataset.
#[derive(Debug)]
pub struct ImageFolder {
    root: PathBuf,
    options: DataOptions,
    splits: Option<Splits>,
}

impl ImageFolder {
    #[must_use]
    pub fn new(root: &Path, options: DataOptions) -> Self {
        Self { root: root.to_path_buf(), options, splits: None }
    }

    fn category_dir(&self) -> PathBuf {
        self.root.join(&self.options.category)
    }

    fn load(&self, splits: &mut Splits, path: &Path, label: f32) -> EngineResult<Item> {
        let sample: ImageSample = read_json(path)?;
        check_plane(path, "pixels", sample.pixels.len(), sample.height, sample.width)?;
        let native = (sample.height, sample.width);
        let size = self.options.image_size.unwrap_or(native);
        let display = path.display().to_string();
        check_size(splits, &display, size)?;
        splits.size = Some(size);

        let mask = match &sample.mask {
            Some(mask) => {
                check_plane(path, "mask", mask.len(), sample.height, sample.width)?;
                resize_nearest(mask, native, size)
            }
            None => vec![label; size.0 * size.1],
        };
        Ok(Item { path: display, frames: vec![resize_nearest(&sample.pixels, native, size)], label, mask })
    }

    fn splits(&self) -> EngineResult<&Splits> {
        self.splits
            .as_ref()
            .ok_or_else(|| EngineError::Data("datamodule used before setup()".to_string()))
    }
}

impl DataModule for ImageFolder {
    fn name(&self) -> &'static str {
        "folder"
    }

    fn category(&self) -> &str {
        &self.options.category
    }

    fn task(&self) -> TaskType {
        self.options.task
    }

    fn image_size(&self) -> Option<(usize, usize)> {
        self.splits.as_ref().and_then(|s| s.size).or(self.options.image_size)
    }

    fn setup(&mut self) -> EngineResult<()> {
        if self.splits.is_some() {
            return Ok(());
        }
        let base = self.category_dir();
        if !base.is_dir() {
            return Err(EngineError::DatasetNotFound(base));
        }

        let mut splits = Splits::default();
        for path in list_dir(&base.join("train").join(GOOD_DIR), false)? {
            let item = self.load(&mut splits, &path, 0.0)?;
            splits.train.push(item);
        }
        let mut test = Vec::new();
        for dir in list_dir(&base.join("test"), true)? {
            let label = if dir.file_name().is_some_and(|n| n == GOOD_DIR) { 0.0 } else { 1.0 };
            for path in list_dir(&dir, false)? {
                test.push(self.load(&mut splits, &path, label)?);
            }
        }
        if splits.train.is_empty() {
            return Err(EngineError::Data(format!("{}: no training images", base.display())));
        }
        if test.is_empty() {
            return Err(EngineError::Data(format!("{}: no test images", base.display())));
        }
        let (val, test) = split_validation(test, self.options.val_split_ratio);
        splits.val = val;
        splits.test = test;

        info!(
            category = %self.options.category,
            train = splits.train.len(),
            val = splits.val.len(),
            test = splits.test.len(),
            "Loaded image folder"
        );
        self.splits = Some(splits);
        Ok(())
    }

    fn train_batches(&self) -> EngineResult<Vec<Batch>> {
        let s = self.splits()?;
        batches(&s.train, self.options.train_batch_size, s.size.unwrap_or_default(), false)
    }

    fn val_batches(&self) -> EngineResult<Vec<Batch>> {
        let s = self.splits()?;
        batches(&s.val, self.options.eval_batch_size, s.size.unwrap_or_default(), false)
    }

    fn test_batches(&self) -> EngineResult<Vec<Batch>> {
        let s = self.splits()?;
        batches(&s.test, self.options.eval_batch_size, s.size.unwrap_or_default(), false)
    }
}

/// Directory-of-clips video dataset.
#[derive(Debug)]
pub struct VideoClips {
    root: PathBuf,
    options: DataOptions,
    splits: Option<Splits>,
}

impl VideoClips {
    #[must_use]
    pub fn new(root: &Path, options: DataOptions) -> Self {
        Self { root: root.to_path_buf(), options, splits: None }
    }

    fn load(&self, splits: &mut Splits, clip_dir: &Path) -> EngineResult<Item> {
        let path = clip_dir.join(CLIP_FILE);
        let sample: ClipSample = read_json(&path)?;
        if sample.frames.len() < 2 {
            return Err(EngineError::Data(format!("{}: clips need at least two frames", path.display())));
        }
        let native = (sample.height, sample.width);
        let size = self.options.image_size.unwrap_or(native);
        let clip_name = clip_dir.display().to_string();
        check_size(splits, &clip_name, size)?;
        splits.size = Some(size);

        let mut frames = Vec::with_capacity(sample.frames.len());
        for frame in &sample.frames {
            check_plane(&path, "frame", frame.len(), sample.height, sample.width)?;
            frames.push(resize_nearest(frame, native, size));
        }
        let label = if sample.label > 0 { 1.0 } else { 0.0 };
        let mask = match &sample.mask {
            Some(mask) => {
                check_plane(&path, "mask", mask.len(), sample.height, sample.width)?;
                resize_nearest(mask, native, size)
            }
            None => vec![label; size.0 * size.1],
        };
        debug!(clip = %clip_name, frames = frames.len(), "Loaded clip");
        Ok(Item { path: clip_name, frames, label, mask })
    }

    fn splits(&self) -> EngineResult<&Splits> {
        self.splits
            .as_ref()
            .ok_or_else(|| EngineError::Data("datamodule used before setup()".to_string()))
    }
}

impl DataModule for VideoClips {
    fn name(&self) -> &'static str {
        "clips"
    }

    fn category(&self) -> &str {
        &self.options.category
    }

    fn task(&self) -> TaskType {
        self.options.task
    }

    fn is_video(&self) -> bool {
        true
    }

    fn image_size(&self) -> Option<(usize, usize)> {
        self.splits.as_ref().and_then(|s| s.size).or(self.options.image_size)
    }

    fn setup(&mut self) -> EngineResult<()> {
        if self.splits.is_some() {
            return Ok(());
        }
        let base = self.root.join(&self.options.category);
        if !base.is_dir() {
            return Err(EngineError::DatasetNotFound(base));
        }

        let mut splits = Splits::default();
        for dir in list_dir(&base.join("train"), true)? {
            let item = self.load(&mut splits, &dir)?;
            if item.label > 0.5 {
                return Err(EngineError::Data(format!("{}: training clips must be normal", item.path)));
            }
            splits.train.push(item);
        }
        let mut test = Vec::new();
        for dir in list_dir(&base.join("test"), true)? {
            test.push(self.load(&mut splits, &dir)?);
        }
        if splits.train.is_empty() || test.is_empty() {
            return Err(EngineError::Data(format!("{}: needs train and test clips", base.display())));
        }
        let (val, test) = split_validation(test, self.options.val_split_ratio);
        splits.val = val;
        splits.test = test;

        info!(
            category = %self.options.category,
            train = splits.train.len(),
            val = splits.val.len(),
            test = splits.test.len(),
            "Loaded video clips"
        );
        self.splits = Some(splits);
        Ok(())
    }

    fn train_batches(&self) -> EngineResult<Vec<Batch>> {
        let s = self.splits()?;
        batches(&s.train, self.options.train_batch_size, s.size.unwrap_or_default(), true)
    }

    fn val_batches(&self) -> EngineResult<Vec<Batch>> {
        let s = self.splits()?;
        batches(&s.val, self.options.eval_batch_size, s.size.unwrap_or_default(), true)
    }

    fn test_batches(&self) -> EngineResult<Vec<Batch>> {
        let s = self.splits()?;
        batches(&s.test, self.options.eval_batch_size, s.size.unwrap_or_default(), true)
    }
}
