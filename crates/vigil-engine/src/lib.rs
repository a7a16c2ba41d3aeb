//! Vigil Engine
//!
//! Runs anomaly models end to end:
//! - Data modules over on-disk image folders and video clips
//! - Fit / validate / test / train / predict / export entry points
//! - Post-processing (normalization, thresholding, masks, boxes)
//! - Checkpoint callback and export bundles
//! - Seeded synthetic datasets for tests and demos

pub mod callbacks;
pub mod config;
pub mod datamodule;
pub mod engine;
pub mod error;
pub mod export;
pub mod layout;
pub mod post_process;
pub mod progress;
pub mod synthetic;

pub use callbacks::ModelCheckpoint;
pub use config::{ConfigError, EngineConfig, LoopLimits};
pub use datamodule::{get_datamodule, ClipSample, DataModule, DataOptions, ImageFolder, ImageSample, VideoClips};
pub use engine::{Engine, Metrics};
pub use error::{EngineError, EngineResult};
pub use export::{ExportBundle, ExportType};
pub use layout::EngineLayout;
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink, RunId, TracingProgressSink};
pub use synthetic::{generate_image_folder, generate_video_clips, SyntheticSpec};
