//! Concrete anomaly models.
//!
//! # Models
//!
//! - **gaussian**: per-pixel Gaussian fitted on normal images
//! - **memory_bank**: nearest-neighbour patch memory (needs `input_size`)
//! - **pca_density**: principal subspace reconstruction error
//! - **frame_diff**: frame-to-frame change model for video clips

mod common;
pub mod factory;
pub mod frame_diff;
pub mod gaussian;
pub mod memory_bank;
pub mod pca_density;

pub use factory::{get_available_models, get_model, ModelArgs, ModelError, ModelType};
pub use frame_diff::{FrameDiff, FrameDiffModel};
pub use gaussian::{Gaussian, GaussianModel};
pub use memory_bank::{MemoryBank, MemoryBankModel};
pub use pca_density::{PcaDensity, PcaDensityModel, ReconstructionLoss};
