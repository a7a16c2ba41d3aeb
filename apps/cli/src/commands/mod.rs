//! Command implementations for the Vigil CLI.

pub mod datagen;
pub mod models;
pub mod run;
pub mod types;
