//! Lifecycle hooks invoked by the engine.

use crate::error::UnitResult;
use crate::unit::AnomalyModule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fit,
    Validate,
    Test,
    Predict,
    Export,
}

/// Loop state handed to callbacks.
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub stage: Stage,
    /// Current epoch (0-indexed)
    pub epoch: u32,
    pub global_step: u64,
    /// Metrics of the last evaluation, if any
    pub metrics: BTreeMap<String, f64>,
}

impl CallbackContext {
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self { stage, epoch: 0, global_step: 0, metrics: BTreeMap::new() }
    }
}

/// All hooks default to no-ops; implement the ones you need.
pub trait Callback: std::fmt::Debug + Send {
    fn on_fit_start(&mut self, _ctx: &CallbackContext, _unit: &dyn AnomalyModule) -> UnitResult<()> {
        Ok(())
    }

    fn on_train_epoch_end(&mut self, _ctx: &CallbackContext, _unit: &dyn AnomalyModule) -> UnitResult<()> {
        Ok(())
    }

    fn on_validation_end(&mut self, _ctx: &CallbackContext, _unit: &dyn AnomalyModule) -> UnitResult<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _ctx: &CallbackContext, _unit: &dyn AnomalyModule) -> UnitResult<()> {
        Ok(())
    }

    fn on_test_end(&mut self, _ctx: &CallbackContext, _unit: &dyn AnomalyModule) -> UnitResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Callback"
    }
}
