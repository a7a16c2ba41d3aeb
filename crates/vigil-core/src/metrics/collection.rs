use super::Metric;
use crate::error::{UnitError, UnitResult};
use crate::registry;
use crate::state::StateDict;
use std::collections::BTreeMap;
use tracing::debug;

/// A named group of metrics (e.g. `image` or `pixel`).
#[derive(Debug)]
pub struct MetricCollection {
    prefix: String,
    metrics: BTreeMap<String, Box<dyn Metric>>,
}

impl MetricCollection {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), metrics: BTreeMap::new() }
    }

    /// Builds a collection from class names resolved in the metrics registry.
    pub fn from_names<S: AsRef<str>>(prefix: impl Into<String>, names: &[S]) -> UnitResult<Self> {
        let mut collection = Self::new(prefix);
        for name in names {
            let name = name.as_ref();
            let metric = registry::metrics().create(name).map_err(|e| UnitError::import(name, e))?;
            collection.add_metrics(metric);
        }
        Ok(collection)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Adds `metric` unless one with the same name is already present.
    pub fn add_metrics(&mut self, metric: Box<dyn Metric>) {
        let name = metric.name();
        if self.metrics.contains_key(name) {
            debug!(prefix = %self.prefix, metric = name, "Metric already in collection");
            return;
        }
        self.metrics.insert(name.to_string(), metric);
    }

    pub fn update(&mut self, preds: &[f32], targets: &[f32]) {
        for metric in self.metrics.values_mut() {
            metric.update(preds, targets);
        }
    }

    /// Results keyed `"{prefix}_{name}"`.
    pub fn compute(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|(name, metric)| (format!("{}_{}", self.prefix, name), metric.compute()))
            .collect()
    }

    pub fn reset(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.reset();
        }
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        for metric in self.metrics.values_mut() {
            metric.set_threshold(threshold);
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Entries keyed `"{prefix}_metrics.{name}.{field}"`.
    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for (name, metric) in &self.metrics {
            for (field, value) in metric.state_dict() {
                state.insert(format!("{}_metrics.{}.{}", self.prefix, name, field), value);
            }
        }
        state
    }
}
