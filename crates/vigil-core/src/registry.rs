//! Component registries keyed by stable type paths.
//!
//! Thresholds, normalization metrics and metrics are persisted by identity
//! only. On load, the identifier is resolved here to a zero-argument factory.

use crate::metrics::{Metric, AUPR, AUROC, F1Max, F1Score};
use crate::normalization::{MinMax, Normalizer};
use crate::threshold::{F1AdaptiveThreshold, ManualThreshold, Threshold};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

pub const THRESHOLD_NAMESPACE: &str = "vigil_core.threshold";
pub const NORMALIZATION_NAMESPACE: &str = "vigil_core.normalization";
pub const METRICS_NAMESPACE: &str = "vigil_core.metrics";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("`{id}` is not registered in {namespace}")]
    NotFound { namespace: String, id: String },

    #[error("registry lock poisoned: {0}")]
    Poisoned(String),
}

pub type Factory<T> = fn() -> Box<T>;

/// Maps identifiers to zero-argument factories.
pub struct Registry<T: ?Sized> {
    namespace: &'static str,
    factories: RwLock<BTreeMap<String, Factory<T>>>,
}

impl<T: ?Sized> Registry<T> {
    #[must_use]
    pub fn new(namespace: &'static str) -> Self {
        Self { namespace, factories: RwLock::new(BTreeMap::new()) }
    }

    #[must_use]
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Registers `factory` under `id`, replacing any previous entry.
    pub fn register(&self, id: impl Into<String>, factory: Factory<T>) -> Result<(), RegistryError> {
        let mut factories = self
            .factories
            .write()
            .map_err(|e| RegistryError::Poisoned(e.to_string()))?;
        factories.insert(id.into(), factory);
        Ok(())
    }

    pub fn create(&self, id: &str) -> Result<Box<T>, RegistryError> {
        let factories = self
            .factories
            .read()
            .map_err(|e| RegistryError::Poisoned(e.to_string()))?;
        let factory = factories.get(id).ok_or_else(|| RegistryError::NotFound {
            namespace: self.namespace.to_string(),
            id: id.to_string(),
        })?;
        Ok(factory())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().is_ok_and(|f| f.contains_key(id))
    }

    pub fn ids(&self) -> Vec<String> {
        self.factories
            .read()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("namespace", &self.namespace)
            .field("ids", &self.ids())
            .finish()
    }
}

// Inserts into a registry nobody else can see yet, so the lock cannot be poisoned.
fn seeded<T: ?Sized>(namespace: &'static str, entries: &[(&str, Factory<T>)]) -> Registry<T> {
    let mut map = BTreeMap::new();
    for (id, factory) in entries {
        map.insert((*id).to_string(), *factory);
    }
    Registry { namespace, factories: RwLock::new(map) }
}

fn f1_adaptive_threshold() -> Box<dyn Threshold> {
    Box::new(F1AdaptiveThreshold::default())
}

fn manual_threshold() -> Box<dyn Threshold> {
    Box::new(ManualThreshold::default())
}

fn min_max() -> Box<dyn Normalizer> {
    Box::new(MinMax::default())
}

fn auroc() -> Box<dyn Metric> {
    Box::new(AUROC::default())
}

fn aupr() -> Box<dyn Metric> {
    Box::new(AUPR::default())
}

fn f1_score() -> Box<dyn Metric> {
    Box::new(F1Score::default())
}

fn f1_max() -> Box<dyn Metric> {
    Box::new(F1Max::default())
}

static THRESHOLDS: Lazy<Registry<dyn Threshold>> = Lazy::new(|| {
    seeded(
        THRESHOLD_NAMESPACE,
        &[
            (F1AdaptiveThreshold::TYPE_PATH, f1_adaptive_threshold as Factory<dyn Threshold>),
            (ManualThreshold::TYPE_PATH, manual_threshold),
        ],
    )
});

static NORMALIZERS: Lazy<Registry<dyn Normalizer>> =
    Lazy::new(|| seeded(NORMALIZATION_NAMESPACE, &[(MinMax::TYPE_PATH, min_max as Factory<dyn Normalizer>)]));

static METRICS: Lazy<Registry<dyn Metric>> = Lazy::new(|| {
    seeded(
        METRICS_NAMESPACE,
        &[
            ("AUROC", auroc as Factory<dyn Metric>),
            ("AUPR", aupr),
            ("F1Score", f1_score),
            ("F1Max", f1_max),
        ],
    )
});

/// Threshold components, keyed by type path.
pub fn thresholds() -> &'static Registry<dyn Threshold> {
    &THRESHOLDS
}

/// Normalization metrics, keyed by type path.
pub fn normalizers() -> &'static Registry<dyn Normalizer> {
    &NORMALIZERS
}

/// Evaluation metrics, keyed by bare class name.
pub fn metrics() -> &'static Registry<dyn Metric> {
    &METRICS
}
