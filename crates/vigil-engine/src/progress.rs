use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use vigil_core::Stage;

/// Identifier for one engine call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId, stage: Stage },
    Step { run_id: RunId, stage: Stage, step: u64, total: Option<u64> },
    Message { run_id: RunId, message: String },
    Finished { run_id: RunId, stage: Stage },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id, stage } => info!(%run_id, ?stage, "started"),
            ProgressEvent::Step { run_id, stage, step, total } => {
                debug!(%run_id, ?stage, step, total, "step");
            }
            ProgressEvent::Message { run_id, message } => info!(%run_id, "{message}"),
            ProgressEvent::Finished { run_id, stage } => info!(%run_id, ?stage, "finished"),
        }
    }
}

/// Keeps every event; handy in tests.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
