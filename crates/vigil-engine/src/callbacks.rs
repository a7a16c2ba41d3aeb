use std::path::PathBuf;
use tracing::info;
use vigil_core::{AnomalyModule, Callback, CallbackContext, Checkpoint, CheckpointArtifact, UnitResult};

pub const LAST_CHECKPOINT: &str = "last";

/// Writes `<dirpath>/<filename>.ckpt` whenever validation finishes.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    pub dirpath: PathBuf,
    pub filename: String,
    /// Also keep a `last.ckpt` copy when `filename` is something else
    pub save_last: bool,
    last_saved: Option<CheckpointArtifact>,
}

impl ModelCheckpoint {
    #[must_use]
    pub fn new(dirpath: impl Into<PathBuf>) -> Self {
        Self { dirpath: dirpath.into(), filename: LAST_CHECKPOINT.to_string(), save_last: true, last_saved: None }
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    #[must_use]
    pub fn with_save_last(mut self, save_last: bool) -> Self {
        self.save_last = save_last;
        self
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dirpath.join(format!("{}.ckpt", self.filename))
    }

    #[must_use]
    pub fn last_saved(&self) -> Option<&CheckpointArtifact> {
        self.last_saved.as_ref()
    }
}

impl Callback for ModelCheckpoint {
    fn on_validation_end(&mut self, ctx: &CallbackContext, unit: &dyn AnomalyModule) -> UnitResult<()> {
        let checkpoint = Checkpoint::capture(unit, ctx.epoch, ctx.global_step)?;
        let artifact = checkpoint.save(&self.path())?;
        if self.save_last && self.filename != LAST_CHECKPOINT {
            checkpoint.save(&self.dirpath.join(format!("{LAST_CHECKPOINT}.ckpt")))?;
        }
        info!(path = %artifact.path.display(), sha256 = %artifact.sha256, "Saved checkpoint");
        self.last_saved = Some(artifact);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vigil_core::{Stage, UnitState};

    #[derive(Debug)]
    struct Empty {
        state: UnitState,
    }

    impl AnomalyModule for Empty {
        fn name(&self) -> &str {
            "empty"
        }

        fn state(&self) -> &UnitState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut UnitState {
            &mut self.state
        }
    }

    #[test]
    fn test_writes_named_and_last() {
        let temp = TempDir::new().unwrap();
        let mut callback = ModelCheckpoint::new(temp.path().join("weights")).with_filename("epoch0");
        let unit = Empty { state: UnitState::default() };
        let mut ctx = CallbackContext::new(Stage::Fit);
        ctx.global_step = 3;

        callback.on_validation_end(&ctx, &unit).unwrap();
        assert!(temp.path().join("weights/epoch0.ckpt").exists());
        assert!(temp.path().join("weights/last.ckpt").exists());

        let saved = Checkpoint::load(&callback.path()).unwrap();
        assert_eq!(saved.global_step, 3);
        assert_eq!(saved.model_name, "empty");
        assert!(callback.last_saved().is_some());
    }
}
