use crate::export::ExportType;
use std::path::{Path, PathBuf};

/// Filesystem layout for engine outputs.
///
/// Exports land under `<root>/weights/<format>/model.<ext>`.
#[derive(Debug, Clone)]
pub struct EngineLayout {
    root: PathBuf,
}

impl EngineLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn weights_dir(&self) -> PathBuf {
        self.root.join("weights")
    }

    #[must_use]
    pub fn last_checkpoint_path(&self) -> PathBuf {
        self.weights_dir().join("last.ckpt")
    }

    #[must_use]
    pub fn export_dir(&self, export_type: ExportType) -> PathBuf {
        self.weights_dir().join(export_type.as_str())
    }

    #[must_use]
    pub fn export_path(&self, export_type: ExportType) -> PathBuf {
        self.export_dir(export_type).join(format!("model.{}", export_type.extension()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = EngineLayout::new(PathBuf::from("/tmp/project"));
        assert_eq!(layout.last_checkpoint_path(), PathBuf::from("/tmp/project/weights/last.ckpt"));
        assert_eq!(layout.export_path(ExportType::Json), PathBuf::from("/tmp/project/weights/json/model.json"));
        assert_eq!(layout.export_path(ExportType::Toml), PathBuf::from("/tmp/project/weights/toml/model.toml"));
    }
}
