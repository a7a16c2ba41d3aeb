//! Argument types shared by the CLI commands.

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use vigil_core::TaskType;
use vigil_engine::ExportType;

/// Parses `HxW` (or `H,W`, or a single `N` for square) into `(height, width)`.
pub fn parse_size(s: &str) -> Result<(usize, usize), String> {
    let parts: Vec<&str> = s.split(['x', 'X', ',']).map(str::trim).collect();
    let parse = |p: &str| p.parse::<usize>().map_err(|e| format!("invalid size `{s}`: {e}"));
    let (h, w) = match parts.as_slice() {
        [n] => {
            let n = parse(n)?;
            (n, n)
        }
        [h, w] => (parse(h)?, parse(w)?),
        _ => return Err(format!("invalid size `{s}`; expected HxW")),
    };
    if h == 0 || w == 0 {
        return Err(format!("invalid size `{s}`; dimensions must be positive"));
    }
    Ok((h, w))
}

/// Arguments of every engine stage.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Model name (see `vigil models`)
    #[arg(short, long)]
    pub model: String,

    /// Dataset root containing `<category>/`
    #[arg(short, long)]
    pub data: PathBuf,

    /// Data module (`folder` or `clips`); defaults to `clips` for video models
    #[arg(long)]
    pub datamodule: Option<String>,

    /// Output root; overrides `default_root_dir` from the config
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Dataset category
    #[arg(short, long, default_value = "dummy")]
    pub category: String,

    /// Checkpoint to restore; defaults to `<root>/weights/last.ckpt` when present
    #[arg(long)]
    pub ckpt: Option<PathBuf>,

    /// Engine config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Task type; overrides the config
    #[arg(short, long)]
    pub task: Option<TaskType>,

    /// Principal components for `pca_density`
    #[arg(long)]
    pub n_pca_components: Option<usize>,

    /// Image size as HxW; images are resized to it
    #[arg(long, value_parser = parse_size)]
    pub input_size: Option<(usize, usize)>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Export format (json or toml)
    #[arg(short, long, default_value = "json")]
    pub format: ExportType,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Still images (`folder` data module)
    Folder,
    /// Video clips (`clips` data module)
    Clips,
}

#[derive(Args, Debug, Clone)]
pub struct DatagenArgs {
    /// Output directory; data lands in `<out>/<category>`
    #[arg(short, long)]
    pub out: PathBuf,

    #[arg(long, value_enum, default_value_t = Layout::Folder)]
    pub layout: Layout,

    #[arg(short, long, default_value = "dummy")]
    pub category: String,

    /// Image size as HxW
    #[arg(long, value_parser = parse_size, default_value = "32x32")]
    pub size: (usize, usize),

    #[arg(long, default_value_t = 6)]
    pub n_train: usize,

    #[arg(long, default_value_t = 4)]
    pub n_test_good: usize,

    #[arg(long, default_value_t = 4)]
    pub n_test_defect: usize,

    /// Frames per clip
    #[arg(long, default_value_t = 4)]
    pub frames: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("24x32").unwrap(), (24, 32));
        assert_eq!(parse_size("16").unwrap(), (16, 16));
        assert_eq!(parse_size("8, 4").unwrap(), (8, 4));
        assert!(parse_size("0x4").is_err());
        assert!(parse_size("axb").is_err());
        assert!(parse_size("1x2x3").is_err());
    }
}
