//! `vigil models`: list what the model factory can build.

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use vigil_models::{get_available_models, ModelType};

fn required_args(model: ModelType) -> &'static [&'static str] {
    match model {
        ModelType::MemoryBank => &["--input-size"],
        ModelType::PcaDensity => &["--n-pca-components"],
        ModelType::FrameDiff | ModelType::Gaussian => &[],
    }
}

pub fn execute(json_output: bool) -> Result<()> {
    let mut models = Vec::new();
    for name in get_available_models() {
        models.push((name, name.parse::<ModelType>()?));
    }

    if json_output {
        let out: Vec<_> = models
            .iter()
            .map(|(name, model)| {
                json!({
                    "name": name,
                    "datamodule": if model.is_video() { "clips" } else { "folder" },
                    "arguments": required_args(*model),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Available Models ({})", models.len()).bold().cyan());
    println!();
    println!("{:<16} {:<12} Arguments", "Name", "Data");
    println!("{}", "─".repeat(48));
    for (name, model) in models {
        let data = if model.is_video() { "clips" } else { "folder" };
        println!("{:<16} {:<12} {}", name.cyan(), data.dimmed(), required_args(model).join(" "));
    }
    println!();
    Ok(())
}
