//! `vigil datagen`: write a seeded synthetic dataset.

use crate::commands::types::{DatagenArgs, Layout};
use anyhow::{Context, Result};
use colored::Colorize;
use vigil_engine::{generate_image_folder, generate_video_clips, SyntheticSpec};

pub fn execute(args: &DatagenArgs) -> Result<()> {
    let spec = SyntheticSpec {
        category: args.category.clone(),
        image_size: args.size,
        n_train: args.n_train,
        n_test_good: args.n_test_good,
        n_test_defect: args.n_test_defect,
        frames: args.frames,
        seed: args.seed,
    };
    let path = match args.layout {
        Layout::Folder => generate_image_folder(&args.out, &spec),
        Layout::Clips => generate_video_clips(&args.out, &spec),
    }
    .with_context(|| format!("Failed to generate dataset in {}", args.out.display()))?;

    println!();
    println!("{}", "Dataset generated".bold().green());
    println!("  Path: {}", path.display().to_string().cyan());
    println!("  Size: {}x{}", spec.image_size.0, spec.image_size.1);
    println!();
    Ok(())
}
