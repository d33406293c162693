use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use devserve::pack_artifacts;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Copies WASM build targets into a distribution directory.
#[derive(Parser, Debug)]
#[command(name = "pack-artifacts")]
#[command(version, about)]
struct Args {
    /// Build tree containing `Tutorials/` and `Samples/`.
    #[arg(short = 's', long, alias = "source_dir")]
    source_dir: PathBuf,

    /// Destination directory. Existing contents are merged.
    #[arg(short = 'o', long, alias = "output_dir")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let report = pack_artifacts(&args.source_dir, &args.output_dir).with_context(|| {
        format!(
            "failed to pack {:?} into {:?}",
            args.source_dir, args.output_dir
        )
    })?;

    info!(
        "packed {} targets, {} missing",
        report.packed.len(),
        report.missing.len()
    );
    Ok(())
}
