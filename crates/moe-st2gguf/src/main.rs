//! Mixtral SafeTensors to GGUF converter
//!
//! Converts a Mixture-of-Experts SafeTensors checkpoint into a single GGUF
//! file, stacking per-expert feed-forward weights into one tensor per layer
//! and projection.
//!
//! # Usage
//!
//! ```bash
//! # Convert a sharded checkpoint directory (reads config.json from it)
//! moe-st2gguf --input Mixtral-8x7B-Instruct-v0.1/ --output mixtral.gguf
//!
//! # Fail on incomplete or ragged expert groups
//! moe-st2gguf --input model_dir/ --output model.gguf --strict
//! ```
//!
//! Set `RUST_LOG=debug` to trace every tensor.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use moe_st2gguf::config::{ConvertOptions, DEFAULT_ALIGNMENT};
use moe_st2gguf::convert::{convert_checkpoint, write_sidecar};

/// Mixtral SafeTensors to GGUF converter
#[derive(Parser, Debug)]
#[command(name = "moe-st2gguf")]
#[command(about = "Convert Mixture-of-Experts SafeTensors checkpoints to GGUF")]
#[command(version)]
struct Args {
    /// Input checkpoint directory or single *.safetensors file
    #[arg(short, long)]
    input: PathBuf,

    /// Output GGUF file path
    #[arg(short, long)]
    output: PathBuf,

    /// Optional config.json path
    ///
    /// Defaults to config.json next to the input
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reject incomplete expert groups and out-of-range expert indices
    #[arg(short, long)]
    strict: bool,

    /// Tensor data alignment in bytes (power of two)
    #[arg(long, default_value_t = DEFAULT_ALIGNMENT)]
    alignment: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Input: {}", args.input.display());
    tracing::info!("Output: {}", args.output.display());
    if args.strict {
        tracing::info!("Strict mode: enabled");
    }

    let options = ConvertOptions { strict: args.strict, alignment: args.alignment };
    let report = convert_checkpoint(&args.input, &args.output, args.config.as_deref(), &options)
        .with_context(|| format!("failed to convert {}", args.input.display()))?;

    let meta_path = write_sidecar(&report).context("failed to write sidecar metadata")?;

    tracing::info!("Conversion complete!");
    tracing::info!(
        "  Tensors: {} ({} stacked expert groups from {} source tensors)",
        report.output_tensors,
        report.expert_groups,
        report.source_tensors
    );
    tracing::info!("  Output: {} ({} bytes)", report.output.display(), report.bytes_written);
    tracing::info!("  Metadata: {}", meta_path.display());

    Ok(())
}
