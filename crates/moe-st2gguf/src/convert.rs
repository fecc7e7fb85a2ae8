//! End-to-end conversion: checkpoint directory → GGUF file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::load_checkpoint;
use crate::config::{ConvertOptions, ModelConfig};
use crate::error::{ConvertError, Result};
use crate::experts::ExpertAggregator;
use crate::metadata::derive_metadata;
use crate::naming::LlamaNamer;
use crate::reader::read_gguf_file;
use crate::writer::GgufWriter;

/// Summary of a finished conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    pub source: PathBuf,
    pub output: PathBuf,
    pub source_tensors: usize,
    pub expert_groups: usize,
    pub output_tensors: usize,
    pub metadata_entries: usize,
    pub bytes_written: u64,
}

/// Locate `config.json` next to the checkpoint unless given explicitly.
pub fn resolve_config_path(input: &Path, explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let dir = if input.is_file() { input.parent().unwrap_or(Path::new(".")) } else { input };
    dir.join("config.json")
}

/// Convert a Mixtral-style checkpoint into a single GGUF file.
pub fn convert_checkpoint(
    input: &Path,
    output: &Path,
    config_path: Option<&Path>,
    options: &ConvertOptions,
) -> Result<ConversionReport> {
    let config_path = resolve_config_path(input, config_path);
    let config = if config_path.exists() {
        ModelConfig::load(&config_path)?
    } else {
        warn!("No config.json at {} - using minimal metadata", config_path.display());
        ModelConfig::default()
    };
    info!(
        "Config: {} (experts: {}, used per token: {})",
        config_path.display(),
        config.num_local_experts,
        config.num_experts_per_tok
    );

    let tensors = load_checkpoint(input)?;
    let source_tensors = tensors.len();
    info!("Loaded {} tensor headers", source_tensors);

    let metadata = derive_metadata(
        config.base_metadata(),
        config.num_local_experts,
        config.num_experts_per_tok,
    );

    let aggregation = ExpertAggregator::new(config.num_local_experts)
        .strict(options.strict)
        .aggregate(tensors)?;
    if options.strict {
        aggregation.validate(config.num_local_experts)?;
        info!("Strict expert validation passed");
    }
    let expert_groups = aggregation.groups.len();
    info!(
        "Stacked {} expert groups, {} tensors pass through",
        expert_groups,
        aggregation.remainder.len()
    );

    let mut writer = GgufWriter::new().with_alignment(options.alignment)?;
    let metadata_entries = metadata.len();
    writer.extend_metadata(metadata);
    for entry in aggregation.into_entries(&LlamaNamer::default()) {
        writer.add_tensor(entry);
    }
    let output_tensors = writer.tensors().len();

    info!("Writing GGUF file: {}", output.display());
    let bytes_written = writer.write_to_file(output)?;

    let written = read_gguf_file(output)?;
    if written.tensors.len() != output_tensors {
        return Err(ConvertError::MalformedGguf(format!(
            "expected {} tensors after writing, found {}",
            output_tensors,
            written.tensors.len()
        )));
    }

    Ok(ConversionReport {
        source: input.to_path_buf(),
        output: output.to_path_buf(),
        source_tensors,
        expert_groups,
        output_tensors,
        metadata_entries,
        bytes_written,
    })
}

/// Write `<output>.meta.json` describing the conversion.
pub fn write_sidecar(report: &ConversionReport) -> Result<PathBuf> {
    let meta = serde_json::json!({
        "source": report.source.display().to_string(),
        "format": "gguf",
        "version": crate::writer::GGUF_VERSION,
        "tensors": report.output_tensors,
        "source_tensors": report.source_tensors,
        "expert_groups": report.expert_groups,
        "metadata_entries": report.metadata_entries,
        "bytes": report.bytes_written,
        "conversion_tool": env!("CARGO_PKG_NAME"),
        "conversion_version": env!("CARGO_PKG_VERSION"),
    });

    let meta_path = report.output.with_extension("gguf.meta.json");
    let body = serde_json::to_string_pretty(&meta).map_err(std::io::Error::other)?;
    fs::write(&meta_path, body)?;
    Ok(meta_path)
}
