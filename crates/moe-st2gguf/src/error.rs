//! Error types for checkpoint loading, expert aggregation and GGUF writing.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the conversion library.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no *.safetensors shards found in {0}")]
    NoShards(PathBuf),

    #[error("invalid safetensors header in {path}: {reason}")]
    SafeTensors { path: PathBuf, reason: String },

    #[error("unsupported dtype {dtype} for tensor `{name}`")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("failed to read config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("expert group `{name}` has {found} members, expected {expected}")]
    IncompleteExpertGroup { name: String, expected: usize, found: usize },

    #[error("expert group `{name}`: expert {index} has shape {found:?}, expected {expected:?}")]
    ExpertShapeMismatch { name: String, index: u32, expected: Vec<u64>, found: Vec<u64> },

    #[error("expert group `{name}`: expert {index} has kind {found}, expected {expected}")]
    ExpertKindMismatch { name: String, index: u32, expected: u32, found: u32 },

    #[error("expert group `{name}`: expert {index} appears more than once")]
    DuplicateExpert { name: String, index: u32 },

    #[error("tensor `{name}` uses expert {index}, but the model declares {expert_count} experts")]
    ExpertIndexOutOfRange { name: String, index: u32, expert_count: u32 },

    #[error("tensor `{name}` has no parseable expert index")]
    InvalidExpertIndex { name: String },

    #[error("tensor `{name}` wrote {written} bytes, declared {declared}")]
    TensorSizeMismatch { name: String, declared: u64, written: u64 },

    #[error("alignment must be a non-zero power of two, got {0}")]
    InvalidAlignment(u32),

    #[error("malformed GGUF: {0}")]
    MalformedGguf(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
