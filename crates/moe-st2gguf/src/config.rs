//! Model configuration (`config.json`) and conversion options.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, Result};
use crate::metadata::{ARCHITECTURE, MetadataMap, MetadataValue};

/// Hyperparameters read from a Hugging Face `config.json`.
///
/// Every field is optional in the file; absent counts read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub architectures: Vec<String>,
    pub model_type: Option<String>,
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub num_hidden_layers: u32,
    pub num_attention_heads: u32,
    pub num_key_value_heads: u32,
    pub max_position_embeddings: u32,
    pub vocab_size: u32,
    pub rms_norm_eps: Option<f32>,
    pub rope_theta: Option<f32>,
    pub num_local_experts: u32,
    pub num_experts_per_tok: u32,
}

impl ModelConfig {
    /// Parse `config.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
            .map_err(|source| ConvertError::Config { path: path.to_path_buf(), source })
    }

    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Whether the checkpoint declares any experts.
    pub fn is_moe(&self) -> bool {
        self.num_local_experts > 0
    }

    /// Base llama metadata; zero or absent values are skipped.
    pub fn base_metadata(&self) -> MetadataMap {
        let mut kv = MetadataMap::new();
        kv.insert("general.architecture".into(), ARCHITECTURE.into());
        let name = self.model_type.as_deref().or(self.architectures.first().map(String::as_str));
        if let Some(name) = name {
            kv.insert("general.name".into(), name.into());
        }

        let mut put = |key: &str, v: u32| {
            if v > 0 {
                kv.insert(format!("{ARCHITECTURE}.{key}"), MetadataValue::U32(v));
            }
        };
        put("vocab_size", self.vocab_size);
        put("context_length", self.max_position_embeddings);
        put("embedding_length", self.hidden_size);
        put("block_count", self.num_hidden_layers);
        put("feed_forward_length", self.intermediate_size);
        put("attention.head_count", self.num_attention_heads);
        put("attention.head_count_kv", self.num_key_value_heads);
        if self.num_attention_heads > 0 {
            put("rope.dimension_count", self.hidden_size / self.num_attention_heads);
        }

        if let Some(theta) = self.rope_theta {
            kv.insert(format!("{ARCHITECTURE}.rope.freq_base"), theta.into());
        }
        if let Some(eps) = self.rms_norm_eps {
            kv.insert(format!("{ARCHITECTURE}.attention.layer_norm_rms_epsilon"), eps.into());
        }
        kv
    }
}

/// Default tensor data alignment in a GGUF file.
pub const DEFAULT_ALIGNMENT: u32 = 32;

/// Knobs for a single conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Reject incomplete or ragged expert groups instead of warning.
    pub strict: bool,
    /// Tensor data alignment in bytes; must be a power of two.
    pub alignment: u32,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self { strict: false, alignment: DEFAULT_ALIGNMENT }
    }
}
