//! Tensor name canonicalization.
//!
//! Expert shards are recognized structurally: the expert index is parsed
//! out of the name rather than matched against one literal pattern per
//! index, so `experts.1.` and `experts.10.` can never be confused.
//! Non-expert tensors go through a [`TensorNamer`], the seam where the
//! base architecture's naming scheme plugs in.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::source::SourceTensor;
use crate::tensor::TensorEntry;

/// Segment that marks a tensor as one expert's shard.
pub const EXPERT_MARKER: &str = ".block_sparse_moe.experts.";

/// Source projection name → output role for stacked expert weights.
const EXPERT_PROJECTIONS: &[(&str, &str)] =
    &[("w1", "ffn_gate_exps"), ("w2", "ffn_down_exps"), ("w3", "ffn_up_exps")];

static EXPERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<head>.+?)\.block_sparse_moe\.experts\.(?P<index>[0-9]+)\.(?P<tail>.+)$")
        .expect("expert pattern is valid")
});

/// Canonical identity of one expert shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertName {
    /// Output name shared by every expert of the same logical weight.
    pub canonical: String,
    /// Expert index parsed from the source name, when it had one.
    pub index: Option<u32>,
    /// Whether the expert segment was stripped (index within the declared count).
    pub stripped: bool,
}

/// Maps expert shard names to the stacked tensor they belong to.
#[derive(Debug, Clone, Copy)]
pub struct ExpertNamer {
    expert_count: u32,
}

impl ExpertNamer {
    pub fn new(expert_count: u32) -> Self {
        Self { expert_count }
    }

    pub fn expert_count(&self) -> u32 {
        self.expert_count
    }

    /// Whether `name` belongs to an expert shard.
    pub fn is_expert(name: &str) -> bool {
        name.contains(EXPERT_MARKER)
    }

    /// Canonicalize an expert shard name; `None` for non-expert tensors.
    ///
    /// `model.layers.3.block_sparse_moe.experts.5.w2.weight` becomes
    /// `blk.3.ffn_down_exps` with index 5. An index outside
    /// `0..expert_count` keeps its expert segment, so every such shard ends
    /// up in a group of its own.
    pub fn canonicalize(&self, name: &str) -> Option<ExpertName> {
        if !Self::is_expert(name) {
            return None;
        }

        let Some(caps) = EXPERT_RE.captures(name) else {
            return Some(ExpertName {
                canonical: rewrite_layer_prefix(name),
                index: None,
                stripped: false,
            });
        };

        let head = rewrite_layer_prefix(&caps["head"]);
        let tail = rewrite_projection(&caps["tail"]);
        let index = caps["index"].parse::<u32>().ok();

        match index {
            Some(i) if i < self.expert_count => {
                Some(ExpertName { canonical: format!("{head}.{tail}"), index, stripped: true })
            }
            _ => Some(ExpertName {
                canonical: format!("{head}{EXPERT_MARKER}{}.{tail}", &caps["index"]),
                index,
                stripped: false,
            }),
        }
    }
}

fn rewrite_layer_prefix(path: &str) -> String {
    match path.strip_prefix("model.layers.") {
        Some(rest) => format!("blk.{rest}"),
        None => path.to_string(),
    }
}

fn rewrite_projection(tail: &str) -> String {
    let mut segments: Vec<&str> = tail.split('.').collect();
    if segments.len() > 1 && segments.last() == Some(&"weight") {
        segments.pop();
    }
    if let Some(first) = segments.first_mut()
        && let Some(&(_, role)) = EXPERT_PROJECTIONS.iter().find(|(src, _)| *src == *first)
    {
        *first = role;
    }
    segments.join(".")
}

/// Deterministic multi-pattern literal replacement.
///
/// At every position the longest matching pattern wins and matches never
/// overlap, so the result does not depend on the order rules were given in.
#[derive(Debug, Clone)]
pub struct Replacer {
    rules: Vec<(String, String)>,
}

impl Replacer {
    pub fn new<I, A, B>(rules: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut rules: Vec<(String, String)> = rules
            .into_iter()
            .map(|(a, b)| (a.into(), b.into()))
            .filter(|(a, _)| !a.is_empty())
            .collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { rules }
    }

    pub fn replace(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        'scan: while let Some(c) = rest.chars().next() {
            for (from, to) in &self.rules {
                if rest.starts_with(from.as_str()) {
                    out.push_str(to);
                    rest = &rest[from.len()..];
                    continue 'scan;
                }
            }
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }
}

/// Naming step for tensors that are not expert shards.
pub trait TensorNamer {
    fn name_tensors(&self, tensors: Vec<SourceTensor>) -> Vec<TensorEntry>;
}

/// Keeps every name verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl TensorNamer for PassThrough {
    fn name_tensors(&self, tensors: Vec<SourceTensor>) -> Vec<TensorEntry> {
        tensors.into_iter().map(|t| entry_for(t.name.clone(), t)).collect()
    }
}

/// Hugging Face llama names → GGUF names.
#[derive(Debug, Clone)]
pub struct LlamaNamer {
    replacer: Replacer,
}

impl Default for LlamaNamer {
    fn default() -> Self {
        Self {
            replacer: Replacer::new([
                ("model.layers", "blk"),
                ("model.embed_tokens", "token_embd"),
                ("model.norm", "output_norm"),
                ("lm_head", "output"),
                ("self_attn.q_proj", "attn_q"),
                ("self_attn.k_proj", "attn_k"),
                ("self_attn.v_proj", "attn_v"),
                ("self_attn.o_proj", "attn_output"),
                ("mlp.gate_proj", "ffn_gate"),
                ("mlp.down_proj", "ffn_down"),
                ("mlp.up_proj", "ffn_up"),
                ("input_layernorm", "attn_norm"),
                ("post_attention_layernorm", "ffn_norm"),
                ("block_sparse_moe.gate", "ffn_gate_inp"),
            ]),
        }
    }
}

impl LlamaNamer {
    pub fn rename(&self, name: &str) -> String {
        self.replacer.replace(name)
    }
}

impl TensorNamer for LlamaNamer {
    fn name_tensors(&self, tensors: Vec<SourceTensor>) -> Vec<TensorEntry> {
        tensors
            .into_iter()
            .map(|t| {
                let name = self.rename(&t.name);
                tracing::debug!(from = %t.name, to = %name, "renamed tensor");
                entry_for(name, t)
            })
            .collect()
    }
}

fn entry_for(name: String, tensor: SourceTensor) -> TensorEntry {
    let kind = tensor.kind;
    let shape = tensor.shape.clone();
    TensorEntry::new(name, kind, shape, Arc::new(tensor))
}
