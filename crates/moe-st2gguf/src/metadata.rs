//! Model metadata and the MoE metadata deriver.

use std::collections::BTreeMap;

/// Architecture namespace Mixtral checkpoints are written under.
pub const ARCHITECTURE: &str = "llama";

/// Number of experts per MoE layer.
pub const EXPERT_COUNT_KEY: &str = "llama.attention.expert_count";
/// Number of experts routed per token.
pub const EXPERT_USED_COUNT_KEY: &str = "llama.attention.expert_used_count";

/// A GGUF metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    F32(f32),
    String(String),
    StringArray(Vec<String>),
    I32Array(Vec<i32>),
    F32Array(Vec<f32>),
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<f32> for MetadataValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Key-ordered metadata map.
pub type MetadataMap = BTreeMap<String, MetadataValue>;

/// Extend `base` with MoE keys.
///
/// Each key is added only when its count is non-zero; a missing key means
/// the model is not a Mixture-of-Experts model.
pub fn derive_metadata(mut base: MetadataMap, expert_count: u32, experts_used: u32) -> MetadataMap {
    if expert_count > 0 {
        base.insert(EXPERT_COUNT_KEY.to_string(), MetadataValue::U32(expert_count));
    }
    if experts_used > 0 {
        base.insert(EXPERT_USED_COUNT_KEY.to_string(), MetadataValue::U32(experts_used));
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> MetadataMap {
        let mut m = MetadataMap::new();
        m.insert("general.architecture".into(), ARCHITECTURE.into());
        m.insert("llama.block_count".into(), 32u32.into());
        m
    }

    #[test]
    fn zero_counts_leave_base_untouched() {
        assert_eq!(derive_metadata(base(), 0, 0), base());
    }

    #[test]
    fn mixtral_counts_are_added() {
        let m = derive_metadata(base(), 8, 2);
        assert_eq!(m.get(EXPERT_COUNT_KEY), Some(&MetadataValue::U32(8)));
        assert_eq!(m.get(EXPERT_USED_COUNT_KEY), Some(&MetadataValue::U32(2)));
        assert_eq!(m.len(), base().len() + 2);
    }

    #[test]
    fn keys_are_independent() {
        let only_count = derive_metadata(base(), 4, 0);
        assert!(only_count.contains_key(EXPERT_COUNT_KEY));
        assert!(!only_count.contains_key(EXPERT_USED_COUNT_KEY));

        let only_used = derive_metadata(base(), 0, 2);
        assert!(!only_used.contains_key(EXPERT_COUNT_KEY));
        assert!(only_used.contains_key(EXPERT_USED_COUNT_KEY));
    }

    #[test]
    fn derived_value_overrides_stale_base_entry() {
        let mut b = base();
        b.insert(EXPERT_COUNT_KEY.into(), 2u32.into());
        let m = derive_metadata(b, 8, 0);
        assert_eq!(m[EXPERT_COUNT_KEY], MetadataValue::U32(8));
    }
}
