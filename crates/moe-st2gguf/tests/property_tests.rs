//! Property-based tests for expert name canonicalization and aggregation.
//!
//! # Key invariants
//! - Every in-range expert shard of one layer/projection maps to the same
//!   canonical name, and different layers or projections never collide
//! - Aggregation output does not depend on the order shards arrive in
//! - Non-expert tensors pass through with name, kind, shape and source intact
//! - Zero expert counts leave metadata untouched

use std::sync::Arc;

use moe_st2gguf::experts::{ExpertAggregator, aggregate_tensors};
use moe_st2gguf::metadata::{MetadataMap, MetadataValue, derive_metadata};
use moe_st2gguf::naming::{EXPERT_MARKER, ExpertNamer, PassThrough};
use moe_st2gguf::source::{SourceTensor, kind};
use moe_st2gguf::tensor::WriteTo;
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn projection_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("w1"), Just("w2"), Just("w3")]
}

/// Dense tensor names that never carry the expert marker.
fn dense_name_strategy() -> impl Strategy<Value = String> {
    (
        0u32..64,
        prop_oneof![
            Just("self_attn.q_proj"),
            Just("self_attn.o_proj"),
            Just("input_layernorm"),
            Just("post_attention_layernorm"),
            Just("block_sparse_moe.gate"),
            Just("mlp.up_proj"),
        ],
    )
        .prop_map(|(layer, part)| format!("model.layers.{layer}.{part}.weight"))
}

fn expert_name(layer: u32, index: u32, proj: &str) -> String {
    format!("model.layers.{layer}.block_sparse_moe.experts.{index}.{proj}.weight")
}

fn produce(w: &dyn WriteTo) -> Vec<u8> {
    let mut out = Vec::new();
    w.write_to(&mut out).unwrap();
    out
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

proptest! {
    /// All in-range indices of one layer/projection share a canonical name.
    #[test]
    fn in_range_indices_share_canonical_name(
        layer in 0u32..128,
        count in 1u32..64,
        a in 0u32..64,
        b in 0u32..64,
        proj in projection_strategy(),
    ) {
        let (a, b) = (a % count, b % count);
        let namer = ExpertNamer::new(count);
        let na = namer.canonicalize(&expert_name(layer, a, proj)).unwrap();
        let nb = namer.canonicalize(&expert_name(layer, b, proj)).unwrap();
        prop_assert_eq!(&na.canonical, &nb.canonical);
        prop_assert!(na.stripped && nb.stripped);
        prop_assert_eq!(na.index, Some(a));
        prop_assert!(!na.canonical.contains(EXPERT_MARKER));
    }

    /// Different layers or projections never collide.
    #[test]
    fn distinct_weights_get_distinct_names(
        l1 in 0u32..64,
        l2 in 0u32..64,
        p1 in projection_strategy(),
        p2 in projection_strategy(),
    ) {
        prop_assume!(l1 != l2 || p1 != p2);
        let namer = ExpertNamer::new(8);
        let n1 = namer.canonicalize(&expert_name(l1, 0, p1)).unwrap();
        let n2 = namer.canonicalize(&expert_name(l2, 0, p2)).unwrap();
        prop_assert_ne!(n1.canonical, n2.canonical);
    }

    /// Indices at or above the declared count are never stripped.
    #[test]
    fn out_of_range_index_is_not_stripped(count in 0u32..32, extra in 0u32..32) {
        let index = count + extra;
        let got = ExpertNamer::new(count).canonicalize(&expert_name(0, index, "w1")).unwrap();
        prop_assert!(!got.stripped);
        let marker = format!("{EXPERT_MARKER}{index}.");
        prop_assert!(got.canonical.contains(&marker));
    }

    #[test]
    fn dense_names_are_not_experts(name in dense_name_strategy()) {
        prop_assert!(ExpertNamer::new(8).canonicalize(&name).is_none());
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

proptest! {
    /// Shuffling source order changes neither group order within a layer
    /// nor the bytes each group produces.
    #[test]
    fn shuffled_input_produces_identical_payloads(
        count in 1u32..8,
        seed in prop::collection::vec(any::<u32>(), 24),
    ) {
        let mut tensors = Vec::new();
        for proj in ["w1", "w2", "w3"] {
            for e in 0..count {
                let fill = (e as u8).wrapping_mul(17).wrapping_add(proj.as_bytes()[1]);
                let name = expert_name(0, e, proj);
                tensors.push(SourceTensor::from_bytes(name, kind::F16, vec![2, 2], vec![fill; 8]));
            }
        }

        let mut shuffled: Vec<(u32, SourceTensor)> =
            tensors.iter().cloned().enumerate().map(|(i, t)| (seed[i % seed.len()], t)).collect();
        shuffled.sort_by_key(|(k, _)| *k);
        let shuffled: Vec<SourceTensor> = shuffled.into_iter().map(|(_, t)| t).collect();

        let mut a = aggregate_tensors(tensors, count, &PassThrough).unwrap();
        let mut b = aggregate_tensors(shuffled, count, &PassThrough).unwrap();
        // First-seen group order may differ; compare by name.
        a.sort_by(|x, y| x.name.cmp(&y.name));
        b.sort_by(|x, y| x.name.cmp(&y.name));

        prop_assert_eq!(a.len(), 3);
        prop_assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            prop_assert_eq!(&x.name, &y.name);
            prop_assert_eq!(x.experts, Some(u64::from(count)));
            prop_assert_eq!(produce(x.data.as_ref()), produce(y.data.as_ref()));
        }
    }

    /// The stacked payload is exactly the members' payloads back to back.
    #[test]
    fn stacked_length_is_sum_of_members(lens in prop::collection::vec(1usize..64, 1..8)) {
        let count = lens.len() as u32;
        let tensors: Vec<SourceTensor> = lens
            .iter()
            .enumerate()
            .map(|(e, &len)| {
                let name = expert_name(3, e as u32, "w2");
                SourceTensor::from_bytes(name, kind::I8, vec![len as u64], vec![e as u8; len])
            })
            .collect();

        let entries = aggregate_tensors(tensors, count, &PassThrough).unwrap();
        prop_assert_eq!(entries.len(), 1);
        let bytes = produce(entries[0].data.as_ref());
        prop_assert_eq!(bytes.len(), lens.iter().sum::<usize>());
        prop_assert_eq!(entries[0].byte_len(), bytes.len() as u64);

        let want: Vec<u8> =
            lens.iter().enumerate().flat_map(|(e, &len)| vec![e as u8; len]).collect();
        prop_assert_eq!(bytes, want);
    }

    /// Tensors without the expert marker come back untouched and in order.
    #[test]
    fn dense_tensors_pass_through(
        names in prop::collection::vec(dense_name_strategy(), 0..16),
        count in 0u32..8,
    ) {
        let tensors: Vec<SourceTensor> = names
            .iter()
            .map(|n| SourceTensor::from_bytes(n.clone(), kind::BF16, vec![2], vec![0; 4]))
            .collect();

        let agg = ExpertAggregator::new(count).aggregate(tensors.clone()).unwrap();
        prop_assert!(agg.groups.is_empty());
        prop_assert_eq!(agg.remainder.len(), tensors.len());
        for (got, want) in agg.remainder.iter().zip(&tensors) {
            prop_assert_eq!(&got.name, &want.name);
            prop_assert_eq!(got.kind, want.kind);
            prop_assert_eq!(&got.shape, &want.shape);
            prop_assert!(Arc::ptr_eq(&got.source, &want.source));
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

fn metadata_strategy() -> impl Strategy<Value = MetadataMap> {
    let key = "[a-z]{1,8}\\.[a-z_]{1,12}";
    prop::collection::btree_map(key, any::<u32>().prop_map(MetadataValue::U32), 0..12)
}

proptest! {
    #[test]
    fn zero_counts_are_identity(base in metadata_strategy()) {
        prop_assert_eq!(derive_metadata(base.clone(), 0, 0), base);
    }

    /// Derivation only ever adds the two MoE keys.
    #[test]
    fn derivation_adds_at_most_two_keys(base in metadata_strategy(), n in 0u32..16, k in 0u32..4) {
        let derived = derive_metadata(base.clone(), n, k);
        for (key, value) in &base {
            prop_assert_eq!(derived.get(key), Some(value));
        }
        let added = usize::from(n > 0) + usize::from(k > 0);
        prop_assert_eq!(derived.len(), base.len() + added);
    }
}
