//! Expert aggregation: regroup per-expert shards into stacked tensors.
//!
//! Mixtral checkpoints store every expert's FFN projections as separate
//! tensors (`model.layers.L.block_sparse_moe.experts.E.wN.weight`). GGUF
//! expects one tensor per layer and projection with the experts stacked
//! along the outermost dimension. [`ExpertAggregator`] partitions the source
//! tensors in a single pass and builds one [`ExpertGroup`] per canonical
//! name; each group streams its members' payloads, in expert-index order,
//! when the container writer asks for the data.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ConvertError, Result};
use crate::naming::{ExpertNamer, TensorNamer};
use crate::source::{SourceTensor, copy_source};
use crate::tensor::{TensorEntry, WriteTo};

/// One expert's shard inside a group.
#[derive(Debug, Clone)]
pub struct ExpertMember {
    /// Index parsed from the source name.
    pub index: Option<u32>,
    pub tensor: SourceTensor,
}

/// All shards of one logical weight, ordered by expert index.
#[derive(Debug, Clone)]
pub struct ExpertGroup {
    name: String,
    members: Vec<ExpertMember>,
}

impl ExpertGroup {
    fn new(name: String) -> Self {
        Self { name, members: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[ExpertMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Kind of the first member.
    pub fn kind(&self) -> u32 {
        self.members.first().map_or(0, |m| m.tensor.kind)
    }

    /// Per-expert shape, taken from the first member.
    pub fn shape(&self) -> Vec<u64> {
        self.members.first().map(|m| m.tensor.shape.clone()).unwrap_or_default()
    }

    /// Stable sort by expert index; shards without an index go last.
    fn sort_members(&mut self) {
        self.members.sort_by_key(|m| m.index.unwrap_or(u32::MAX));
    }

    /// Check that the group holds exactly `expert_count` distinct experts
    /// with a uniform kind and shape.
    pub fn validate(&self, expert_count: u32) -> Result<()> {
        for pair in self.members.windows(2) {
            if let (Some(a), Some(b)) = (pair[0].index, pair[1].index)
                && a == b
            {
                return Err(ConvertError::DuplicateExpert { name: self.name.clone(), index: b });
            }
        }

        if self.members.len() != expert_count as usize {
            return Err(ConvertError::IncompleteExpertGroup {
                name: self.name.clone(),
                expected: expert_count as usize,
                found: self.members.len(),
            });
        }

        let (kind, shape) = (self.kind(), self.shape());
        for m in &self.members {
            let index = m.index.unwrap_or(u32::MAX);
            if m.tensor.kind != kind {
                return Err(ConvertError::ExpertKindMismatch {
                    name: self.name.clone(),
                    index,
                    expected: kind,
                    found: m.tensor.kind,
                });
            }
            if m.tensor.shape != shape {
                return Err(ConvertError::ExpertShapeMismatch {
                    name: self.name.clone(),
                    index,
                    expected: shape.clone(),
                    found: m.tensor.shape.clone(),
                });
            }
        }
        Ok(())
    }

    /// Whether any member's kind differs from the first member's.
    pub fn has_mixed_kinds(&self) -> bool {
        let kind = self.kind();
        self.members.iter().any(|m| m.tensor.kind != kind)
    }

    /// Whether any member's shape differs from the first member's.
    pub fn has_mixed_shapes(&self) -> bool {
        let shape = self.shape();
        self.members.iter().any(|m| m.tensor.shape != shape)
    }

    /// Log the anomalies [`ExpertGroup::validate`] would reject.
    fn warn_anomalies(&self, expert_count: u32) {
        if self.members.len() != expert_count as usize {
            warn!(
                group = %self.name,
                found = self.members.len(),
                expected = expert_count,
                "expert group size differs from expert count"
            );
        }
        if self.has_mixed_kinds() {
            warn!(group = %self.name, "expert group members have differing kinds");
        }
        if self.has_mixed_shapes() {
            warn!(group = %self.name, "expert group members have differing shapes");
        }
    }

    /// Descriptor for the stacked tensor.
    pub fn to_entry(&self) -> TensorEntry {
        TensorEntry::new(self.name.clone(), self.kind(), self.shape(), Arc::new(self.clone()))
            .with_experts(self.members.len() as u64)
    }
}

impl WriteTo for ExpertGroup {
    fn byte_len(&self) -> u64 {
        self.members.iter().map(|m| m.tensor.byte_len()).sum()
    }

    fn write_to(&self, w: &mut dyn Write) -> io::Result<u64> {
        let mut written = 0u64;
        for m in &self.members {
            written += copy_source(m.tensor.source.as_ref(), w)?;
        }
        Ok(written)
    }
}

/// Result of partitioning a tensor list.
#[derive(Debug, Default)]
pub struct Aggregation {
    /// Expert groups in first-seen order.
    pub groups: Vec<ExpertGroup>,
    /// Tensors without the expert marker, in their original order.
    pub remainder: Vec<SourceTensor>,
}

impl Aggregation {
    /// Stacked expert entries first, then the remainder named by `namer`.
    pub fn into_entries(self, namer: &dyn TensorNamer) -> Vec<TensorEntry> {
        let mut out: Vec<TensorEntry> = self.groups.iter().map(ExpertGroup::to_entry).collect();
        out.extend(namer.name_tensors(self.remainder));
        out
    }

    /// Run [`ExpertGroup::validate`] on every group.
    pub fn validate(&self, expert_count: u32) -> Result<()> {
        self.groups.iter().try_for_each(|g| g.validate(expert_count))
    }
}

/// Groups expert shards by canonical name.
#[derive(Debug, Clone, Copy)]
pub struct ExpertAggregator {
    namer: ExpertNamer,
    strict: bool,
}

impl ExpertAggregator {
    pub fn new(expert_count: u32) -> Self {
        Self { namer: ExpertNamer::new(expert_count), strict: false }
    }

    /// Reject shards whose expert index lies outside the declared count.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn expert_count(&self) -> u32 {
        self.namer.expert_count()
    }

    /// Partition `tensors` in a single pass.
    ///
    /// Never fails in lenient mode: incomplete or ragged groups are logged
    /// and left for the consumer to reject.
    pub fn aggregate(&self, tensors: Vec<SourceTensor>) -> Result<Aggregation> {
        let mut out = Aggregation::default();
        let mut slots: HashMap<String, usize> = HashMap::new();

        for tensor in tensors {
            let Some(expert) = self.namer.canonicalize(&tensor.name) else {
                out.remainder.push(tensor);
                continue;
            };

            if !expert.stripped {
                if self.strict {
                    return Err(match expert.index {
                        Some(index) => ConvertError::ExpertIndexOutOfRange {
                            name: tensor.name,
                            index,
                            expert_count: self.expert_count(),
                        },
                        None => ConvertError::InvalidExpertIndex { name: tensor.name },
                    });
                }
                warn!(
                    tensor = %tensor.name,
                    expert_count = self.expert_count(),
                    "expert index not stripped"
                );
            }

            debug!(
                tensor = %tensor.name,
                group = %expert.canonical,
                index = ?expert.index,
                "expert shard"
            );
            let slot = *slots.entry(expert.canonical.clone()).or_insert_with(|| {
                out.groups.push(ExpertGroup::new(expert.canonical.clone()));
                out.groups.len() - 1
            });
            out.groups[slot].members.push(ExpertMember { index: expert.index, tensor });
        }

        for group in &mut out.groups {
            group.sort_members();
            group.warn_anomalies(self.expert_count());
        }

        debug!(
            groups = out.groups.len(),
            remainder = out.remainder.len(),
            "aggregated expert shards"
        );
        Ok(out)
    }
}

/// Aggregate and name in one go: stacked expert entries, then `namer`'s
/// entries for everything else.
pub fn aggregate_tensors(
    tensors: Vec<SourceTensor>,
    expert_count: u32,
    namer: &dyn TensorNamer,
) -> Result<Vec<TensorEntry>> {
    Ok(ExpertAggregator::new(expert_count).aggregate(tensors)?.into_entries(namer))
}
