//! Mixture-of-Experts SafeTensors → GGUF conversion.
//!
//! Mixtral-style checkpoints store each expert's feed-forward projections
//! as separate tensors. This crate regroups them into one stacked tensor per
//! layer and projection (`blk.L.ffn_{gate,down,up}_exps`), derives the MoE
//! metadata keys, and streams the result into a GGUF file without loading
//! the weights into memory.
//!
//! # Example
//!
//! ```
//! use moe_st2gguf::experts::ExpertAggregator;
//! use moe_st2gguf::naming::PassThrough;
//! use moe_st2gguf::source::{SourceTensor, kind};
//! use moe_st2gguf::tensor::WriteTo;
//!
//! let shard = |e: u32, fill: u8| {
//!     let name = format!("model.layers.0.block_sparse_moe.experts.{e}.w1.weight");
//!     SourceTensor::from_bytes(name, kind::F16, vec![4, 4], vec![fill; 32])
//! };
//! let tensors = vec![shard(0, 0), shard(1, 1)];
//! let entries = ExpertAggregator::new(2).aggregate(tensors)?.into_entries(&PassThrough);
//! assert_eq!(entries[0].name, "blk.0.ffn_gate_exps");
//!
//! let mut out = Vec::new();
//! assert_eq!(entries[0].data.write_to(&mut out)?, 64);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod error;
pub mod experts;
pub mod metadata;
pub mod naming;
pub mod reader;
pub mod source;
pub mod tensor;
pub mod writer;

pub use config::{ConvertOptions, ModelConfig};
pub use convert::{ConversionReport, convert_checkpoint};
pub use error::{ConvertError, Result};
pub use experts::{Aggregation, ExpertAggregator, ExpertGroup, aggregate_tensors};
pub use metadata::{MetadataMap, MetadataValue, derive_metadata};
pub use source::SourceTensor;
pub use tensor::{TensorEntry, WriteTo};
