//! Output tensor descriptors handed to the container writer.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Deferred payload producer for one output tensor.
///
/// Implementations stream their bytes into `w` when the container writer
/// reaches the tensor's data section. Producers hold no mutable state, so
/// distinct producers may run on different threads.
pub trait WriteTo: Send + Sync {
    /// Number of bytes [`WriteTo::write_to`] will emit.
    fn byte_len(&self) -> u64;

    /// Write the payload and return the number of bytes written.
    fn write_to(&self, w: &mut dyn Write) -> io::Result<u64>;
}

/// A named tensor ready for serialization.
///
/// For consolidated expert tensors `shape` is the per-expert shape and
/// `experts` carries the implicit leading dimension.
#[derive(Clone)]
pub struct TensorEntry {
    pub name: String,
    pub kind: u32,
    pub shape: Vec<u64>,
    pub experts: Option<u64>,
    pub data: Arc<dyn WriteTo>,
}

impl TensorEntry {
    pub fn new(
        name: impl Into<String>,
        kind: u32,
        shape: Vec<u64>,
        data: Arc<dyn WriteTo>,
    ) -> Self {
        Self { name: name.into(), kind, shape, experts: None, data }
    }

    pub fn with_experts(mut self, experts: u64) -> Self {
        self.experts = Some(experts);
        self
    }

    /// Shape as stored on disk, outermost dimension first.
    pub fn stored_shape(&self) -> Vec<u64> {
        match self.experts {
            Some(n) => std::iter::once(n).chain(self.shape.iter().copied()).collect(),
            None => self.shape.clone(),
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.data.byte_len()
    }
}

impl fmt::Debug for TensorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("shape", &self.shape)
            .field("experts", &self.experts)
            .field("bytes", &self.data.byte_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceTensor, kind};

    #[test]
    fn stored_shape_prepends_expert_dimension() {
        let t = SourceTensor::from_bytes("x", kind::F16, vec![4, 8], vec![0u8; 64]);
        let entry = TensorEntry::new("blk.0.ffn_up_exps", kind::F16, vec![4, 8], Arc::new(t));
        assert_eq!(entry.stored_shape(), vec![4, 8]);
        assert_eq!(entry.clone().with_experts(8).stored_shape(), vec![8, 4, 8]);
    }
}
