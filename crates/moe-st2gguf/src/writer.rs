//! Streaming GGUF v3 writer.
//!
//! Metadata and tensor descriptors are collected up front; tensor payloads
//! are pulled from each entry's producer only while the data section is
//! being written, one tensor at a time.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::DEFAULT_ALIGNMENT;
use crate::error::{ConvertError, Result};
use crate::metadata::{MetadataMap, MetadataValue};
use crate::tensor::TensorEntry;

pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
pub const GGUF_VERSION: u32 = 3;

/// GGUF metadata value type ids.
mod value_type {
    pub const U32: u32 = 4;
    pub const I32: u32 = 5;
    pub const F32: u32 = 6;
    pub const BOOL: u32 = 7;
    pub const STRING: u32 = 8;
    pub const ARRAY: u32 = 9;
    pub const U64: u32 = 10;
}

/// Round `offset` up to the next multiple of `align`.
pub fn align_up(offset: u64, align: u64) -> u64 {
    if align == 0 {
        return offset;
    }
    offset.div_ceil(align) * align
}

/// Tracks the number of bytes passed through.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Collects metadata and tensors, then serializes a GGUF file.
pub struct GgufWriter {
    pub metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<TensorEntry>,
    alignment: u32,
}

impl Default for GgufWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl GgufWriter {
    pub fn new() -> Self {
        Self { metadata: Vec::new(), tensors: Vec::new(), alignment: DEFAULT_ALIGNMENT }
    }

    /// Set tensor data alignment; must be a non-zero power of two.
    pub fn with_alignment(mut self, alignment: u32) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(ConvertError::InvalidAlignment(alignment));
        }
        self.alignment = alignment;
        Ok(self)
    }

    /// Add or replace a metadata entry.
    pub fn add_metadata(&mut self, key: &str, value: MetadataValue) {
        match self.metadata.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.metadata.push((key.to_string(), value)),
        }
    }

    pub fn extend_metadata(&mut self, map: MetadataMap) {
        for (k, v) in map {
            self.add_metadata(&k, v);
        }
    }

    pub fn add_tensor(&mut self, tensor: TensorEntry) {
        self.tensors.push(tensor);
    }

    pub fn tensors(&self) -> &[TensorEntry] {
        &self.tensors
    }

    /// Serialize to `w` and return the total number of bytes written.
    ///
    /// The first producer failure aborts the write; whatever reached `w`
    /// up to that point is not a valid file.
    pub fn write<W: Write>(&self, w: W) -> Result<u64> {
        let mut w = CountingWriter { inner: w, written: 0 };
        let align = u64::from(self.alignment);

        let mut metadata = self.metadata.clone();
        let has_alignment_key = metadata.iter().any(|(k, _)| k == "general.alignment");
        if self.alignment != DEFAULT_ALIGNMENT && !has_alignment_key {
            metadata.push(("general.alignment".to_string(), MetadataValue::U32(self.alignment)));
        }

        w.write_all(&GGUF_MAGIC)?;
        w.write_all(&GGUF_VERSION.to_le_bytes())?;
        w.write_all(&(self.tensors.len() as u64).to_le_bytes())?;
        w.write_all(&(metadata.len() as u64).to_le_bytes())?;

        for (key, value) in &metadata {
            write_string(&mut w, key)?;
            write_value(&mut w, value)?;
        }

        let mut offsets = Vec::with_capacity(self.tensors.len());
        let mut next = 0u64;
        for t in &self.tensors {
            let offset = align_up(next, align);
            let dims = t.stored_shape();
            write_string(&mut w, &t.name)?;
            w.write_all(&(dims.len() as u32).to_le_bytes())?;
            // GGUF stores the innermost dimension first.
            for d in dims.iter().rev() {
                w.write_all(&d.to_le_bytes())?;
            }
            w.write_all(&t.kind.to_le_bytes())?;
            w.write_all(&offset.to_le_bytes())?;
            offsets.push(offset);
            next = offset + t.byte_len();
        }

        let data_start = align_up(w.written, align);
        pad_to(&mut w, data_start)?;
        debug!(data_start, tensors = self.tensors.len(), "writing tensor data");

        for (t, &offset) in self.tensors.iter().zip(&offsets) {
            pad_to(&mut w, data_start + offset)?;
            let declared = t.byte_len();
            let written = t.data.write_to(&mut w)?;
            if written != declared {
                return Err(ConvertError::TensorSizeMismatch {
                    name: t.name.clone(),
                    declared,
                    written,
                });
            }
            debug!(tensor = %t.name, bytes = written, "wrote tensor");
        }

        w.flush()?;
        Ok(w.written)
    }

    /// Write to `path`, removing the file again if anything fails.
    pub fn write_to_file(&self, path: &Path) -> Result<u64> {
        let file = File::create(path)?;
        let result = self.write(BufWriter::new(file));
        match result {
            Ok(n) => {
                info!("Wrote {} bytes to {}", n, path.display());
                Ok(n)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(path) {
                    warn!("failed to remove partial output {}: {}", path.display(), rm);
                }
                Err(e)
            }
        }
    }
}

fn pad_to<W: Write>(w: &mut CountingWriter<W>, target: u64) -> io::Result<()> {
    const ZEROS: [u8; 64] = [0; 64];
    while w.written < target {
        let n = (target - w.written).min(ZEROS.len() as u64) as usize;
        w.write_all(&ZEROS[..n])?;
    }
    Ok(())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn write_value<W: Write>(w: &mut W, value: &MetadataValue) -> io::Result<()> {
    match value {
        MetadataValue::Bool(v) => {
            w.write_all(&value_type::BOOL.to_le_bytes())?;
            w.write_all(&[u8::from(*v)])
        }
        MetadataValue::U32(v) => {
            w.write_all(&value_type::U32.to_le_bytes())?;
            w.write_all(&v.to_le_bytes())
        }
        MetadataValue::I32(v) => {
            w.write_all(&value_type::I32.to_le_bytes())?;
            w.write_all(&v.to_le_bytes())
        }
        MetadataValue::U64(v) => {
            w.write_all(&value_type::U64.to_le_bytes())?;
            w.write_all(&v.to_le_bytes())
        }
        MetadataValue::F32(v) => {
            w.write_all(&value_type::F32.to_le_bytes())?;
            w.write_all(&v.to_le_bytes())
        }
        MetadataValue::String(s) => {
            w.write_all(&value_type::STRING.to_le_bytes())?;
            write_string(w, s)
        }
        MetadataValue::StringArray(items) => {
            write_array_header(w, value_type::STRING, items.len())?;
            items.iter().try_for_each(|s| write_string(w, s))
        }
        MetadataValue::I32Array(items) => {
            write_array_header(w, value_type::I32, items.len())?;
            items.iter().try_for_each(|v| w.write_all(&v.to_le_bytes()))
        }
        MetadataValue::F32Array(items) => {
            write_array_header(w, value_type::F32, items.len())?;
            items.iter().try_for_each(|v| w.write_all(&v.to_le_bytes()))
        }
    }
}

fn write_array_header<W: Write>(w: &mut W, elem: u32, len: usize) -> io::Result<()> {
    w.write_all(&value_type::ARRAY.to_le_bytes())?;
    w.write_all(&elem.to_le_bytes())?;
    w.write_all(&(len as u64).to_le_bytes())
}
