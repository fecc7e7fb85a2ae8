//! Source tensor handles with lazily read payloads.
//!
//! A [`SourceTensor`] never owns its bytes: it points at a [`ByteSource`]
//! that is opened only when a producer streams the payload into the output.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::tensor::WriteTo;

/// GGML tensor type ids for the dtypes a SafeTensors checkpoint may carry.
pub mod kind {
    pub const F32: u32 = 0;
    pub const F16: u32 = 1;
    pub const I8: u32 = 24;
    pub const I16: u32 = 25;
    pub const I32: u32 = 26;
    pub const I64: u32 = 27;
    pub const F64: u32 = 28;
    pub const BF16: u32 = 30;
}

/// A readable payload of known length.
pub trait ByteSource: fmt::Debug + Send + Sync {
    /// Payload length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a fresh reader positioned at the first payload byte.
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;
}

/// Payload held in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct MemorySource(Vec<u8>);

impl MemorySource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemorySource({} bytes)", self.0.len())
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(self.0.as_slice()))
    }
}

/// A byte range inside a file, read on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRange {
    path: PathBuf,
    offset: u64,
    len: u64,
}

impl FileRange {
    pub fn new(path: impl Into<PathBuf>, offset: u64, len: u64) -> Self {
        Self { path: path.into(), offset, len }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl ByteSource for FileRange {
    fn len(&self) -> u64 {
        self.len
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        Ok(Box::new(file.take(self.len)))
    }
}

/// Stream `source` into `w`, failing if fewer bytes than declared arrive.
pub(crate) fn copy_source(source: &dyn ByteSource, w: &mut dyn Write) -> io::Result<u64> {
    let expected = source.len();
    let mut reader = source.open()?;
    let copied = io::copy(&mut reader.as_mut().take(expected), w)?;
    if copied != expected {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {copied} of {expected} bytes"),
        ));
    }
    Ok(copied)
}

/// One stored weight tensor from the input checkpoint.
#[derive(Debug, Clone)]
pub struct SourceTensor {
    pub name: String,
    /// GGML type id, see [`kind`].
    pub kind: u32,
    pub shape: Vec<u64>,
    pub source: Arc<dyn ByteSource>,
}

impl SourceTensor {
    pub fn new(
        name: impl Into<String>,
        kind: u32,
        shape: Vec<u64>,
        source: Arc<dyn ByteSource>,
    ) -> Self {
        Self { name: name.into(), kind, shape, source }
    }

    /// Convenience constructor for in-memory payloads.
    pub fn from_bytes(
        name: impl Into<String>,
        kind: u32,
        shape: Vec<u64>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(name, kind, shape, Arc::new(MemorySource::new(bytes)))
    }

    pub fn byte_len(&self) -> u64 {
        self.source.len()
    }
}

impl WriteTo for SourceTensor {
    fn byte_len(&self) -> u64 {
        self.source.len()
    }

    fn write_to(&self, w: &mut dyn Write) -> io::Result<u64> {
        copy_source(self.source.as_ref(), w)
    }
}
