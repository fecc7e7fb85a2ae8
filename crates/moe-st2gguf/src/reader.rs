//! Minimal GGUF reader used to verify written files.
//!
//! Parses the header, every metadata entry and the tensor index; tensor
//! payloads are located but never read.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{ConvertError, Result};
use crate::writer::{GGUF_MAGIC, align_up};

const MAX_STR_LEN: u64 = 10 * 1024 * 1024;
const MAX_DIMS: u32 = 8;

/// Parsed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

/// One entry of the tensor index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    /// Dimensions as stored, innermost first.
    pub dims: Vec<u64>,
    pub kind: u32,
    /// Offset relative to the start of the data section.
    pub offset: u64,
}

/// Everything in a GGUF file except tensor payloads.
#[derive(Debug, Clone)]
pub struct GgufFile {
    pub version: u32,
    pub metadata: Vec<(String, GgufValue)>,
    pub tensors: Vec<TensorInfo>,
    /// Absolute file offset of the data section.
    pub data_offset: u64,
}

impl GgufFile {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn alignment(&self) -> u64 {
        match self.get("general.alignment") {
            Some(GgufValue::U32(a)) => u64::from(*a),
            _ => 32,
        }
    }
}

fn malformed(msg: impl Into<String>) -> ConvertError {
    ConvertError::MalformedGguf(msg.into())
}

/// Byte reader that tracks its position.
struct Cursor<R> {
    inner: R,
    pos: u64,
}

impl<R: Read> Cursor<R> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut b = [0u8; N];
        self.inner.read_exact(&mut b)?;
        self.pos += N as u64;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()?;
        if len > MAX_STR_LEN {
            return Err(malformed(format!("string too large: {len} bytes")));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        self.pos += len;
        String::from_utf8(buf).map_err(|_| malformed("string is not UTF-8"))
    }

    fn value(&mut self, ty: u32) -> Result<GgufValue> {
        Ok(match ty {
            0 => GgufValue::U8(u8::from_le_bytes(self.bytes()?)),
            1 => GgufValue::I8(i8::from_le_bytes(self.bytes()?)),
            2 => GgufValue::U16(u16::from_le_bytes(self.bytes()?)),
            3 => GgufValue::I16(i16::from_le_bytes(self.bytes()?)),
            4 => GgufValue::U32(self.u32()?),
            5 => GgufValue::I32(i32::from_le_bytes(self.bytes()?)),
            6 => GgufValue::F32(f32::from_le_bytes(self.bytes()?)),
            7 => GgufValue::Bool(self.bytes::<1>()?[0] != 0),
            8 => GgufValue::String(self.string()?),
            9 => {
                let elem = self.u32()?;
                if elem == 9 {
                    return Err(malformed("nested arrays are not supported"));
                }
                let len = self.u64()?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(self.value(elem)?);
                }
                GgufValue::Array(items)
            }
            10 => GgufValue::U64(self.u64()?),
            11 => GgufValue::I64(i64::from_le_bytes(self.bytes()?)),
            12 => GgufValue::F64(f64::from_le_bytes(self.bytes()?)),
            other => return Err(malformed(format!("invalid value type {other}"))),
        })
    }
}

/// Parse the header, metadata and tensor index from `r`.
pub fn read_gguf<R: Read>(r: R) -> Result<GgufFile> {
    let mut c = Cursor { inner: r, pos: 0 };

    let magic: [u8; 4] = c.bytes()?;
    if magic != GGUF_MAGIC {
        return Err(malformed(format!("bad magic: {magic:02x?}")));
    }
    let version = c.u32()?;
    if !(2..=3).contains(&version) {
        return Err(malformed(format!("unsupported version {version}")));
    }
    let n_tensors = c.u64()?;
    let n_kv = c.u64()?;

    let mut metadata = Vec::new();
    for _ in 0..n_kv {
        let key = c.string()?;
        let ty = c.u32()?;
        metadata.push((key, c.value(ty)?));
    }

    let mut tensors = Vec::new();
    for _ in 0..n_tensors {
        let name = c.string()?;
        let n_dims = c.u32()?;
        if n_dims > MAX_DIMS {
            return Err(malformed(format!("tensor `{name}` has {n_dims} dims")));
        }
        let dims = (0..n_dims).map(|_| c.u64()).collect::<Result<Vec<_>>>()?;
        let kind = c.u32()?;
        let offset = c.u64()?;
        tensors.push(TensorInfo { name, dims, kind, offset });
    }

    let mut file = GgufFile { version, metadata, tensors, data_offset: 0 };
    file.data_offset = align_up(c.pos, file.alignment());
    Ok(file)
}

/// Read the non-payload part of a GGUF file on disk.
pub fn read_gguf_file(path: &Path) -> Result<GgufFile> {
    read_gguf(BufReader::new(File::open(path)?))
}
