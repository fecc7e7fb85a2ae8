//! Lazy SafeTensors checkpoint loading.
//!
//! Only shard headers are parsed; every tensor is handed out as a
//! [`FileRange`] so payloads are streamed straight from disk when the
//! writer reaches them.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{ConvertError, Result};
use crate::source::{FileRange, SourceTensor, kind};

/// Size of the little-endian header length prefix.
const HEADER_LEN_PREFIX: u64 = 8;

/// Map a stored dtype to its GGML tensor type id.
pub fn kind_for_dtype(dtype: Dtype) -> Option<u32> {
    Some(match dtype {
        Dtype::F32 => kind::F32,
        Dtype::F16 => kind::F16,
        Dtype::BF16 => kind::BF16,
        Dtype::F64 => kind::F64,
        Dtype::I8 => kind::I8,
        Dtype::I16 => kind::I16,
        Dtype::I32 => kind::I32,
        Dtype::I64 => kind::I64,
        _ => return None,
    })
}

/// List the `*.safetensors` shards of a checkpoint, sorted by file name.
///
/// A path to a single `.safetensors` file is accepted as a one-shard checkpoint.
pub fn discover_shards(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return if is_safetensors(input) {
            Ok(vec![input.to_path_buf()])
        } else {
            Err(ConvertError::NoShards(input.to_path_buf()))
        };
    }

    let mut shards = Vec::new();
    // Hugging Face cache snapshots store every shard as a symlink into `blobs/`.
    for entry in WalkDir::new(input).min_depth(1).max_depth(1).follow_links(true) {
        let entry = entry.map_err(|e| ConvertError::Io(e.into()))?;
        if entry.file_type().is_file() && is_safetensors(entry.path()) {
            shards.push(entry.into_path());
        }
    }
    if shards.is_empty() {
        return Err(ConvertError::NoShards(input.to_path_buf()));
    }
    shards.sort();
    Ok(shards)
}

fn is_safetensors(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("safetensors")
}

/// Read one shard's header and return its tensors in data-offset order.
pub fn read_shard(path: &Path) -> Result<Vec<SourceTensor>> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and only used to parse the header.
    let mmap = unsafe { memmap2::Mmap::map(&file) }?;
    let (header_len, metadata) = SafeTensors::read_metadata(&mmap[..]).map_err(|e| {
        ConvertError::SafeTensors { path: path.to_path_buf(), reason: e.to_string() }
    })?;
    let data_start = HEADER_LEN_PREFIX + header_len as u64;

    let mut infos: Vec<_> = metadata.tensors().into_iter().collect();
    infos.sort_by_key(|(_, info)| info.data_offsets.0);

    let mut tensors = Vec::with_capacity(infos.len());
    for (name, info) in infos {
        let Some(kind) = kind_for_dtype(info.dtype) else {
            return Err(ConvertError::UnsupportedDtype { name, dtype: format!("{:?}", info.dtype) });
        };
        let (start, end) = info.data_offsets;
        let range = FileRange::new(path, data_start + start as u64, (end - start) as u64);
        let shape = info.shape.iter().map(|&d| d as u64).collect();
        tensors.push(SourceTensor::new(name, kind, shape, Arc::new(range)));
    }

    debug!(shard = %path.display(), tensors = tensors.len(), "read shard header");
    Ok(tensors)
}

/// Load every tensor of a checkpoint, shard by shard.
pub fn load_checkpoint(input: &Path) -> Result<Vec<SourceTensor>> {
    let shards = discover_shards(input)?;
    info!("Found {} shard(s) in {}", shards.len(), input.display());

    let mut tensors = Vec::new();
    for shard in &shards {
        tensors.extend(read_shard(shard)?);
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::WriteTo;
    use std::fs;
    use tempfile::TempDir;

    // SafeTensors format: header_size (u64 le) | header_json | tensor_data
    fn write_shard(path: &Path, json: &str, data: &[u8]) {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(json.len() as u64).to_le_bytes());
        buffer.extend_from_slice(json.as_bytes());
        buffer.extend_from_slice(data);
        fs::write(path, buffer).unwrap();
    }

    #[test]
    fn read_shard_orders_by_offset_and_reads_lazily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let json = concat!(
            r#"{"b":{"dtype":"F16","shape":[2],"data_offsets":[4,8]},"#,
            r#""a":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#,
        );
        write_shard(&path, json, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let tensors = read_shard(&path).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].name, "a");
        assert_eq!(tensors[0].kind, kind::F32);
        assert_eq!(tensors[1].name, "b");
        assert_eq!(tensors[1].kind, kind::F16);
        assert_eq!(tensors[1].shape, vec![2]);

        let mut out = Vec::new();
        tensors[1].write_to(&mut out).unwrap();
        assert_eq!(out, vec![5, 6, 7, 8]);
    }

    #[test]
    fn read_shard_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.safetensors");
        fs::write(&path, b"not a safetensors file").unwrap();
        assert!(matches!(read_shard(&path), Err(ConvertError::SafeTensors { .. })));
    }

    #[test]
    fn discover_shards_sorts_and_filters() {
        let dir = TempDir::new().unwrap();
        let files =
            ["model-00002-of-00002.safetensors", "model-00001-of-00002.safetensors", "config.json"];
        for name in files {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let shards = discover_shards(dir.path()).unwrap();
        let names: Vec<_> =
            shards.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(
            names,
            ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn discover_shards_follows_symlinked_blobs() {
        let cache = TempDir::new().unwrap();
        let blobs = cache.path().join("blobs");
        let snapshot = cache.path().join("snapshots").join("main");
        fs::create_dir_all(&blobs).unwrap();
        fs::create_dir_all(&snapshot).unwrap();

        let blob = blobs.join("3f2a9c");
        let json = r#"{"a":{"dtype":"F32","shape":[1],"data_offsets":[0,4]}}"#;
        write_shard(&blob, json, &[1, 2, 3, 4]);
        let link = snapshot.join("model-00001-of-00001.safetensors");
        std::os::unix::fs::symlink(&blob, &link).unwrap();

        let shards = discover_shards(&snapshot).unwrap();
        assert_eq!(shards, vec![link]);

        let tensors = load_checkpoint(&snapshot).unwrap();
        assert_eq!(tensors.len(), 1);
        let mut out = Vec::new();
        tensors[0].write_to(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn discover_shards_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(discover_shards(dir.path()), Err(ConvertError::NoShards(_))));
    }

    #[test]
    fn kind_for_unsupported_dtype() {
        assert_eq!(kind_for_dtype(Dtype::BOOL), None);
        assert_eq!(kind_for_dtype(Dtype::BF16), Some(kind::BF16));
    }
}
