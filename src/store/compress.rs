//! Post-seal chunk compression.
//!
//! Each chunk file is replaced by a `.zst` counterpart (written to a
//! temp file and renamed, original removed afterwards). Readers that
//! already hold a mapped snapshot keep it; new snapshots transparently
//! decompress. The disk-bytes metric is recomputed from the files that
//! actually remain.

use std::fs::File;
use std::path::Path;

use anyhow::{format_err, Error};
use log::info;

use crate::error::StoreError;

use super::chunk_store::ChunkStore;
use super::file_formats::{
    ATTR_LOG_NAME, DICT_LOG_NAME, IDX_LOG_NAME, META_NAME, RAW_LOG_NAME, ZST_EXT,
};
use super::record::ChunkId;

/// zstd level for chunk files.
const COMPRESS_LEVEL: i32 = 1;

fn compress_file(dir: &Path, name: &str) -> Result<(), Error> {
    let src_path = dir.join(name);
    if !src_path.exists() {
        return Ok(());
    }
    let dst_path = dir.join(format!("{}.{}", name, ZST_EXT));
    let tmp_path = dir.join(format!("{}.{}.tmp", name, ZST_EXT));

    let mut src = File::open(&src_path)
        .map_err(|err| format_err!("unable to open {:?} - {}", src_path, err))?;
    let mut dst = File::create(&tmp_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;

    if let Err(err) = zstd::stream::copy_encode(&mut src, &mut dst, COMPRESS_LEVEL) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(format_err!("compressing {:?} failed - {}", src_path, err));
    }
    if let Err(err) = dst.sync_data() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }

    std::fs::rename(&tmp_path, &dst_path)?;
    std::fs::remove_file(&src_path)?;
    Ok(())
}

fn dir_bytes(dir: &Path) -> Result<u64, Error> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

impl ChunkStore {
    /// Compress a sealed chunk's files in place. Idempotent: an already
    /// compressed chunk is left alone.
    pub fn compress_chunk(&self, id: ChunkId) -> Result<(), Error> {
        let mut meta = self.meta(id)?;
        if !meta.sealed {
            return Err(StoreError::ChunkNotSealed(id).into());
        }
        if meta.compressed {
            return Ok(());
        }

        let dir = self.chunk_dir(id);
        for name in &[RAW_LOG_NAME, ATTR_LOG_NAME, IDX_LOG_NAME, DICT_LOG_NAME] {
            compress_file(&dir, name)?;
        }

        let old_bytes = meta.bytes;
        meta.compressed = true;
        meta.bytes = dir_bytes(&dir)?;
        meta.store(&dir.join(META_NAME))?;
        self.update_sealed_meta(meta.clone());

        // open snapshots keep their maps; future opens must re-read
        self.evict_chunk_data(id);

        info!(
            "compressed chunk {}: {} -> {} bytes",
            id, old_bytes, meta.bytes
        );
        Ok(())
    }
}
