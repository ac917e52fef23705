use std::path::Path;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use crate::tools;

use super::record::ChunkId;

/// Which attribute blob encoding a chunk uses. The blobs carry no
/// discriminator byte, so this is fixed per chunk and recorded in the
/// metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrEncoding {
    Plain,
    Dictionary,
}

impl Default for AttrEncoding {
    fn default() -> Self {
        AttrEncoding::Dictionary
    }
}

/// Persistent chunk metadata (`meta.json`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub id: ChunkId,
    /// Write timestamp of the first record (microseconds), 0 when empty.
    pub start_ts: i64,
    /// Write timestamp of the last record (microseconds), 0 when empty.
    pub end_ts: i64,
    pub records: u64,
    /// On-disk bytes: raw payloads + attribute blobs + index entries,
    /// recomputed from the actual files after compression.
    pub bytes: u64,
    pub sealed: bool,
    pub compressed: bool,
    #[serde(default)]
    pub attr_encoding: AttrEncoding,
}

impl ChunkMeta {
    pub fn new(id: ChunkId, attr_encoding: AttrEncoding) -> Self {
        Self {
            id,
            start_ts: 0,
            end_ts: 0,
            records: 0,
            bytes: 0,
            sealed: false,
            compressed: false,
            attr_encoding,
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)
            .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))
    }

    pub fn store(&self, path: &Path) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(self)?;
        tools::replace_file(path, &data)
    }
}

/// Immutable snapshot of the active chunk, fed to rotation policies.
#[derive(Clone, Copy, Debug)]
pub struct ActiveChunkState {
    pub id: ChunkId,
    pub start_ts: i64,
    pub last_write_ts: i64,
    /// Wall-clock creation time in microseconds; 0 disables age checks.
    pub created_at: i64,
    /// Total on-disk bytes so far (raw + attrs + index entries).
    pub bytes: u64,
    /// Bytes in raw.log so far.
    pub raw_bytes: u64,
    /// Bytes in attr.log so far.
    pub attr_bytes: u64,
    pub records: u64,
}

/// Snapshot of the sealed chunk set, fed to retention policies.
#[derive(Clone, Debug)]
pub struct StoreState {
    /// Sealed chunks, oldest first.
    pub chunks: Vec<ChunkMeta>,
    /// Current wall-clock time in microseconds.
    pub now: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn meta_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let mut meta = ChunkMeta::new(Uuid::now_v7(), AttrEncoding::Dictionary);
        meta.start_ts = 10;
        meta.end_ts = 20;
        meta.records = 2;
        meta.bytes = 123;
        meta.sealed = true;

        meta.store(&path).unwrap();
        assert_eq!(ChunkMeta::load(&path).unwrap(), meta);
    }
}
