//! The active chunk writer.
//!
//! A chunk is a directory named by its canonical chunk id. The writer
//! appends to four files (`raw.log`, `attr.log`, `idx.log`,
//! `attr_dict.log`) and keeps the running offsets that rotation policies
//! snapshot. Write order per record is raw, attrs, index entry — a record
//! exists once its index entry is complete, so torn writes leave at most
//! a partial trailing entry, which recovery truncates.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use log::{info, warn};

use crate::error::StoreError;

use super::attr_codec::{encode_attrs, encode_attrs_dict};
use super::chunk_meta::{ActiveChunkState, AttrEncoding, ChunkMeta};
use super::file_formats::{
    IdxEntry, ATTR_LOG_NAME, DICT_FILE_MAGIC, DICT_LOG_NAME, IDX_ENTRY_SIZE, IDX_LOG_NAME,
    META_NAME, RAW_LOG_NAME,
};
use super::record::{Attrs, ChunkId};
use super::string_dict::StringDict;

/// Wall-clock creation time in microseconds, recovered from the v7 chunk
/// id. Returns 0 (age checks disabled) for ids without a timestamp.
pub fn chunk_created_at(id: ChunkId) -> i64 {
    match id.get_timestamp() {
        Some(ts) => {
            let (secs, nanos) = ts.to_unix();
            secs as i64 * 1_000_000 + nanos as i64 / 1_000
        }
        None => 0,
    }
}

pub struct ChunkWriter {
    dir: PathBuf,
    meta: ChunkMeta,
    created_at: i64,
    raw_log: File,
    attr_log: File,
    idx_log: File,
    dict_log: File,
    dict: StringDict,
    raw_offset: u64,
    attr_offset: u64,
}

impl ChunkWriter {
    /// Create a fresh chunk directory under `base` and open it for
    /// writing.
    pub fn create(base: &Path, attr_encoding: AttrEncoding) -> Result<Self, Error> {
        let id = ChunkId::now_v7();
        let dir = base.join(id.to_string());
        std::fs::create_dir(&dir)
            .map_err(|err| format_err!("unable to create chunk dir {:?} - {}", dir, err))?;

        let open = |name: &str| -> Result<File, Error> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
                .map_err(|err| format_err!("unable to create {:?}/{} - {}", dir, name, err))
        };

        let raw_log = open(RAW_LOG_NAME)?;
        let attr_log = open(ATTR_LOG_NAME)?;
        let idx_log = open(IDX_LOG_NAME)?;
        let mut dict_log = open(DICT_LOG_NAME)?;
        dict_log.write_all(&DICT_FILE_MAGIC)?;
        dict_log.sync_data()?;

        let meta = ChunkMeta::new(id, attr_encoding);
        meta.store(&dir.join(META_NAME))?;

        info!("created chunk {}", id);

        Ok(Self {
            dir,
            created_at: chunk_created_at(id),
            meta,
            raw_log,
            attr_log,
            idx_log,
            dict_log,
            dict: StringDict::new(),
            raw_offset: 0,
            attr_offset: 0,
        })
    }

    /// Re-open an unsealed chunk after a restart.
    ///
    /// The counters are recomputed from `idx.log` rather than trusted
    /// from the metadata file, and torn tails in `idx.log` and
    /// `attr_dict.log` are truncated away.
    pub fn open(dir: PathBuf, mut meta: ChunkMeta) -> Result<Self, Error> {
        if meta.sealed {
            return Err(StoreError::ChunkNotSealed(meta.id).into());
        }

        // record index: drop a partial trailing entry
        let idx_path = dir.join(IDX_LOG_NAME);
        let idx_data = std::fs::read(&idx_path).unwrap_or_default();
        let records = idx_data.len() / IDX_ENTRY_SIZE;
        if idx_data.len() % IDX_ENTRY_SIZE != 0 {
            warn!(
                "chunk {}: truncating partial index entry ({} trailing bytes)",
                meta.id,
                idx_data.len() % IDX_ENTRY_SIZE
            );
            let file = OpenOptions::new().write(true).open(&idx_path)?;
            file.set_len((records * IDX_ENTRY_SIZE) as u64)?;
            file.sync_data()?;
        }

        let mut raw_offset = 0u64;
        let mut attr_offset = 0u64;
        let mut start_ts = 0i64;
        let mut end_ts = 0i64;
        let mut bytes = 0u64;
        if records > 0 {
            let first = IdxEntry::decode(&idx_data[0..IDX_ENTRY_SIZE])?;
            let last = IdxEntry::decode(&idx_data[(records - 1) * IDX_ENTRY_SIZE..])?;
            start_ts = first.write_ts;
            end_ts = last.write_ts;
            raw_offset = last.raw_offset as u64 + last.raw_len as u64;
            attr_offset = last.attr_offset as u64 + last.attr_len as u64;
            bytes = raw_offset + attr_offset + (records * IDX_ENTRY_SIZE) as u64;
        }

        // dictionary: drop a torn tail so new appends start clean
        let dict_path = dir.join(DICT_LOG_NAME);
        let dict_data = std::fs::read(&dict_path).unwrap_or_default();
        let dict = if dict_data.len() >= DICT_FILE_MAGIC.len() {
            let (dict, used) = StringDict::load_body(&dict_data[DICT_FILE_MAGIC.len()..]);
            let valid_len = (DICT_FILE_MAGIC.len() + used) as u64;
            if valid_len < dict_data.len() as u64 {
                let file = OpenOptions::new().write(true).open(&dict_path)?;
                file.set_len(valid_len)?;
                file.sync_data()?;
            }
            dict
        } else {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&dict_path)?;
            file.write_all(&DICT_FILE_MAGIC)?;
            file.sync_data()?;
            StringDict::new()
        };

        let open = |name: &str| -> Result<File, Error> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
                .map_err(|err| format_err!("unable to open {:?}/{} - {}", dir, name, err))
        };

        meta.start_ts = start_ts;
        meta.end_ts = end_ts;
        meta.records = records as u64;
        meta.bytes = bytes;

        info!("recovered active chunk {} ({} records)", meta.id, records);

        Ok(Self {
            raw_log: open(RAW_LOG_NAME)?,
            attr_log: open(ATTR_LOG_NAME)?,
            idx_log: open(IDX_LOG_NAME)?,
            dict_log: open(DICT_LOG_NAME)?,
            created_at: chunk_created_at(meta.id),
            dir,
            meta,
            dict,
            raw_offset,
            attr_offset,
        })
    }

    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> ActiveChunkState {
        ActiveChunkState {
            id: self.meta.id,
            start_ts: self.meta.start_ts,
            last_write_ts: self.meta.end_ts,
            created_at: self.created_at,
            bytes: self.meta.bytes,
            raw_bytes: self.raw_offset,
            attr_bytes: self.attr_offset,
            records: self.meta.records,
        }
    }

    /// Append one record. Returns its position within the chunk.
    ///
    /// The caller (the chunk store) has already run the rotation check,
    /// so offset overflow here is a hard error, not a rotation request.
    pub fn append(
        &mut self,
        ingest_ts: i64,
        write_ts: i64,
        attrs: &Attrs,
        raw: &[u8],
    ) -> Result<u64, Error> {
        if raw.len() as u64 > u32::MAX as u64 {
            return Err(StoreError::HardLimitExceeded(raw.len() as u64).into());
        }

        let attr_blob = match self.meta.attr_encoding {
            AttrEncoding::Plain => encode_attrs(attrs)?,
            AttrEncoding::Dictionary => {
                let (blob, added) = encode_attrs_dict(attrs, &mut self.dict)?;
                if !added.is_empty() {
                    // the dictionary must be durable before any blob
                    // referencing its new ids becomes visible
                    let mut buf = Vec::new();
                    for entry in &added {
                        StringDict::encode_entry(entry, &mut buf);
                    }
                    self.dict_log.write_all(&buf)?;
                    self.dict_log.sync_data()?;
                }
                blob
            }
        };

        if self.raw_offset + raw.len() as u64 > u32::MAX as u64
            || self.attr_offset + attr_blob.len() as u64 > u32::MAX as u64
        {
            return Err(StoreError::HardLimitExceeded(
                raw.len() as u64 + attr_blob.len() as u64,
            )
            .into());
        }

        self.raw_log.write_all(raw)?;
        self.attr_log.write_all(&attr_blob)?;

        let entry = IdxEntry {
            raw_offset: self.raw_offset as u32,
            raw_len: raw.len() as u32,
            attr_offset: self.attr_offset as u32,
            attr_len: attr_blob.len() as u16,
            ingest_ts,
            write_ts,
        };
        self.idx_log.write_all(&entry.encode())?;

        let position = self.meta.records;
        if self.meta.records == 0 {
            self.meta.start_ts = write_ts;
        }
        self.meta.end_ts = write_ts;
        self.meta.records += 1;
        self.meta.bytes += raw.len() as u64 + attr_blob.len() as u64 + IDX_ENTRY_SIZE as u64;
        self.raw_offset += raw.len() as u64;
        self.attr_offset += attr_blob.len() as u64;

        Ok(position)
    }

    fn sync_all(&mut self) -> Result<(), Error> {
        self.raw_log.sync_data()?;
        self.attr_log.sync_data()?;
        self.idx_log.sync_data()?;
        self.dict_log.sync_data()?;
        Ok(())
    }

    /// Freeze the chunk. No further writes can target it.
    pub fn seal(mut self) -> Result<ChunkMeta, Error> {
        self.sync_all()?;
        self.meta.sealed = true;
        self.meta.store(&self.dir.join(META_NAME))?;
        info!(
            "sealed chunk {} ({} records, {} bytes)",
            self.meta.id, self.meta.records, self.meta.bytes
        );
        Ok(self.meta)
    }

    /// Flush state for a clean shutdown without sealing; the chunk is
    /// re-opened as active on the next store open.
    pub fn close(mut self) -> Result<ChunkMeta, Error> {
        self.sync_all()?;
        self.meta.store(&self.dir.join(META_NAME))?;
        Ok(self.meta)
    }
}

/// Rebuild metadata for a chunk directory whose `meta.json` was lost,
/// sealing it in the process. Used by store recovery.
pub fn recover_chunk_meta(
    dir: &Path,
    id: ChunkId,
    attr_encoding: AttrEncoding,
) -> Result<ChunkMeta, Error> {
    let idx_data = std::fs::read(dir.join(IDX_LOG_NAME))
        .map_err(|err| format_err!("chunk {} has no readable index - {}", id, err))?;
    let records = idx_data.len() / IDX_ENTRY_SIZE;
    if records == 0 {
        bail!("chunk {} is empty", id);
    }

    let first = IdxEntry::decode(&idx_data[0..IDX_ENTRY_SIZE])?;
    let last = IdxEntry::decode(&idx_data[(records - 1) * IDX_ENTRY_SIZE..])?;

    let mut meta = ChunkMeta::new(id, attr_encoding);
    meta.start_ts = first.write_ts;
    meta.end_ts = last.write_ts;
    meta.records = records as u64;
    meta.bytes = last.raw_offset as u64
        + last.raw_len as u64
        + last.attr_offset as u64
        + last.attr_len as u64
        + (records * IDX_ENTRY_SIZE) as u64;
    meta.sealed = true;
    meta.store(&dir.join(META_NAME))?;

    warn!("rebuilt metadata for chunk {} ({} records)", id, records);

    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn append_tracks_offsets_and_meta() {
        let base = tempfile::tempdir().unwrap();
        let mut writer = ChunkWriter::create(base.path(), AttrEncoding::Dictionary).unwrap();

        let pos = writer
            .append(1, 10, &attrs(&[("svc", "a")]), b"hello")
            .unwrap();
        assert_eq!(pos, 0);
        let pos = writer
            .append(2, 20, &attrs(&[("svc", "b")]), b"world!")
            .unwrap();
        assert_eq!(pos, 1);

        let state = writer.state();
        assert_eq!(state.records, 2);
        assert_eq!(state.start_ts, 10);
        assert_eq!(state.last_write_ts, 20);
        assert_eq!(state.raw_bytes, 11);
        // two dict blobs of one pair each
        assert_eq!(state.attr_bytes, 20);
        assert_eq!(state.bytes, 11 + 20 + 60);
    }

    #[test]
    fn reopen_recovers_torn_tails() {
        let base = tempfile::tempdir().unwrap();
        let dir;
        let meta;
        {
            let mut writer = ChunkWriter::create(base.path(), AttrEncoding::Dictionary).unwrap();
            writer
                .append(1, 10, &attrs(&[("svc", "a")]), b"hello")
                .unwrap();
            dir = writer.dir().to_path_buf();
            meta = writer.close().unwrap();
        }

        // simulate a crash mid-append on both tail-growing files
        let mut idx = OpenOptions::new()
            .append(true)
            .open(dir.join(IDX_LOG_NAME))
            .unwrap();
        idx.write_all(&[0u8; 7]).unwrap();
        let mut dict = OpenOptions::new()
            .append(true)
            .open(dir.join(DICT_LOG_NAME))
            .unwrap();
        dict.write_all(&[9, 0, b'x']).unwrap();

        let mut writer = ChunkWriter::open(dir, meta).unwrap();
        let state = writer.state();
        assert_eq!(state.records, 1);
        assert_eq!(state.last_write_ts, 10);

        // appending after recovery continues the sequence
        let pos = writer
            .append(2, 20, &attrs(&[("svc", "a")]), b"again")
            .unwrap();
        assert_eq!(pos, 1);
    }
}
