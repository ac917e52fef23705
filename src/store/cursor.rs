//! Read access to a chunk: file snapshots and the bidirectional cursor.
//!
//! `ChunkData` holds the chunk's files, memory-mapped where possible and
//! decompressed into memory for `.zst` counterparts. It is an immutable
//! snapshot: cursors over sealed chunks see frozen data, cursors over the
//! active chunk see everything appended before the snapshot was taken.
//!
//! Note: cursors cannot implement `Iterator`, because an iterator cannot
//! return a buffer borrowed from itself. Records are handed out as
//! [`RecordView`]s over the mapped files and must be copied with
//! `to_record()` to outlive the cursor.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use anyhow::{format_err, Error};
use log::warn;
use memmap2::Mmap;

use crate::error::StoreError;

use super::chunk_meta::{AttrEncoding, ChunkMeta};
use super::attr_codec::{decode_attrs, decode_attrs_dict};
use super::file_formats::{
    FileHeader, IdxEntry, ATTR_LOG_NAME, DICT_LOG_NAME, IDX_ENTRY_SIZE, IDX_LOG_NAME,
    RAW_LOG_NAME, TYPE_DICT, ZST_EXT,
};
use super::record::{Attrs, ChunkId, RecordRef, RecordView};
use super::string_dict::StringDict;

/// One chunk file, mapped or decompressed into memory.
pub enum FileBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Owned(data) => data,
        }
    }
}

/// Load a chunk file, preferring the plain name and falling back to the
/// `.zst` counterpart. Missing files read as empty.
fn load_file(dir: &Path, name: &str) -> Result<FileBytes, Error> {
    let path = dir.join(name);
    if path.exists() {
        let file = File::open(&path)
            .map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
        if file.metadata()?.len() == 0 {
            return Ok(FileBytes::Owned(Vec::new()));
        }
        let map = unsafe { Mmap::map(&file) }
            .map_err(|err| format_err!("unable to map {:?} - {}", path, err))?;
        return Ok(FileBytes::Mapped(map));
    }

    let zst_path = dir.join(format!("{}.{}", name, ZST_EXT));
    if zst_path.exists() {
        let file = File::open(&zst_path)
            .map_err(|err| format_err!("unable to open {:?} - {}", zst_path, err))?;
        let data = zstd::stream::decode_all(file)
            .map_err(|err| format_err!("unable to decompress {:?} - {}", zst_path, err))?;
        return Ok(FileBytes::Owned(data));
    }

    Ok(FileBytes::Owned(Vec::new()))
}

/// Immutable snapshot of one chunk's record data.
pub struct ChunkData {
    meta: ChunkMeta,
    idx: FileBytes,
    raw: FileBytes,
    attr: FileBytes,
    dict: StringDict,
    records: u64,
}

impl ChunkData {
    pub fn open(dir: &Path, meta: &ChunkMeta) -> Result<Self, Error> {
        // idx first: entries present in this snapshot reference raw and
        // attr bytes that were written before them, so mapping those
        // files afterwards can never come up short
        let idx = load_file(dir, IDX_LOG_NAME)?;
        let raw = load_file(dir, RAW_LOG_NAME)?;
        let attr = load_file(dir, ATTR_LOG_NAME)?;
        let dict_data = load_file(dir, DICT_LOG_NAME)?;

        let dict_bytes: &[u8] = &dict_data;
        let dict = if dict_bytes.len() >= FileHeader::SIZE {
            FileHeader::decode(dict_bytes, TYPE_DICT)?;
            StringDict::from_body(&dict_bytes[FileHeader::SIZE..])
        } else {
            StringDict::new()
        };

        let records = (idx.len() / IDX_ENTRY_SIZE) as u64;

        Ok(Self {
            meta: meta.clone(),
            idx,
            raw,
            attr,
            dict,
            records,
        })
    }

    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.meta.id
    }

    /// Number of records in this snapshot.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn entry(&self, position: u64) -> Result<IdxEntry, Error> {
        if position >= self.records {
            return Err(StoreError::NoMoreRecords.into());
        }
        let idx: &[u8] = &self.idx;
        let offset = position as usize * IDX_ENTRY_SIZE;
        IdxEntry::decode(&idx[offset..offset + IDX_ENTRY_SIZE])
    }

    pub fn write_ts(&self, position: u64) -> Result<i64, Error> {
        Ok(self.entry(position)?.write_ts)
    }

    fn raw_slice(&self, entry: &IdxEntry) -> Result<&[u8], Error> {
        let raw: &[u8] = &self.raw;
        let start = entry.raw_offset as usize;
        let end = start + entry.raw_len as usize;
        if end > raw.len() {
            return Err(StoreError::InvalidAttrsData(format!(
                "raw payload [{}, {}) overflows log of {} bytes",
                start,
                end,
                raw.len()
            ))
            .into());
        }
        Ok(&raw[start..end])
    }

    fn decode_attrs_at(&self, entry: &IdxEntry) -> Result<Attrs, Error> {
        let attr: &[u8] = &self.attr;
        let start = entry.attr_offset as usize;
        let end = start + entry.attr_len as usize;
        if end > attr.len() {
            return Err(StoreError::InvalidAttrsData(format!(
                "attribute blob [{}, {}) overflows log of {} bytes",
                start,
                end,
                attr.len()
            ))
            .into());
        }
        let blob = &attr[start..end];
        match self.meta.attr_encoding {
            AttrEncoding::Plain => decode_attrs(blob),
            AttrEncoding::Dictionary => decode_attrs_dict(blob, &self.dict),
        }
    }

    /// Raw payload of the record at `position`, borrowing the mapped
    /// file.
    pub fn raw(&self, position: u64) -> Result<&[u8], Error> {
        let entry = self.entry(position)?;
        self.raw_slice(&entry)
    }

    /// Decoded attribute map of the record at `position`.
    pub fn attrs(&self, position: u64) -> Result<Attrs, Error> {
        let entry = self.entry(position)?;
        self.decode_attrs_at(&entry)
    }

    /// Decode the record at `position`. The raw payload borrows the
    /// mapped file.
    pub fn view(&self, position: u64) -> Result<RecordView<'_>, Error> {
        let entry = self.entry(position)?;
        let attrs = self.decode_attrs_at(&entry)?;
        let raw = self.raw_slice(&entry)?;
        Ok(RecordView {
            ingest_ts: entry.ingest_ts,
            write_ts: entry.write_ts,
            attrs,
            raw,
        })
    }

    /// First position whose write timestamp is `>= ts`, or `None` when no
    /// record qualifies (including empty chunks).
    pub fn find_start_position(&self, ts: i64) -> Result<Option<u64>, Error> {
        let mut lo = 0u64;
        let mut hi = self.records;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.write_ts(mid)? < ts {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= self.records {
            Ok(None)
        } else {
            Ok(Some(lo))
        }
    }
}

/// Bidirectional iterator over one chunk.
///
/// The cursor sits *between* records: `next()` returns the record at the
/// current position and moves forward, `prev()` returns the one before it
/// and moves back. `seek(p)` places the cursor so that `next()` returns
/// position `p`.
pub struct ChunkCursor {
    data: Arc<ChunkData>,
    pos: u64,
}

impl ChunkCursor {
    pub fn new(data: Arc<ChunkData>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.data.chunk_id()
    }

    pub fn records(&self) -> u64 {
        self.data.records()
    }

    /// The position `next()` would read.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn data(&self) -> &Arc<ChunkData> {
        &self.data
    }

    /// Jump to an index position. `records()` itself is a valid target
    /// (end of chunk); anything beyond fails.
    pub fn seek(&mut self, position: u64) -> Result<(), Error> {
        if position > self.data.records() {
            return Err(StoreError::NoMoreRecords.into());
        }
        self.pos = position;
        Ok(())
    }

    /// Return the record at the cursor and advance. Records whose
    /// attribute blob fails to decode are skipped with a diagnostic.
    pub fn next(&mut self) -> Result<(RecordView<'_>, RecordRef), Error> {
        let found = loop {
            if self.pos >= self.data.records() {
                return Err(StoreError::NoMoreRecords.into());
            }
            let position = self.pos;
            self.pos += 1;
            // probe the record first so a corrupt one can be skipped
            // without holding a borrow across the loop
            match self.data.entry(position).and_then(|e| {
                self.data.decode_attrs_at(&e)?;
                Ok(())
            }) {
                Ok(()) => break position,
                Err(err) => {
                    warn!(
                        "skipping corrupt record {}@{} - {}",
                        self.data.chunk_id(),
                        position,
                        err
                    );
                }
            }
        };

        let view = self.data.view(found)?;
        let rref = RecordRef {
            chunk_id: self.data.chunk_id(),
            position: found,
        };
        Ok((view, rref))
    }

    /// Return the record before the cursor and move back.
    pub fn prev(&mut self) -> Result<(RecordView<'_>, RecordRef), Error> {
        let found = loop {
            if self.pos == 0 {
                return Err(StoreError::NoMoreRecords.into());
            }
            let position = self.pos - 1;
            self.pos -= 1;
            match self.data.entry(position).and_then(|e| {
                self.data.decode_attrs_at(&e)?;
                Ok(())
            }) {
                Ok(()) => break position,
                Err(err) => {
                    warn!(
                        "skipping corrupt record {}@{} - {}",
                        self.data.chunk_id(),
                        position,
                        err
                    );
                }
            }
        };

        let view = self.data.view(found)?;
        let rref = RecordRef {
            chunk_id: self.data.chunk_id(),
            position: found,
        };
        Ok((view, rref))
    }
}
