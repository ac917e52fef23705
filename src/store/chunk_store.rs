//! The chunk store: lifecycle owner for the active and sealed chunks.
//!
//! Appends and seals are serialized under the writer mutex. The sealed
//! chunk map sits behind a read-write lock, and read access to chunk
//! files goes through refcounted [`ChunkData`] snapshots, so queries run
//! in parallel with the writer. Deleting a chunk that a cursor still
//! references fails with `ResourceBusy` instead of pulling files from
//! under it.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, format_err, Error};
use log::{info, warn};
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::tools;

use super::attr_codec::{dict_encoded_len, plain_encoded_len};
use super::chunk::{recover_chunk_meta, ChunkWriter};
use super::chunk_meta::{ActiveChunkState, AttrEncoding, ChunkMeta, StoreState};
use super::cursor::{ChunkCursor, ChunkData};
use super::file_formats::{IDX_ENTRY_SIZE, META_NAME};
use super::record::{ChunkId, Record, RecordRef};
use super::rotation::{default_rotation, PendingRecord, RotationPolicy};

const LOCK_NAME: &str = ".lock";

/// Store construction options.
pub struct StoreConfig {
    pub attr_encoding: AttrEncoding,
    pub rotation: Box<dyn RotationPolicy>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            attr_encoding: AttrEncoding::default(),
            rotation: default_rotation(),
        }
    }
}

impl StoreConfig {
    pub fn attr_encoding(mut self, encoding: AttrEncoding) -> Self {
        self.attr_encoding = encoding;
        self
    }

    pub fn rotation(mut self, policy: Box<dyn RotationPolicy>) -> Self {
        self.rotation = policy;
        self
    }
}

struct WriterSlot {
    writer: Option<ChunkWriter>,
    closed: bool,
}

pub struct ChunkStore {
    base: PathBuf,
    _lock: File,
    attr_encoding: AttrEncoding,
    slot: Mutex<WriterSlot>,
    sealed: RwLock<BTreeMap<ChunkId, ChunkMeta>>,
    cache: Mutex<HashMap<ChunkId, Arc<ChunkData>>>,
    rotation: Mutex<Box<dyn RotationPolicy>>,
}

impl ChunkStore {
    /// Open (or create) a store rooted at `base`.
    ///
    /// Takes an exclusive lock on the directory, loads sealed chunk
    /// metadata, and recovers the newest unsealed chunk as the active
    /// writer. Orphaned directories (lost `meta.json`) get their metadata
    /// rebuilt and are sealed.
    pub fn open<P: AsRef<Path>>(base: P, config: StoreConfig) -> Result<Arc<Self>, Error> {
        let base = base.as_ref().to_path_buf();
        std::fs::create_dir_all(&base)
            .map_err(|err| format_err!("unable to create store dir {:?} - {}", base, err))?;
        let lock = tools::lock_file(base.join(LOCK_NAME))?;

        let mut sealed = BTreeMap::new();
        let mut unsealed: Vec<ChunkMeta> = Vec::new();

        for entry in WalkDir::new(&base).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let id = match ChunkId::parse_str(&name) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let dir = entry.path();

            let meta = match ChunkMeta::load(&dir.join(META_NAME)) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("chunk {}: {} - rebuilding metadata", id, err);
                    match recover_chunk_meta(dir, id, config.attr_encoding) {
                        Ok(meta) => meta,
                        Err(err) => {
                            warn!("removing unrecoverable chunk dir {:?} - {}", dir, err);
                            let _ = std::fs::remove_dir_all(dir);
                            continue;
                        }
                    }
                }
            };

            if meta.sealed {
                sealed.insert(meta.id, meta);
            } else {
                unsealed.push(meta);
            }
        }

        // the newest unsealed chunk resumes as the writer; any older
        // unsealed leftovers (crash during rotation) get sealed
        unsealed.sort_by_key(|meta| meta.id);
        let active_meta = unsealed.pop();
        for meta in unsealed {
            let dir = base.join(meta.id.to_string());
            match ChunkWriter::open(dir, meta)?.seal() {
                Ok(meta) => {
                    warn!("sealed stale unsealed chunk {}", meta.id);
                    sealed.insert(meta.id, meta);
                }
                Err(err) => warn!("unable to seal stale chunk - {}", err),
            }
        }

        let writer = match active_meta {
            Some(meta) => {
                let dir = base.join(meta.id.to_string());
                Some(ChunkWriter::open(dir, meta)?)
            }
            None => None,
        };

        info!(
            "opened store {:?} ({} sealed chunks, active: {})",
            base,
            sealed.len(),
            writer.is_some()
        );

        Ok(Arc::new(Self {
            base,
            _lock: lock,
            attr_encoding: config.attr_encoding,
            slot: Mutex::new(WriterSlot {
                writer,
                closed: false,
            }),
            sealed: RwLock::new(sealed),
            cache: Mutex::new(HashMap::new()),
            rotation: Mutex::new(config.rotation),
        }))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn chunk_dir(&self, id: ChunkId) -> PathBuf {
        self.base.join(id.to_string())
    }

    /// Append a record, assigning a fresh write timestamp (never earlier
    /// than the previous one).
    pub fn append(&self, record: &Record) -> Result<RecordRef, Error> {
        self.append_impl(record, None)
    }

    /// Append a record keeping its own write timestamp. Fails with
    /// `MissingWriteTS` when the timestamp is zero or precedes the last
    /// one written.
    pub fn append_preserved(&self, record: &Record) -> Result<RecordRef, Error> {
        self.append_impl(record, Some(record.write_ts))
    }

    fn append_impl(&self, record: &Record, preserved: Option<i64>) -> Result<RecordRef, Error> {
        let mut slot = self.slot.lock().unwrap();
        if slot.closed {
            bail!("store is closed");
        }

        let raw_len = record.raw.len() as u64;
        if raw_len > u32::MAX as u64 {
            return Err(StoreError::HardLimitExceeded(raw_len).into());
        }
        let attr_len = match self.attr_encoding {
            AttrEncoding::Plain => plain_encoded_len(&record.attrs)?,
            AttrEncoding::Dictionary => dict_encoded_len(&record.attrs)?,
        } as u64;
        let pending = PendingRecord {
            raw_len,
            attr_len,
            disk_size: raw_len + attr_len + IDX_ENTRY_SIZE as u64,
        };

        let last_write_ts = slot.writer.as_ref().map(|w| w.meta().end_ts).unwrap_or(0);
        let write_ts = match preserved {
            Some(ts) => {
                if ts == 0 || ts < last_write_ts {
                    return Err(StoreError::MissingWriteTS.into());
                }
                ts
            }
            None => tools::epoch_us().max(last_write_ts),
        };

        let now = tools::epoch_us();

        // rotation check against the projected state, before the write
        if let Some(writer) = slot.writer.as_ref() {
            let state = writer.state();
            let overflow = state.raw_bytes + pending.raw_len > u32::MAX as u64
                || state.attr_bytes + pending.attr_len > u32::MAX as u64;
            let trigger = if overflow {
                Some("hard-limit")
            } else {
                let policy = self.rotation.lock().unwrap();
                policy.should_rotate(&state, &pending, now)
            };
            if let Some(trigger) = trigger {
                info!(
                    "rotating chunk {} after {} records - trigger \"{}\"",
                    state.id, state.records, trigger
                );
                let writer = slot.writer.take().unwrap();
                let meta = writer.seal()?;
                self.sealed.write().unwrap().insert(meta.id, meta);
            }
        }

        if slot.writer.is_none() {
            let writer = ChunkWriter::create(&self.base, self.attr_encoding)?;
            // a record the policy rejects even on an empty chunk can
            // never be stored
            let policy = self.rotation.lock().unwrap();
            if policy
                .should_rotate(&writer.state(), &pending, now)
                .is_some()
            {
                let dir = writer.dir().to_path_buf();
                drop(policy);
                let _ = writer.seal();
                let _ = std::fs::remove_dir_all(dir);
                return Err(StoreError::HardLimitExceeded(pending.disk_size).into());
            }
            slot.writer = Some(writer);
        }

        let writer = slot.writer.as_mut().unwrap();
        let position = writer.append(record.ingest_ts, write_ts, &record.attrs, &record.raw)?;

        Ok(RecordRef {
            chunk_id: writer.meta().id,
            position,
        })
    }

    /// Seal the active chunk. Returns `None` when there is none.
    pub fn seal_active(&self) -> Result<Option<ChunkMeta>, Error> {
        let mut slot = self.slot.lock().unwrap();
        let writer = match slot.writer.take() {
            Some(writer) => writer,
            None => return Ok(None),
        };
        let meta = writer.seal()?;
        self.sealed.write().unwrap().insert(meta.id, meta.clone());
        Ok(Some(meta))
    }

    /// Snapshot of the active chunk, if any.
    pub fn active_state(&self) -> Option<ActiveChunkState> {
        self.slot.lock().unwrap().writer.as_ref().map(|w| w.state())
    }

    pub fn meta(&self, id: ChunkId) -> Result<ChunkMeta, Error> {
        {
            let slot = self.slot.lock().unwrap();
            if let Some(writer) = slot.writer.as_ref() {
                if writer.meta().id == id {
                    return Ok(writer.meta().clone());
                }
            }
        }
        match self.sealed.read().unwrap().get(&id) {
            Some(meta) => Ok(meta.clone()),
            None => Err(StoreError::ChunkNotFound(id).into()),
        }
    }

    /// All chunks, oldest first, with the active chunk last.
    pub fn list(&self) -> Vec<ChunkMeta> {
        let mut list: Vec<ChunkMeta> = self.sealed.read().unwrap().values().cloned().collect();
        if let Some(meta) = self
            .slot
            .lock()
            .unwrap()
            .writer
            .as_ref()
            .map(|w| w.meta().clone())
        {
            list.push(meta);
        }
        list
    }

    /// Snapshot for retention policies: sealed chunks only.
    pub fn store_state(&self) -> StoreState {
        StoreState {
            chunks: self.sealed.read().unwrap().values().cloned().collect(),
            now: tools::epoch_us(),
        }
    }

    /// Delete a sealed chunk. Fails with `ActiveChunk` on the writer and
    /// with `ResourceBusy` while cursors still reference the files.
    pub fn delete(&self, id: ChunkId) -> Result<(), Error> {
        {
            let slot = self.slot.lock().unwrap();
            if let Some(writer) = slot.writer.as_ref() {
                if writer.meta().id == id {
                    return Err(StoreError::ActiveChunk(id).into());
                }
            }
        }

        let mut sealed = self.sealed.write().unwrap();
        if !sealed.contains_key(&id) {
            return Err(StoreError::ChunkNotFound(id).into());
        }

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(data) = cache.get(&id) {
                if Arc::strong_count(data) > 1 {
                    return Err(StoreError::ResourceBusy(id).into());
                }
                cache.remove(&id);
            }
        }

        let dir = self.chunk_dir(id);
        std::fs::remove_dir_all(&dir)
            .map_err(|err| format_err!("unable to remove chunk dir {:?} - {}", dir, err))?;
        sealed.remove(&id);
        info!("deleted chunk {}", id);
        Ok(())
    }

    /// Refcounted snapshot of a chunk's files. Sealed snapshots are
    /// cached and shared; the active chunk always gets a fresh one so
    /// newly appended records are visible.
    pub fn open_chunk_data(&self, id: ChunkId) -> Result<Arc<ChunkData>, Error> {
        let meta = self.meta(id)?;
        if !meta.sealed {
            return Ok(Arc::new(ChunkData::open(&self.chunk_dir(id), &meta)?));
        }

        let mut cache = self.cache.lock().unwrap();
        if let Some(data) = cache.get(&id) {
            return Ok(data.clone());
        }
        let data = Arc::new(ChunkData::open(&self.chunk_dir(id), &meta)?);
        cache.insert(id, data.clone());
        Ok(data)
    }

    /// Drop a cached snapshot (after compression replaced the files).
    pub(super) fn evict_chunk_data(&self, id: ChunkId) {
        self.cache.lock().unwrap().remove(&id);
    }

    pub(super) fn update_sealed_meta(&self, meta: ChunkMeta) {
        self.sealed.write().unwrap().insert(meta.id, meta);
    }

    pub fn open_cursor(&self, id: ChunkId) -> Result<ChunkCursor, Error> {
        Ok(ChunkCursor::new(self.open_chunk_data(id)?))
    }

    /// Position of the first record with write timestamp `>= ts`;
    /// `Some(0)` when `ts` precedes the whole chunk, `None` when no
    /// record qualifies.
    pub fn find_start_position(&self, id: ChunkId, ts: i64) -> Result<Option<u64>, Error> {
        self.open_chunk_data(id)?.find_start_position(ts)
    }

    /// Gather-read write timestamps from the record index.
    pub fn read_write_timestamps(
        &self,
        id: ChunkId,
        positions: &[u64],
    ) -> Result<Vec<i64>, Error> {
        let data = self.open_chunk_data(id)?;
        positions.iter().map(|&p| data.write_ts(p)).collect()
    }

    pub fn set_rotation_policy(&self, policy: Box<dyn RotationPolicy>) {
        *self.rotation.lock().unwrap() = policy;
    }

    /// Flush and release the writer. The active chunk stays unsealed and
    /// resumes on the next open.
    pub fn close(&self) -> Result<(), Error> {
        let mut slot = self.slot.lock().unwrap();
        slot.closed = true;
        if let Some(writer) = slot.writer.take() {
            writer.close()?;
        }
        Ok(())
    }
}
