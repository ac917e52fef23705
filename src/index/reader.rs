//! Index readers: immutable posting-list access for queries and
//! analyzers.
//!
//! A reader loads its file fully and is safe to share across concurrent
//! queries. Malformed files surface data errors, which the query planner
//! downgrades to runtime filtering; missing files yield `IndexNotFound`.

use std::path::Path;

use anyhow::Error;
use log::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{
    FLAG_CAPPED, TYPE_ATTR_KEY_INDEX, TYPE_ATTR_KV_INDEX, TYPE_ATTR_VALUE_INDEX,
    TYPE_KV_KEY_INDEX, TYPE_KV_KV_INDEX, TYPE_KV_VALUE_INDEX, TYPE_SOURCE_INDEX,
    TYPE_TOKEN_INDEX,
};

use super::format::{
    decode_posting_file, decode_time_index, kv_key, KeyLayout, ATTR_KEY_INDEX_NAME,
    ATTR_KV_INDEX_NAME, ATTR_VALUE_INDEX_NAME, KV_KEY_INDEX_NAME, KV_KV_INDEX_NAME,
    KV_VALUE_INDEX_NAME, SOURCE_INDEX_NAME, TIME_INDEX_NAME, TOKEN_INDEX_NAME,
};

pub struct PostingReader {
    flags: u8,
    entries: Vec<(Vec<u8>, Vec<u64>)>,
}

impl PostingReader {
    pub fn open(dir: &Path, name: &str, ftype: u8, layout: KeyLayout) -> Result<Self, Error> {
        let path = dir.join(name);
        if !path.exists() {
            return Err(StoreError::IndexNotFound(name.to_string()).into());
        }
        let data = std::fs::read(&path)?;
        let (flags, entries) = decode_posting_file(&data, ftype, layout)?;
        Ok(Self { flags, entries })
    }

    /// Whether the builder hit its byte budget; missing keys then mean
    /// "unknown", not "no matches".
    pub fn is_capped(&self) -> bool {
        self.flags & FLAG_CAPPED != 0
    }

    /// Posting list for `key`, ascending positions.
    pub fn lookup(&self, key: &[u8]) -> Option<&[u64]> {
        self.entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| self.entries[i].1.as_slice())
    }

    /// Posting list for a (key, value) pair.
    pub fn lookup_kv(&self, key: &[u8], value: &[u8]) -> Option<&[u64]> {
        self.lookup(&kv_key(key, value))
    }

    /// All entries, for analysis consumers.
    pub fn entries(&self) -> &[(Vec<u8>, Vec<u64>)] {
        &self.entries
    }
}

pub struct TimeIndexReader {
    entries: Vec<(i64, u64)>,
}

impl TimeIndexReader {
    pub fn open(dir: &Path) -> Result<Self, Error> {
        let path = dir.join(TIME_INDEX_NAME);
        if !path.exists() {
            return Err(StoreError::IndexNotFound(TIME_INDEX_NAME.to_string()).into());
        }
        let data = std::fs::read(&path)?;
        Ok(Self {
            entries: decode_time_index(&data)?,
        })
    }

    /// A safe lower-bound position for "first record with write
    /// timestamp >= ts": the position of the last sampled record whose
    /// timestamp is still below `ts`. `None` for an empty index.
    pub fn find_start(&self, ts: i64) -> Option<u64> {
        if self.entries.is_empty() {
            return None;
        }
        let below = self.entries.partition_point(|(entry_ts, _)| *entry_ts < ts);
        if below == 0 {
            Some(0)
        } else {
            Some(self.entries[below - 1].1)
        }
    }

    pub fn entries(&self) -> &[(i64, u64)] {
        &self.entries
    }
}

pub struct SourceIndexReader {
    inner: PostingReader,
}

impl SourceIndexReader {
    pub fn open(dir: &Path) -> Result<Self, Error> {
        Ok(Self {
            inner: PostingReader::open(
                dir,
                SOURCE_INDEX_NAME,
                TYPE_SOURCE_INDEX,
                KeyLayout::Fixed(16),
            )?,
        })
    }

    pub fn lookup(&self, source: &Uuid) -> Option<&[u64]> {
        self.inner.lookup(source.as_bytes())
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u64>)] {
        self.inner.entries()
    }
}

/// The full index set of one chunk. Absent or unreadable files load as
/// `None`; the affected predicates fall back to runtime scanning.
#[derive(Default)]
pub struct ChunkIndexes {
    pub token: Option<PostingReader>,
    pub attr_key: Option<PostingReader>,
    pub attr_value: Option<PostingReader>,
    pub attr_kv: Option<PostingReader>,
    pub kv_key: Option<PostingReader>,
    pub kv_value: Option<PostingReader>,
    pub kv_kv: Option<PostingReader>,
    pub time: Option<TimeIndexReader>,
    pub source: Option<SourceIndexReader>,
}

fn open_or_none(
    dir: &Path,
    name: &str,
    ftype: u8,
    layout: KeyLayout,
) -> Option<PostingReader> {
    match PostingReader::open(dir, name, ftype, layout) {
        Ok(reader) => Some(reader),
        Err(err) => {
            if !matches!(
                StoreError::from_err(&err),
                Some(StoreError::IndexNotFound(_))
            ) {
                warn!("index {:?}/{} unreadable, falling back to scan - {}", dir, name, err);
            }
            None
        }
    }
}

impl ChunkIndexes {
    pub fn open(dir: &Path) -> Self {
        Self {
            token: open_or_none(dir, TOKEN_INDEX_NAME, TYPE_TOKEN_INDEX, KeyLayout::Var),
            attr_key: open_or_none(dir, ATTR_KEY_INDEX_NAME, TYPE_ATTR_KEY_INDEX, KeyLayout::Var),
            attr_value: open_or_none(
                dir,
                ATTR_VALUE_INDEX_NAME,
                TYPE_ATTR_VALUE_INDEX,
                KeyLayout::Var,
            ),
            attr_kv: open_or_none(dir, ATTR_KV_INDEX_NAME, TYPE_ATTR_KV_INDEX, KeyLayout::Var),
            kv_key: open_or_none(dir, KV_KEY_INDEX_NAME, TYPE_KV_KEY_INDEX, KeyLayout::Var),
            kv_value: open_or_none(
                dir,
                KV_VALUE_INDEX_NAME,
                TYPE_KV_VALUE_INDEX,
                KeyLayout::Var,
            ),
            kv_kv: open_or_none(dir, KV_KV_INDEX_NAME, TYPE_KV_KV_INDEX, KeyLayout::Var),
            time: match TimeIndexReader::open(dir) {
                Ok(reader) => Some(reader),
                Err(err) => {
                    if !matches!(
                        StoreError::from_err(&err),
                        Some(StoreError::IndexNotFound(_))
                    ) {
                        warn!("time index in {:?} unreadable - {}", dir, err);
                    }
                    None
                }
            },
            source: match SourceIndexReader::open(dir) {
                Ok(reader) => Some(reader),
                Err(err) => {
                    if !matches!(
                        StoreError::from_err(&err),
                        Some(StoreError::IndexNotFound(_))
                    ) {
                        warn!("source index in {:?} unreadable - {}", dir, err);
                    }
                    None
                }
            },
        }
    }
}
