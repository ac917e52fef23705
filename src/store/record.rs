use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

/// Chunk identifier: a UUID v7, monotone by creation time. The canonical
/// text form is the usual 8-4-4-4-12 hex representation.
pub type ChunkId = Uuid;

/// Attribute mapping. A `BTreeMap` keeps iteration in key order, which is
/// what makes attribute encoding byte-for-byte deterministic.
pub type Attrs = BTreeMap<String, String>;

/// Position of a record within a specific chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordRef {
    pub chunk_id: ChunkId,
    pub position: u64,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.chunk_id, self.position)
    }
}

/// An owned record. Timestamps are Unix microseconds; `write_ts` is
/// assigned by the store on append (unless preserved) and is
/// non-decreasing within a chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    pub ingest_ts: i64,
    pub write_ts: i64,
    pub attrs: Attrs,
    pub raw: Vec<u8>,
}

impl Record {
    pub fn new<B: Into<Vec<u8>>>(raw: B) -> Self {
        Self {
            ingest_ts: 0,
            write_ts: 0,
            attrs: Attrs::new(),
            raw: raw.into(),
        }
    }

    pub fn with_attr<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_ingest_ts(mut self, ts: i64) -> Self {
        self.ingest_ts = ts;
        self
    }

    pub fn with_write_ts(mut self, ts: i64) -> Self {
        self.write_ts = ts;
        self
    }
}

/// A record as returned by a chunk cursor. The payload borrows the
/// chunk's mapped file, so the view must not outlive the cursor; use
/// [`RecordView::to_record`] to detach it.
#[derive(Debug)]
pub struct RecordView<'a> {
    pub ingest_ts: i64,
    pub write_ts: i64,
    pub attrs: Attrs,
    pub raw: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Deep copy into an owned record that outlives the mapped source.
    pub fn to_record(&self) -> Record {
        Record {
            ingest_ts: self.ingest_ts,
            write_ts: self.write_ts,
            attrs: self.attrs.clone(),
            raw: self.raw.to_vec(),
        }
    }
}
