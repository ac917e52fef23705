//! Index builders for sealed chunks.
//!
//! Every builder walks the chunk once, accumulates postings in sorted
//! maps and replaces its file atomically, so rebuilding is idempotent:
//! the same sealed chunk always produces byte-identical output.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Error;
use log::{info, warn};

use crate::error::StoreError;
use crate::extract::{
    each_token, extract_pairs, index_key, is_indexable, standard_extractors, KvExtractor,
};
use crate::store::{
    ChunkData, ChunkId, ChunkStore, FLAG_CAPPED, TYPE_ATTR_KEY_INDEX, TYPE_ATTR_KV_INDEX,
    TYPE_ATTR_VALUE_INDEX, TYPE_KV_KEY_INDEX, TYPE_KV_KV_INDEX, TYPE_KV_VALUE_INDEX,
    TYPE_SOURCE_INDEX, TYPE_TOKEN_INDEX,
};
use crate::tools;

use super::format::{
    encode_posting_file, encode_time_index, kv_key, KeyLayout, ATTR_KEY_INDEX_NAME,
    ATTR_KV_INDEX_NAME, ATTR_VALUE_INDEX_NAME, KV_KEY_INDEX_NAME, KV_KV_INDEX_NAME,
    KV_VALUE_INDEX_NAME, SOURCE_INDEX_NAME, TIME_INDEX_NAME, TOKEN_INDEX_NAME,
};

/// Indexing options.
pub struct IndexConfig {
    /// Sample every Nth record into the sparse time index.
    pub time_stride: u64,
    /// Byte budget for the message-KV indexes; exceeding it caps them.
    pub kv_budget: u64,
    /// Extractors feeding the message-KV indexes.
    pub extractors: Vec<Box<dyn KvExtractor>>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            time_stride: 128,
            kv_budget: 8 * 1024 * 1024,
            extractors: standard_extractors(),
        }
    }
}

type PostingMap = BTreeMap<Vec<u8>, Vec<u64>>;

fn push_posting(map: &mut PostingMap, key: Vec<u8>, position: u64) {
    let positions = map.entry(key).or_default();
    if positions.last() != Some(&position) {
        positions.push(position);
    }
}

fn map_entries(map: PostingMap) -> Vec<(Vec<u8>, Vec<u64>)> {
    map.into_iter().collect()
}

/// Write an index file atomically next to the chunk data.
fn write_index_file(
    dir: &Path,
    name: &str,
    ftype: u8,
    flags: u8,
    layout: KeyLayout,
    entries: &[(Vec<u8>, Vec<u64>)],
) -> Result<(), Error> {
    let data = encode_posting_file(ftype, flags, layout, entries)?;
    tools::replace_file(dir.join(name), &data)
}

/// Build the token index: every indexable token maps to the sorted
/// positions of the records containing it.
pub fn build_token_index(data: &ChunkData, dir: &Path) -> Result<(), Error> {
    let mut map = PostingMap::new();
    let mut buf = Vec::with_capacity(64);

    for position in 0..data.records() {
        let raw = match data.raw(position) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("token index skipping record {} - {}", position, err);
                continue;
            }
        };
        each_token(raw, &mut buf, |run| {
            if is_indexable(run) {
                push_posting(&mut map, index_key(run).to_vec(), position);
            }
        });
    }

    write_index_file(
        dir,
        TOKEN_INDEX_NAME,
        TYPE_TOKEN_INDEX,
        0,
        KeyLayout::Var,
        &map_entries(map),
    )
}

/// Build the attribute key / value / kv indexes in one pass.
pub fn build_attr_indexes(data: &ChunkData, dir: &Path) -> Result<(), Error> {
    let mut keys = PostingMap::new();
    let mut values = PostingMap::new();
    let mut kvs = PostingMap::new();

    for position in 0..data.records() {
        let attrs = match data.attrs(position) {
            Ok(attrs) => attrs,
            Err(err) => {
                warn!("attr index skipping record {} - {}", position, err);
                continue;
            }
        };
        for (key, value) in &attrs {
            let key = key.to_ascii_lowercase().into_bytes();
            let value = value.to_ascii_lowercase().into_bytes();
            push_posting(&mut kvs, kv_key(&key, &value), position);
            push_posting(&mut keys, key, position);
            push_posting(&mut values, value, position);
        }
    }

    write_index_file(
        dir,
        ATTR_KEY_INDEX_NAME,
        TYPE_ATTR_KEY_INDEX,
        0,
        KeyLayout::Var,
        &map_entries(keys),
    )?;
    write_index_file(
        dir,
        ATTR_VALUE_INDEX_NAME,
        TYPE_ATTR_VALUE_INDEX,
        0,
        KeyLayout::Var,
        &map_entries(values),
    )?;
    write_index_file(
        dir,
        ATTR_KV_INDEX_NAME,
        TYPE_ATTR_KV_INDEX,
        0,
        KeyLayout::Var,
        &map_entries(kvs),
    )
}

/// Build the message-KV key / value / kv indexes from the extractor set.
///
/// The three maps share one byte budget; once exceeded, remaining
/// records are skipped and all three files carry the capped flag.
pub fn build_kv_indexes(
    data: &ChunkData,
    dir: &Path,
    extractors: &[Box<dyn KvExtractor>],
    budget: u64,
) -> Result<(), Error> {
    let mut keys = PostingMap::new();
    let mut values = PostingMap::new();
    let mut kvs = PostingMap::new();
    let mut spent = 0u64;
    let mut capped = false;

    for position in 0..data.records() {
        if budget > 0 && spent > budget {
            capped = true;
            warn!(
                "kv index budget exhausted at record {} of {}; marking capped",
                position,
                data.records()
            );
            break;
        }
        let raw = match data.raw(position) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("kv index skipping record {} - {}", position, err);
                continue;
            }
        };
        for (key, value) in extract_pairs(extractors, raw) {
            let key = key.into_bytes();
            let value = value.into_bytes();
            // rough cost: key bytes appear in two tables, the pair key
            // in one, plus three posting slots
            spent += (2 * key.len() + 2 * value.len() + 1 + 3 * 8) as u64;
            push_posting(&mut kvs, kv_key(&key, &value), position);
            push_posting(&mut keys, key, position);
            push_posting(&mut values, value, position);
        }
    }

    let flags = if capped { FLAG_CAPPED } else { 0 };
    write_index_file(
        dir,
        KV_KEY_INDEX_NAME,
        TYPE_KV_KEY_INDEX,
        flags,
        KeyLayout::Var,
        &map_entries(keys),
    )?;
    write_index_file(
        dir,
        KV_VALUE_INDEX_NAME,
        TYPE_KV_VALUE_INDEX,
        flags,
        KeyLayout::Var,
        &map_entries(values),
    )?;
    write_index_file(
        dir,
        KV_KV_INDEX_NAME,
        TYPE_KV_KV_INDEX,
        flags,
        KeyLayout::Var,
        &map_entries(kvs),
    )
}

/// Build the sparse time index: every Nth record's write timestamp.
pub fn build_time_index(data: &ChunkData, dir: &Path, stride: u64) -> Result<(), Error> {
    let stride = stride.max(1);
    let mut entries = Vec::new();
    let mut position = 0u64;
    while position < data.records() {
        entries.push((data.write_ts(position)?, position));
        position += stride;
    }

    tools::replace_file(dir.join(TIME_INDEX_NAME), &encode_time_index(&entries))
}

/// Build the source index: records carrying a canonical-UUID `source`
/// attribute are posted under its 16 raw bytes.
pub fn build_source_index(data: &ChunkData, dir: &Path) -> Result<(), Error> {
    let mut map = PostingMap::new();

    for position in 0..data.records() {
        let attrs = match data.attrs(position) {
            Ok(attrs) => attrs,
            Err(_) => continue,
        };
        if let Some(source) = attrs.get("source") {
            if source.len() != 36 {
                continue;
            }
            if let Ok(id) = ChunkId::parse_str(source) {
                push_posting(&mut map, id.as_bytes().to_vec(), position);
            }
        }
    }

    write_index_file(
        dir,
        SOURCE_INDEX_NAME,
        TYPE_SOURCE_INDEX,
        0,
        KeyLayout::Fixed(16),
        &map_entries(map),
    )
}

/// Build the full index set for a sealed chunk.
pub fn build_chunk_indexes(
    store: &ChunkStore,
    id: ChunkId,
    config: &IndexConfig,
) -> Result<(), Error> {
    let meta = store.meta(id)?;
    if !meta.sealed {
        return Err(StoreError::ChunkNotSealed(id).into());
    }

    let data = store.open_chunk_data(id)?;
    let dir = store.chunk_dir(id);

    build_attr_indexes(&data, &dir)?;
    build_kv_indexes(&data, &dir, &config.extractors, config.kv_budget)?;
    build_time_index(&data, &dir, config.time_stride)?;
    build_source_index(&data, &dir)?;
    // the token index is written last: its presence marks the chunk as
    // fully indexed
    build_token_index(&data, &dir)?;

    info!("indexed chunk {} ({} records)", id, data.records());
    Ok(())
}
