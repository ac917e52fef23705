//! This module implements the chunk storage and access layer.
//!
//! # Data formats
//!
//! Records are grouped into *chunks*. A chunk is a directory holding a
//! raw payload log, an attribute blob log, a fixed-size record index, a
//! per-chunk string dictionary and a JSON metadata file. All multi-byte
//! integers on disk are little-endian.
//!
//! The record index (`idx.log`) holds one fixed 30-byte entry per record,
//! which makes position lookup O(1) and timestamp search a binary search
//! over the file.
//!
//! Attribute blobs are stored either plain (inline strings) or
//! dictionary-compressed (u32 references into the per-chunk string
//! dictionary). The encoding is a per-chunk property recorded in the
//! metadata, so the blobs themselves carry no discriminator byte.
//!
//! # Lifecycle
//!
//! Exactly one chunk per store is *active* (writable). Rotation policies
//! are pure functions over a snapshot of the active chunk state; when one
//! fires, the active chunk is sealed and a new one is opened atomically
//! before the pending write. Sealed chunks are immutable: indexes are
//! built for them, they may be zstd-compressed, and retention policies
//! eventually flag them for deletion.
//!
//! # Locking
//!
//! The store directory is guarded by an exclusive flock, so at most one
//! process owns the writer. Within the process, appends and seals are
//! serialized under the writer mutex, while the sealed-chunk map is
//! behind a read-write lock. Cursors and index readers operate on
//! immutable snapshots and run in parallel with the writer. Index files
//! become visible atomically (temp file + rename), so a concurrent
//! reader observes either the old or the new file, never a mix.

mod record;
pub use record::*;

mod file_formats;
pub use file_formats::*;

mod attr_codec;
pub use attr_codec::*;

mod string_dict;
pub use string_dict::*;

mod chunk_meta;
pub use chunk_meta::*;

mod chunk;
pub use chunk::*;

mod cursor;
pub use cursor::*;

mod rotation;
pub use rotation::*;

mod retention;
pub use retention::*;

mod chunk_store;
pub use chunk_store::*;

mod compress;

mod maintain;
pub use maintain::*;
