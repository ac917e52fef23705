//! Per-chunk inverted indexes.
//!
//! All posting-list files share one shape: a 4-byte header, a key count,
//! a lexicographically sorted key table (key bytes, posting offset,
//! posting count) and a flat blob of u64 record positions grouped per
//! key. That layout gives O(log k) key lookup and O(1) posting-list
//! slicing. Index files exist only for sealed chunks and are replaced
//! atomically on rebuild.

mod format;
pub use format::*;

mod writer;
pub use writer::*;

mod reader;
pub use reader::*;
