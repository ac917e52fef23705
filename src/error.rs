//! Typed error codes crossing the storage API boundary.
//!
//! Most functions in this crate return `anyhow::Error`. The variants below
//! are the errors callers are expected to branch on; they are embedded in
//! the `anyhow` chain and recovered with [`StoreError::from_err`].

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("encoded attributes too large ({size} > {limit} bytes)")]
    AttrsTooLarge { size: usize, limit: usize },

    #[error("invalid attribute data - {0}")]
    InvalidAttrsData(String),

    #[error("no more records")]
    NoMoreRecords,

    #[error("chunk {0} is not sealed")]
    ChunkNotSealed(Uuid),

    #[error("chunk {0} not found")]
    ChunkNotFound(Uuid),

    #[error("chunk {0} is the active chunk")]
    ActiveChunk(Uuid),

    #[error("record write timestamp missing or older than predecessor")]
    MissingWriteTS,

    #[error("string dictionary is full")]
    DictFull,

    #[error("dictionary entry {0} not found")]
    DictEntryNotFound(u32),

    #[error("invalid resume token")]
    InvalidResumeToken,

    #[error("index file {0:?} not found")]
    IndexNotFound(String),

    #[error("record of {0} bytes exceeds hard chunk limits")]
    HardLimitExceeded(u64),

    #[error("chunk {0} is in use")]
    ResourceBusy(Uuid),

    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Recover the typed error from an `anyhow` chain, if present.
    pub fn from_err(err: &anyhow::Error) -> Option<&StoreError> {
        err.downcast_ref::<StoreError>()
    }

    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(Self::from_err(err), Some(StoreError::Cancelled))
    }

    pub fn is_no_more_records(err: &anyhow::Error) -> bool {
        matches!(Self::from_err(err), Some(StoreError::NoMoreRecords))
    }
}
