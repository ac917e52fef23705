//! On-disk format constants and the fixed-size codecs.
//!
//! Every structured file starts with a 4-byte header tuple
//! `(signature, type, version, flags)`; readers reject unknown
//! signatures, types and versions. All multi-byte integers are
//! little-endian.

use anyhow::{bail, Error};

use crate::error::StoreError;

/// Concatenated raw record payloads.
pub const RAW_LOG_NAME: &str = "raw.log";
/// Concatenated encoded attribute blobs.
pub const ATTR_LOG_NAME: &str = "attr.log";
/// Fixed 30-byte record index entries.
pub const IDX_LOG_NAME: &str = "idx.log";
/// Per-chunk string dictionary (header + entries).
pub const DICT_LOG_NAME: &str = "attr_dict.log";
/// Chunk metadata (JSON).
pub const META_NAME: &str = "meta.json";

/// Extension of compressed chunk-file counterparts.
pub const ZST_EXT: &str = "zst";

/// Signature byte shared by all structured chunklog files.
pub const FILE_SIG: u8 = b'i';
/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// File type bytes (second header byte).
pub const TYPE_DICT: u8 = b's';
pub const TYPE_TOKEN_INDEX: u8 = b't';
pub const TYPE_ATTR_KEY_INDEX: u8 = b'k';
pub const TYPE_ATTR_VALUE_INDEX: u8 = b'v';
pub const TYPE_ATTR_KV_INDEX: u8 = b'a';
pub const TYPE_KV_KEY_INDEX: u8 = b'e';
pub const TYPE_KV_VALUE_INDEX: u8 = b'f';
pub const TYPE_KV_KV_INDEX: u8 = b'g';
pub const TYPE_TIME_INDEX: u8 = b'x';
pub const TYPE_SOURCE_INDEX: u8 = b'u';

/// Header flag: the index builder hit its byte budget and the file is
/// known incomplete. Readers must treat missing keys as "unknown".
pub const FLAG_CAPPED: u8 = 0x01;

/// Upper bound for one encoded attribute blob and for any single
/// attribute key or value (u16 length fields).
pub const MAX_ATTR_BLOB_SIZE: usize = 65535;

/// The common 4-byte file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub ftype: u8,
    pub version: u8,
    pub flags: u8,
}

impl FileHeader {
    pub const SIZE: usize = 4;

    pub fn new(ftype: u8) -> Self {
        Self {
            ftype,
            version: FORMAT_VERSION,
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode(&self) -> [u8; 4] {
        [FILE_SIG, self.ftype, self.version, self.flags]
    }

    /// Decode and validate a header, checking the expected file type.
    pub fn decode(data: &[u8], expect_type: u8) -> Result<Self, Error> {
        if data.len() < Self::SIZE {
            bail!("file too small for header ({} bytes)", data.len());
        }
        if data[0] != FILE_SIG {
            bail!("got unknown file signature 0x{:02x}", data[0]);
        }
        if data[1] != expect_type {
            bail!(
                "got unexpected file type 0x{:02x} (expected 0x{:02x})",
                data[1],
                expect_type
            );
        }
        if data[2] != FORMAT_VERSION {
            bail!("got unsupported format version {}", data[2]);
        }
        Ok(Self {
            ftype: data[1],
            version: data[2],
            flags: data[3],
        })
    }
}

/// The dictionary file header bytes: `'i', 's', 0x01, 0x00`.
pub const DICT_FILE_MAGIC: [u8; 4] = [FILE_SIG, TYPE_DICT, FORMAT_VERSION, 0];

/// One fixed-size record index entry.
///
/// ```text
/// Offset  Size  Field
///    0      4   raw_offset    byte offset into raw.log (LE u32)
///    4      4   raw_len       payload length (LE u32)
///    8      4   attr_offset   byte offset into attr.log (LE u32)
///   12      2   attr_len      encoded attribute blob length (LE u16)
///   14      8   ingest_ts     Unix microseconds (LE i64)
///   22      8   write_ts      Unix microseconds (LE i64)
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdxEntry {
    pub raw_offset: u32,
    pub raw_len: u32,
    pub attr_offset: u32,
    pub attr_len: u16,
    pub ingest_ts: i64,
    pub write_ts: i64,
}

pub const IDX_ENTRY_SIZE: usize = 30;

impl IdxEntry {
    pub fn encode(&self) -> [u8; IDX_ENTRY_SIZE] {
        let mut buf = [0u8; IDX_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.raw_offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.raw_len.to_le_bytes());
        buf[8..12].copy_from_slice(&self.attr_offset.to_le_bytes());
        buf[12..14].copy_from_slice(&self.attr_len.to_le_bytes());
        buf[14..22].copy_from_slice(&self.ingest_ts.to_le_bytes());
        buf[22..30].copy_from_slice(&self.write_ts.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < IDX_ENTRY_SIZE {
            return Err(StoreError::InvalidAttrsData(format!(
                "truncated index entry ({} bytes)",
                data.len()
            ))
            .into());
        }
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        let raw_offset = u32_at(0);
        let raw_len = u32_at(4);
        let attr_offset = u32_at(8);
        let attr_len = u16::from_le_bytes([data[12], data[13]]);
        let i64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[o..o + 8]);
            i64::from_le_bytes(b)
        };
        Ok(Self {
            raw_offset,
            raw_len,
            attr_offset,
            attr_len,
            ingest_ts: i64_at(14),
            write_ts: i64_at(22),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idx_entry_roundtrip() {
        let entry = IdxEntry {
            raw_offset: 17,
            raw_len: 4096,
            attr_offset: 99,
            attr_len: 42,
            ingest_ts: 1_700_000_000_000_000,
            write_ts: 1_700_000_000_000_001,
        };
        let buf = entry.encode();
        assert_eq!(buf.len(), IDX_ENTRY_SIZE);
        assert_eq!(IdxEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn header_rejects_unknown() {
        let good = FileHeader::new(TYPE_TOKEN_INDEX).encode();
        assert!(FileHeader::decode(&good, TYPE_TOKEN_INDEX).is_ok());

        let mut bad_sig = good;
        bad_sig[0] = b'X';
        assert!(FileHeader::decode(&bad_sig, TYPE_TOKEN_INDEX).is_err());

        // wrong type
        assert!(FileHeader::decode(&good, TYPE_TIME_INDEX).is_err());

        let mut bad_version = good;
        bad_version[2] = 9;
        assert!(FileHeader::decode(&bad_version, TYPE_TOKEN_INDEX).is_err());
    }

    #[test]
    fn dict_magic_matches_header() {
        assert_eq!(DICT_FILE_MAGIC, FileHeader::new(TYPE_DICT).encode());
        assert_eq!(&DICT_FILE_MAGIC[..2], b"is");
    }
}
