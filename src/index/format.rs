//! Posting-list and time-index file codecs.
//!
//! ```text
//! posting file:
//!   header:4                     (signature, type, version, flags)
//!   keyCount:u32
//!   key table, sorted:           keyLen:u16, key, offset:u32, count:u32
//!                                (fixed-key layout drops the keyLen)
//!   posting blob:                u64 positions, grouped per key
//!
//! time index:
//!   header:4
//!   count:u32
//!   entries:                     writeTS:i64, position:u64
//! ```

use anyhow::{bail, Error};

use crate::store::{FileHeader, TYPE_TIME_INDEX};

pub const TOKEN_INDEX_NAME: &str = "token.idx";
pub const ATTR_KEY_INDEX_NAME: &str = "akey.idx";
pub const ATTR_VALUE_INDEX_NAME: &str = "aval.idx";
pub const ATTR_KV_INDEX_NAME: &str = "akv.idx";
pub const KV_KEY_INDEX_NAME: &str = "kkey.idx";
pub const KV_VALUE_INDEX_NAME: &str = "kval.idx";
pub const KV_KV_INDEX_NAME: &str = "kkv.idx";
pub const TIME_INDEX_NAME: &str = "time.idx";
pub const SOURCE_INDEX_NAME: &str = "source.idx";

/// Separator between the key and value halves of a kv posting key.
pub const KV_SEPARATOR: u8 = 0;

/// How keys are stored in the key table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLayout {
    /// Length-prefixed variable keys.
    Var,
    /// Fixed-width keys (the source index uses 16-byte UUIDs).
    Fixed(usize),
}

/// Encode a posting file. `entries` must be sorted by key with ascending
/// positions per key; the index builders produce exactly that.
pub fn encode_posting_file(
    ftype: u8,
    flags: u8,
    layout: KeyLayout,
    entries: &[(Vec<u8>, Vec<u64>)],
) -> Result<Vec<u8>, Error> {
    let mut table = Vec::new();
    let mut blob = Vec::new();

    for (key, positions) in entries {
        if let KeyLayout::Fixed(len) = layout {
            if key.len() != len {
                bail!("fixed layout key of {} bytes (expected {})", key.len(), len);
            }
        } else {
            if key.len() > u16::MAX as usize {
                bail!("posting key of {} bytes is too long", key.len());
            }
            table.extend_from_slice(&(key.len() as u16).to_le_bytes());
        }
        table.extend_from_slice(key);
        table.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        table.extend_from_slice(&(positions.len() as u32).to_le_bytes());
        for position in positions {
            blob.extend_from_slice(&position.to_le_bytes());
        }
    }

    if entries.len() > u32::MAX as usize {
        bail!("too many posting keys ({})", entries.len());
    }

    let mut out = Vec::with_capacity(4 + 4 + table.len() + blob.len());
    out.extend_from_slice(&FileHeader::new(ftype).with_flags(flags).encode());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&table);
    out.extend_from_slice(&blob);
    Ok(out)
}

/// Decode and validate a posting file. Returns the header flags and the
/// entries in key order.
pub fn decode_posting_file(
    data: &[u8],
    ftype: u8,
    layout: KeyLayout,
) -> Result<(u8, Vec<(Vec<u8>, Vec<u64>)>), Error> {
    let header = FileHeader::decode(data, ftype)?;
    if data.len() < 8 {
        bail!("posting file too small ({} bytes)", data.len());
    }
    let key_count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;

    // first pass: the key table
    let mut pos = 8usize;
    let mut table = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        let key_len = match layout {
            KeyLayout::Fixed(len) => len,
            KeyLayout::Var => {
                if pos + 2 > data.len() {
                    bail!("truncated posting key table");
                }
                let len = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
                pos += 2;
                len
            }
        };
        if pos + key_len + 8 > data.len() {
            bail!("truncated posting key table");
        }
        let key = data[pos..pos + key_len].to_vec();
        pos += key_len;
        let offset = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let count =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        pos += 8;
        table.push((key, offset as usize, count as usize));
    }

    // second pass: slice the posting blob
    let blob = &data[pos..];
    let mut entries = Vec::with_capacity(key_count);
    let mut prev_key: Option<&[u8]> = None;
    for (key, offset, count) in &table {
        if let Some(prev) = prev_key {
            if prev >= key.as_slice() {
                bail!("posting keys are not sorted");
            }
        }
        let end = offset
            .checked_add(count * 8)
            .filter(|end| *end <= blob.len())
            .ok_or_else(|| {
                anyhow::format_err!("posting slice [{}, +{}) overflows blob", offset, count * 8)
            })?;
        let mut positions = Vec::with_capacity(*count);
        let mut at = *offset;
        while at < end {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&blob[at..at + 8]);
            positions.push(u64::from_le_bytes(buf));
            at += 8;
        }
        entries.push((key.clone(), positions));
        prev_key = Some(key);
    }

    Ok((header.flags, entries))
}

/// Build a kv posting key from its halves.
pub fn kv_key(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1 + value.len());
    out.extend_from_slice(key);
    out.push(KV_SEPARATOR);
    out.extend_from_slice(value);
    out
}

pub fn encode_time_index(entries: &[(i64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + entries.len() * 16);
    out.extend_from_slice(&FileHeader::new(TYPE_TIME_INDEX).encode());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (write_ts, position) in entries {
        out.extend_from_slice(&write_ts.to_le_bytes());
        out.extend_from_slice(&position.to_le_bytes());
    }
    out
}

pub fn decode_time_index(data: &[u8]) -> Result<Vec<(i64, u64)>, Error> {
    FileHeader::decode(data, TYPE_TIME_INDEX)?;
    if data.len() < 8 {
        bail!("time index too small ({} bytes)", data.len());
    }
    let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if data.len() != 8 + count * 16 {
        bail!(
            "time index of {} entries has {} bytes",
            count,
            data.len()
        );
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = 8 + i * 16;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[at..at + 8]);
        let mut position = [0u8; 8];
        position.copy_from_slice(&data[at + 8..at + 16]);
        entries.push((i64::from_le_bytes(ts), u64::from_le_bytes(position)));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TYPE_SOURCE_INDEX, TYPE_TOKEN_INDEX};

    #[test]
    fn posting_file_roundtrip() {
        let entries = vec![
            (b"alpha".to_vec(), vec![0u64, 3, 7]),
            (b"beta".to_vec(), vec![1u64]),
            (b"gamma".to_vec(), vec![2u64, 4]),
        ];
        let data = encode_posting_file(TYPE_TOKEN_INDEX, 0, KeyLayout::Var, &entries).unwrap();
        let (flags, decoded) =
            decode_posting_file(&data, TYPE_TOKEN_INDEX, KeyLayout::Var).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(decoded, entries);
    }

    #[test]
    fn fixed_key_roundtrip() {
        let entries = vec![([7u8; 16].to_vec(), vec![1u64, 2])];
        let data =
            encode_posting_file(TYPE_SOURCE_INDEX, 0, KeyLayout::Fixed(16), &entries).unwrap();
        let (_, decoded) =
            decode_posting_file(&data, TYPE_SOURCE_INDEX, KeyLayout::Fixed(16)).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn flags_survive_the_trip() {
        let data = encode_posting_file(
            TYPE_TOKEN_INDEX,
            crate::store::FLAG_CAPPED,
            KeyLayout::Var,
            &[],
        )
        .unwrap();
        let (flags, entries) =
            decode_posting_file(&data, TYPE_TOKEN_INDEX, KeyLayout::Var).unwrap();
        assert_eq!(flags, crate::store::FLAG_CAPPED);
        assert!(entries.is_empty());
    }

    #[test]
    fn decode_rejects_unsorted_keys() {
        let entries = vec![(b"b".to_vec(), vec![0u64]), (b"a".to_vec(), vec![1u64])];
        let data = encode_posting_file(TYPE_TOKEN_INDEX, 0, KeyLayout::Var, &entries).unwrap();
        assert!(decode_posting_file(&data, TYPE_TOKEN_INDEX, KeyLayout::Var).is_err());
    }

    #[test]
    fn decode_rejects_truncation() {
        let entries = vec![(b"alpha".to_vec(), vec![0u64, 1, 2])];
        let data = encode_posting_file(TYPE_TOKEN_INDEX, 0, KeyLayout::Var, &entries).unwrap();
        assert!(decode_posting_file(&data[..data.len() - 3], TYPE_TOKEN_INDEX, KeyLayout::Var)
            .is_err());
    }

    #[test]
    fn time_index_roundtrip() {
        let entries = vec![(100i64, 0u64), (250, 64), (900, 128)];
        let data = encode_time_index(&entries);
        assert_eq!(decode_time_index(&data).unwrap(), entries);
    }
}
