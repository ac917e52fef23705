//! Attribute blob codecs.
//!
//! Two encodings share the `count:u16` prefix but are never mixed within
//! one chunk; the chunk metadata records which one is in use.
//!
//! Plain:
//!
//! ```text
//! count:u16
//! repeat count:
//!     keyLen:u16, key bytes, valLen:u16, val bytes
//! ```
//!
//! Dictionary-compressed:
//!
//! ```text
//! count:u16
//! repeat count:
//!     keyID:u32, valID:u32
//! ```
//!
//! Pairs are emitted in key order in both encodings, so encoding the same
//! mapping twice yields identical bytes.

use anyhow::Error;

use crate::error::StoreError;

use super::file_formats::MAX_ATTR_BLOB_SIZE;
use super::record::Attrs;
use super::string_dict::StringDict;

/// Size of one dictionary-encoded pair.
const DICT_PAIR_SIZE: usize = 8;

fn too_large(size: usize) -> Error {
    StoreError::AttrsTooLarge {
        size,
        limit: MAX_ATTR_BLOB_SIZE,
    }
    .into()
}

fn invalid(msg: impl Into<String>) -> Error {
    StoreError::InvalidAttrsData(msg.into()).into()
}

/// Size of the plain encoding without producing it.
pub fn plain_encoded_len(attrs: &Attrs) -> Result<usize, Error> {
    let mut size = 2usize;
    for (key, value) in attrs {
        if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(too_large(key.len().max(value.len())));
        }
        size += 4 + key.len() + value.len();
    }
    if size > MAX_ATTR_BLOB_SIZE {
        return Err(too_large(size));
    }
    Ok(size)
}

/// Size of the dictionary encoding: exactly `2 + 8 * count`.
pub fn dict_encoded_len(attrs: &Attrs) -> Result<usize, Error> {
    for (key, value) in attrs {
        if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(too_large(key.len().max(value.len())));
        }
    }
    let size = 2 + DICT_PAIR_SIZE * attrs.len();
    if size > MAX_ATTR_BLOB_SIZE {
        return Err(too_large(size));
    }
    Ok(size)
}

/// Encode an attribute mapping in the plain format.
///
/// An empty mapping encodes to exactly `[0x00, 0x00]`.
pub fn encode_attrs(attrs: &Attrs) -> Result<Vec<u8>, Error> {
    let size = plain_encoded_len(attrs)?;

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(attrs.len() as u16).to_le_bytes());
    for (key, value) in attrs {
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
        buf.extend_from_slice(value.as_bytes());
    }

    Ok(buf)
}

/// Decode a plain attribute blob.
pub fn decode_attrs(data: &[u8]) -> Result<Attrs, Error> {
    if data.len() < 2 {
        return Err(invalid(format!("blob too small ({} bytes)", data.len())));
    }
    let count = u16::from_le_bytes([data[0], data[1]]) as usize;

    let mut attrs = Attrs::new();
    let mut pos = 2usize;
    for _ in 0..count {
        let (key, next) = read_string(data, pos)?;
        let (value, next) = read_string(data, next)?;
        pos = next;
        attrs.insert(key, value);
    }
    if pos != data.len() {
        return Err(invalid(format!("{} trailing bytes after blob", data.len() - pos)));
    }

    Ok(attrs)
}

fn read_string(data: &[u8], pos: usize) -> Result<(String, usize), Error> {
    if pos + 2 > data.len() {
        return Err(invalid("truncated length field"));
    }
    let len = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
    let start = pos + 2;
    if start + len > data.len() {
        return Err(invalid("string overflows blob"));
    }
    let s = std::str::from_utf8(&data[start..start + len])
        .map_err(|_| invalid("string is not valid utf-8"))?;
    Ok((s.to_string(), start + len))
}

/// Encode an attribute mapping against the chunk dictionary.
///
/// Returns the blob and the strings this call newly added to the
/// dictionary. The caller must make those dictionary entries durable
/// before the blob itself becomes visible.
pub fn encode_attrs_dict(
    attrs: &Attrs,
    dict: &mut StringDict,
) -> Result<(Vec<u8>, Vec<String>), Error> {
    let size = dict_encoded_len(attrs)?;

    let mut buf = Vec::with_capacity(size);
    let mut added = Vec::new();
    buf.extend_from_slice(&(attrs.len() as u16).to_le_bytes());
    for (key, value) in attrs {
        let key_id = add_tracked(dict, key, &mut added)?;
        let val_id = add_tracked(dict, value, &mut added)?;
        buf.extend_from_slice(&key_id.to_le_bytes());
        buf.extend_from_slice(&val_id.to_le_bytes());
    }

    Ok((buf, added))
}

fn add_tracked(dict: &mut StringDict, s: &str, added: &mut Vec<String>) -> Result<u32, Error> {
    let known = dict.lookup(s).is_some();
    let id = dict.add(s)?;
    if !known {
        added.push(s.to_string());
    }
    Ok(id)
}

/// Decode a dictionary-compressed attribute blob.
pub fn decode_attrs_dict(data: &[u8], dict: &StringDict) -> Result<Attrs, Error> {
    if data.len() < 2 {
        return Err(invalid(format!("blob too small ({} bytes)", data.len())));
    }
    let count = u16::from_le_bytes([data[0], data[1]]) as usize;
    if data.len() != 2 + DICT_PAIR_SIZE * count {
        return Err(invalid(format!(
            "dictionary blob of {} pairs has {} bytes",
            count,
            data.len()
        )));
    }

    let mut attrs = Attrs::new();
    for i in 0..count {
        let pos = 2 + i * DICT_PAIR_SIZE;
        let key_id = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let val_id = u32::from_le_bytes([
            data[pos + 4],
            data[pos + 5],
            data[pos + 6],
            data[pos + 7],
        ]);
        let key = dict.get(key_id)?;
        let value = dict.get(val_id)?;
        attrs.insert(key.to_string(), value.to_string());
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_attrs_encode_to_two_zero_bytes() {
        let blob = encode_attrs(&Attrs::new()).unwrap();
        assert_eq!(blob, vec![0x00, 0x00]);
        assert_eq!(decode_attrs(&blob).unwrap(), Attrs::new());
    }

    #[test]
    fn plain_roundtrip_is_deterministic() {
        let map = attrs(&[("svc", "api"), ("host", "h-1"), ("env", "prod")]);
        let first = encode_attrs(&map).unwrap();
        let second = encode_attrs(&map).unwrap();
        assert_eq!(first, second);
        assert_eq!(decode_attrs(&first).unwrap(), map);
    }

    #[test]
    fn plain_keys_are_sorted() {
        let map = attrs(&[("zeta", "1"), ("alpha", "2")]);
        let blob = encode_attrs(&map).unwrap();
        let alpha = blob.windows(5).position(|w| w == b"alpha").unwrap();
        let zeta = blob.windows(4).position(|w| w == b"zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn plain_rejects_oversized_blob() {
        let mut map = Attrs::new();
        for i in 0..40 {
            map.insert(format!("key-{:04}", i), "x".repeat(2000));
        }
        let err = encode_attrs(&map).unwrap_err();
        assert!(matches!(
            StoreError::from_err(&err),
            Some(StoreError::AttrsTooLarge { .. })
        ));
    }

    #[test]
    fn plain_decode_rejects_truncation() {
        let map = attrs(&[("service", "api")]);
        let blob = encode_attrs(&map).unwrap();
        for cut in 1..blob.len() {
            let err = decode_attrs(&blob[..cut]).unwrap_err();
            assert!(matches!(
                StoreError::from_err(&err),
                Some(StoreError::InvalidAttrsData(_))
            ));
        }
    }

    #[test]
    fn plain_decode_rejects_trailing_bytes() {
        let mut blob = encode_attrs(&attrs(&[("a", "b")])).unwrap();
        blob.push(0xff);
        assert!(decode_attrs(&blob).is_err());
    }

    #[test]
    fn dict_blob_has_fixed_size() {
        let mut dict = StringDict::new();
        let map = attrs(&[("svc", "api"), ("env", "prod")]);
        let (blob, added) = encode_attrs_dict(&map, &mut dict).unwrap();
        assert_eq!(blob.len(), 2 + 8 * map.len());
        assert_eq!(added.len(), 4);
        assert_eq!(decode_attrs_dict(&blob, &dict).unwrap(), map);
    }

    #[test]
    fn dict_shared_id_space_collapses_repeats() {
        let mut dict = StringDict::new();
        // "x" appears as both key and value and must use one entry.
        let map = attrs(&[("x", "x")]);
        let (blob, added) = encode_attrs_dict(&map, &mut dict).unwrap();
        assert_eq!(added, vec!["x".to_string()]);
        assert_eq!(dict.len(), 1);
        assert_eq!(decode_attrs_dict(&blob, &dict).unwrap(), map);
    }

    #[test]
    fn dict_second_encode_adds_nothing() {
        let mut dict = StringDict::new();
        let map = attrs(&[("svc", "api")]);
        let (first, added) = encode_attrs_dict(&map, &mut dict).unwrap();
        assert_eq!(added.len(), 2);
        let (second, added) = encode_attrs_dict(&map, &mut dict).unwrap();
        assert!(added.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn dict_decode_checks_ids_and_size() {
        let dict = StringDict::new();
        // one pair referencing unknown ids
        let mut blob = vec![1, 0];
        blob.extend_from_slice(&7u32.to_le_bytes());
        blob.extend_from_slice(&9u32.to_le_bytes());
        let err = decode_attrs_dict(&blob, &dict).unwrap_err();
        assert!(matches!(
            StoreError::from_err(&err),
            Some(StoreError::DictEntryNotFound(_))
        ));

        blob.push(0);
        assert!(decode_attrs_dict(&blob, &dict).is_err());
    }
}
