//! Per-chunk append-only string dictionary.
//!
//! Strings get sequentially assigned u32 ids. Attribute keys and values
//! share one id space, so a string used as both collapses to a single
//! entry. The on-disk file is the 4-byte dictionary header followed by
//! `strLen:u16, bytes` entries in id order; a partial trailing entry
//! (crash during append) is ignored on load.

use std::collections::HashMap;

use anyhow::Error;
use log::warn;

use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct StringDict {
    entries: Vec<String>,
    ids: HashMap<String, u32>,
}

impl StringDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the id of `s`, appending it if not yet present.
    pub fn add(&mut self, s: &str) -> Result<u32, Error> {
        if let Some(id) = self.ids.get(s) {
            return Ok(*id);
        }
        if self.entries.len() >= u32::MAX as usize {
            return Err(StoreError::DictFull.into());
        }
        let id = self.entries.len() as u32;
        self.entries.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<&str, Error> {
        match self.entries.get(id as usize) {
            Some(s) => Ok(s),
            None => Err(StoreError::DictEntryNotFound(id).into()),
        }
    }

    pub fn lookup(&self, s: &str) -> Option<u32> {
        self.ids.get(s).copied()
    }

    /// Encode one dictionary entry as it appears in the file body.
    pub fn encode_entry(s: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    /// Rebuild a dictionary from the file body (bytes after the header).
    ///
    /// Decoding stops cleanly at the last complete entry, so a torn tail
    /// from a crashed append is dropped rather than rejected.
    pub fn from_body(body: &[u8]) -> Self {
        Self::load_body(body).0
    }

    /// Like [`StringDict::from_body`], additionally returning how many
    /// body bytes were consumed (the writer truncates the file there).
    pub fn load_body(body: &[u8]) -> (Self, usize) {
        let mut dict = Self::new();
        let mut pos = 0usize;
        while pos + 2 <= body.len() {
            let len = u16::from_le_bytes([body[pos], body[pos + 1]]) as usize;
            if pos + 2 + len > body.len() {
                warn!(
                    "dropping partial trailing dictionary entry ({} of {} bytes)",
                    body.len() - pos,
                    2 + len
                );
                break;
            }
            let raw = &body[pos + 2..pos + 2 + len];
            let s = match std::str::from_utf8(raw) {
                Ok(s) => s,
                Err(_) => {
                    warn!("dropping corrupt dictionary tail at offset {}", pos);
                    break;
                }
            };
            // ids are assigned sequentially, mirroring the append path
            let _ = dict.add(s);
            pos += 2 + len;
        }
        (dict, pos)
    }
}
