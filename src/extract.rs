//! Tokenization and key/value pair extraction from raw payloads.
//!
//! The extractors are deliberately conservative: a missed pair only
//! costs index acceleration (the query engine falls back to runtime
//! scanning), while a bogus pair would produce wrong index hits. All of
//! them lowercase keys and values, deduplicate per message and enforce
//! the 64-byte pair limit.

mod tokenizer;
pub use tokenizer::*;

mod kv;
pub use kv::*;

mod logfmt;
pub use logfmt::*;

mod json;
pub use json::*;

mod access_log;
pub use access_log::*;

use std::collections::BTreeSet;

/// Maximum length of an extracted key or value.
pub const MAX_PAIR_LEN: usize = 64;

/// A key/value pair extractor running over one record payload.
pub trait KvExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, data: &[u8], out: &mut Vec<(String, String)>);
}

/// Append a pair, applying the shared rules: keys over the limit are
/// dropped, values are truncated, everything is lowercased.
pub(crate) fn push_pair(out: &mut Vec<(String, String)>, key: &str, value: &str) {
    if key.is_empty() || key.len() > MAX_PAIR_LEN {
        return;
    }
    let mut value = value.to_ascii_lowercase();
    if value.len() > MAX_PAIR_LEN {
        let mut cut = MAX_PAIR_LEN;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        value.truncate(cut);
    }
    out.push((key.to_ascii_lowercase(), value));
}

pub struct HeuristicKv;

impl KvExtractor for HeuristicKv {
    fn name(&self) -> &'static str {
        "kv"
    }

    fn extract(&self, data: &[u8], out: &mut Vec<(String, String)>) {
        extract_kv(data, out);
    }
}

pub struct LogfmtExtractor;

impl KvExtractor for LogfmtExtractor {
    fn name(&self) -> &'static str {
        "logfmt"
    }

    fn extract(&self, data: &[u8], out: &mut Vec<(String, String)>) {
        extract_logfmt(data, out);
    }
}

pub struct JsonExtractor;

impl KvExtractor for JsonExtractor {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extract(&self, data: &[u8], out: &mut Vec<(String, String)>) {
        extract_json(data, out);
    }
}

pub struct AccessLogExtractor;

impl KvExtractor for AccessLogExtractor {
    fn name(&self) -> &'static str {
        "access-log"
    }

    fn extract(&self, data: &[u8], out: &mut Vec<(String, String)>) {
        extract_access_log(data, out);
    }
}

/// The stock extractor set, in the order they run.
pub fn standard_extractors() -> Vec<Box<dyn KvExtractor>> {
    vec![
        Box::new(HeuristicKv),
        Box::new(LogfmtExtractor),
        Box::new(JsonExtractor),
        Box::new(AccessLogExtractor),
    ]
}

/// Run a set of extractors over one payload, deduplicated.
pub fn extract_pairs(
    extractors: &[Box<dyn KvExtractor>],
    data: &[u8],
) -> Vec<(String, String)> {
    let mut raw_pairs = Vec::new();
    for extractor in extractors {
        extractor.extract(data, &mut raw_pairs);
    }
    let set: BTreeSet<(String, String)> = raw_pairs.into_iter().collect();
    set.into_iter().collect()
}
