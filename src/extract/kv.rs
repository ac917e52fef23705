//! Heuristic `key=value` extraction from free-form text.
//!
//! Keys follow the grammar `segment ("." segment)*` with segments
//! `[A-Za-z_][A-Za-z0-9_]*`. Values run until whitespace or a value
//! delimiter, must be ASCII and must not contain structural characters;
//! single- or double-quoted values are bounded by their quotes.

use super::push_pair;

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

fn is_structural(b: u8) -> bool {
    matches!(b, b'{' | b'}' | b'[' | b']' | b'"' | b'\'' | b'=' | b'&')
}

fn is_value_delim(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b',' || b == b';'
}

fn valid_key(key: &[u8]) -> bool {
    if key.is_empty() {
        return false;
    }
    for segment in key.split(|&b| b == b'.') {
        match segment.first() {
            Some(&b) if b.is_ascii_alphabetic() || b == b'_' => {}
            _ => return false,
        }
        if !segment[1..]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return false;
        }
    }
    true
}

/// Parse the value starting at `start`; returns the value bytes and the
/// index just past it, or `None` when the candidate must be rejected.
fn parse_value(data: &[u8], start: usize) -> Option<(&[u8], usize)> {
    if start >= data.len() {
        return None;
    }

    let quote = data[start];
    if quote == b'"' || quote == b'\'' {
        let inner_start = start + 1;
        let rel_end = data[inner_start..].iter().position(|&b| b == quote)?;
        let inner = &data[inner_start..inner_start + rel_end];
        if inner.is_empty() || !inner.iter().all(|&b| b == b' ' || b.is_ascii_graphic()) {
            return None;
        }
        return Some((inner, inner_start + rel_end + 1));
    }

    let mut end = start;
    while end < data.len() && !is_value_delim(data[end]) {
        let b = data[end];
        if !b.is_ascii() || !b.is_ascii_graphic() || is_structural(b) {
            return None;
        }
        end += 1;
    }
    if end == start {
        return None;
    }
    Some((&data[start..end], end))
}

pub fn extract_kv(data: &[u8], out: &mut Vec<(String, String)>) {
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'=' {
            i += 1;
            continue;
        }

        // walk back over the key; the loop boundary doubles as the word
        // boundary check
        let key_end = i;
        let mut key_start = key_end;
        while key_start > 0 && is_key_byte(data[key_start - 1]) {
            key_start -= 1;
        }
        let key = &data[key_start..key_end];
        if !valid_key(key) {
            i += 1;
            continue;
        }

        match parse_value(data, i + 1) {
            Some((value, next)) => {
                push_pair(
                    out,
                    &String::from_utf8_lossy(key),
                    &String::from_utf8_lossy(value),
                );
                i = next;
            }
            None => i += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(data: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        extract_kv(data, &mut out);
        out
    }

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    #[test]
    fn extracts_simple_pairs() {
        assert_eq!(
            pairs(b"request served user=alice latency=12ms"),
            vec![pair("user", "alice"), pair("latency", "12ms")]
        );
    }

    #[test]
    fn dotted_keys_and_case() {
        assert_eq!(
            pairs(b"Http.Status=OK"),
            vec![pair("http.status", "ok")]
        );
    }

    #[test]
    fn quoted_values_are_bounded() {
        assert_eq!(
            pairs(b"msg='hello world' other=\"a b\""),
            vec![pair("msg", "hello world"), pair("other", "a b")]
        );
    }

    #[test]
    fn rejects_bad_keys() {
        // segments must start with a letter or underscore
        assert!(pairs(b"9lives=cat").is_empty());
        assert!(pairs(b"a..b=x").is_empty());
        assert!(pairs(b".lead=x").is_empty());
    }

    #[test]
    fn rejects_structural_values() {
        assert!(pairs(b"data={json}").is_empty());
        assert!(pairs(b"q=a&b").is_empty());
        assert!(pairs(b"empty= next").is_empty());
    }

    #[test]
    fn value_stops_at_delimiters() {
        assert_eq!(
            pairs(b"a=1,b=2;c=3"),
            vec![pair("a", "1"), pair("b", "2"), pair("c", "3")]
        );
    }

    #[test]
    fn non_ascii_values_are_rejected() {
        assert!(pairs("k=caf\u{e9}".as_bytes()).is_empty());
    }
}
