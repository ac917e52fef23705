//! Payload tokenizer and the indexability filter.
//!
//! Token characters are ASCII `[A-Za-z0-9_-]`; any other byte delimits.
//! Runs shorter than two bytes are dropped; index keys are truncated to
//! sixteen bytes, but the indexability filter inspects the untruncated
//! run (a UUID must be recognized at its full 36 characters).

/// Minimum token length.
pub const MIN_TOKEN_LEN: usize = 2;
/// Maximum index key length; longer runs are truncated.
pub const MAX_TOKEN_LEN: usize = 16;

#[inline]
pub fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Invoke `f` for every token run in `data`, lowercased into the
/// caller-provided buffer.
///
/// Note: this cannot be an `Iterator`, because an iterator cannot return
/// a slice of its own scratch buffer. The slice passed to `f` is only
/// valid for the duration of the call and may be longer than
/// [`MAX_TOKEN_LEN`]; use [`index_key`] when building index keys.
pub fn each_token<F: FnMut(&[u8])>(data: &[u8], buf: &mut Vec<u8>, mut f: F) {
    let mut i = 0;
    while i < data.len() {
        if !is_token_byte(data[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < data.len() && is_token_byte(data[i]) {
            i += 1;
        }
        let run = &data[start..i];
        if run.len() < MIN_TOKEN_LEN {
            continue;
        }
        buf.clear();
        buf.extend(run.iter().map(|b| b.to_ascii_lowercase()));
        f(&buf[..]);
    }
}

/// Truncate a token run to the index key length.
#[inline]
pub fn index_key(run: &[u8]) -> &[u8] {
    &run[..run.len().min(MAX_TOKEN_LEN)]
}

fn is_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

fn is_canonical_uuid(run: &[u8]) -> bool {
    if run.len() != 36 {
        return false;
    }
    run.iter().enumerate().all(|(i, &b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => is_hex(b),
    })
}

/// Whether a (lowercased, untruncated) token run is worth indexing.
///
/// Numbers, hex blobs and UUIDs have near-unbounded cardinality and
/// would bloat the token index without ever being useful search terms;
/// queries for them fall back to runtime scanning.
pub fn is_indexable(run: &[u8]) -> bool {
    if run.len() < MIN_TOKEN_LEN {
        return false;
    }

    // plain decimal
    if run.iter().all(|b| b.is_ascii_digit()) {
        return false;
    }

    // radix-prefixed literals
    if run.len() > 2 {
        let rest = &run[2..];
        match &run[..2] {
            b"0x" => {
                if rest.iter().all(|&b| is_hex(b)) {
                    return false;
                }
            }
            b"0o" => {
                if rest.iter().all(|b| (b'0'..=b'7').contains(b)) {
                    return false;
                }
            }
            b"0b" => {
                if rest.iter().all(|&b| b == b'0' || b == b'1') {
                    return false;
                }
            }
            _ => {}
        }
    }

    if is_canonical_uuid(run) {
        return false;
    }

    // hex blobs, possibly hyphenated (covers truncated UUID pieces)
    let mut hex_digits = 0;
    if run.iter().all(|&b| {
        if is_hex(b) {
            hex_digits += 1;
            true
        } else {
            b == b'-'
        }
    }) && hex_digits > 0
    {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(data: &[u8]) -> Vec<String> {
        let mut buf = Vec::new();
        let mut out = Vec::new();
        each_token(data, &mut buf, |tok| {
            out.push(String::from_utf8(tok.to_vec()).unwrap());
        });
        out
    }

    #[test]
    fn splits_and_lowercases() {
        assert_eq!(
            tokens(b"Error from API_v2, retry-count 7!"),
            vec!["error", "from", "api_v2", "retry-count"]
        );
    }

    #[test]
    fn drops_short_runs() {
        assert_eq!(tokens(b"a bb c dd"), vec!["bb", "dd"]);
    }

    #[test]
    fn index_key_truncates() {
        let run = b"averylongtokenthatkeepsgoing";
        assert_eq!(index_key(run).len(), MAX_TOKEN_LEN);
        assert_eq!(index_key(b"short"), b"short");
    }

    #[test]
    fn numerics_are_not_indexable() {
        assert!(!is_indexable(b"12345"));
        assert!(!is_indexable(b"0xdeadbeef"));
        assert!(!is_indexable(b"0o755"));
        assert!(!is_indexable(b"0b1010"));
    }

    #[test]
    fn uuids_and_hex_are_not_indexable() {
        assert!(!is_indexable(b"550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_indexable(b"deadbeef"));
        assert!(!is_indexable(b"ab-cd-ef"));
    }

    #[test]
    fn words_are_indexable() {
        assert!(is_indexable(b"error"));
        assert!(is_indexable(b"retry-count"));
        assert!(is_indexable(b"api_v2"));
        // 0x prefix with non-hex tail is a word
        assert!(is_indexable(b"0xgg"));
    }
}
