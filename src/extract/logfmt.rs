//! Logfmt extraction.
//!
//! Keys may contain any printable byte except `=` and `"`. A bare key
//! (no `=`) emits `key=true`; quoted values support backslash escapes.

use super::push_pair;

fn is_logfmt_key_byte(b: u8) -> bool {
    b.is_ascii_graphic() && b != b'=' && b != b'"'
}

/// Parse a quoted value starting at the opening quote. Returns the
/// unescaped value and the index just past the closing quote, or `None`
/// for an unterminated string.
fn parse_quoted(data: &[u8], start: usize) -> Option<(String, usize)> {
    let mut value = Vec::new();
    let mut i = start + 1;
    while i < data.len() {
        match data[i] {
            b'"' => return Some((String::from_utf8_lossy(&value).into_owned(), i + 1)),
            b'\\' if i + 1 < data.len() => {
                let escaped = match data[i + 1] {
                    b'n' => b'\n',
                    b't' => b'\t',
                    b'r' => b'\r',
                    other => other,
                };
                value.push(escaped);
                i += 2;
            }
            other => {
                value.push(other);
                i += 1;
            }
        }
    }
    None
}

pub fn extract_logfmt(data: &[u8], out: &mut Vec<(String, String)>) {
    let mut i = 0;
    while i < data.len() {
        if !is_logfmt_key_byte(data[i]) {
            i += 1;
            continue;
        }

        let key_start = i;
        while i < data.len() && is_logfmt_key_byte(data[i]) {
            i += 1;
        }
        let key = String::from_utf8_lossy(&data[key_start..i]).into_owned();

        if i < data.len() && data[i] == b'=' {
            i += 1;
            if i < data.len() && data[i] == b'"' {
                match parse_quoted(data, i) {
                    Some((value, next)) => {
                        push_pair(out, &key, &value);
                        i = next;
                    }
                    // unterminated quote: stop rather than guess
                    None => return,
                }
            } else {
                let value_start = i;
                while i < data.len() && !data[i].is_ascii_whitespace() {
                    i += 1;
                }
                let value = String::from_utf8_lossy(&data[value_start..i]).into_owned();
                push_pair(out, &key, &value);
            }
        } else {
            // bare key
            push_pair(out, &key, "true");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(data: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        extract_logfmt(data, &mut out);
        out
    }

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    #[test]
    fn parses_mixed_line() {
        assert_eq!(
            pairs(b"level=info msg=\"user logged in\" ready"),
            vec![
                pair("level", "info"),
                pair("msg", "user logged in"),
                pair("ready", "true"),
            ]
        );
    }

    #[test]
    fn unescapes_quoted_values() {
        assert_eq!(
            pairs(br#"msg="say \"hi\"\n""#),
            vec![pair("msg", "say \"hi\"\n")]
        );
    }

    #[test]
    fn empty_bare_value() {
        assert_eq!(pairs(b"key= other=1"), vec![pair("key", ""), pair("other", "1")]);
    }

    #[test]
    fn stops_on_unterminated_quote() {
        assert_eq!(pairs(b"a=1 b=\"oops"), vec![pair("a", "1")]);
    }
}
