//! Common / Combined access log extraction.

use lazy_static::lazy_static;
use regex::Regex;

use super::push_pair;

lazy_static! {
    static ref COMBINED_RE: Regex = Regex::new(
        r#"^(\S+) (\S+) (\S+) \[([^\]]+)\] "(\S+) (\S+)(?: (\S+))?" (\d{3}) (\S+) "([^"]*)" "([^"]*)"\s*$"#
    )
    .unwrap();
    static ref COMMON_RE: Regex = Regex::new(
        r#"^(\S+) (\S+) (\S+) \[([^\]]+)\] "(\S+) (\S+)(?: (\S+))?" (\d{3}) (\S+)\s*$"#
    )
    .unwrap();
}

pub fn extract_access_log(data: &[u8], out: &mut Vec<(String, String)>) {
    let line = match std::str::from_utf8(data) {
        Ok(line) => line.trim_end(),
        Err(_) => return,
    };

    let (caps, combined) = if let Some(caps) = COMBINED_RE.captures(line) {
        (caps, true)
    } else if let Some(caps) = COMMON_RE.captures(line) {
        (caps, false)
    } else {
        return;
    };

    let field = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or("");

    push_pair(out, "remote_host", field(1));
    if field(3) != "-" {
        push_pair(out, "remote_user", field(3));
    }
    push_pair(out, "method", field(5));
    push_pair(out, "path", field(6));
    if !field(7).is_empty() {
        push_pair(out, "protocol", field(7));
    }
    push_pair(out, "status", field(8));
    if field(9) != "-" {
        push_pair(out, "body_bytes", field(9));
    }
    if combined {
        if field(10) != "-" {
            push_pair(out, "referer", field(10));
        }
        if field(11) != "-" {
            push_pair(out, "user_agent", field(11));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(data: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        extract_access_log(data, &mut out);
        out
    }

    fn get<'a>(out: &'a [(String, String)], key: &str) -> Option<&'a str> {
        out.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn parses_common_format() {
        let out = pairs(
            b"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] \"GET /apache_pb.gif HTTP/1.0\" 200 2326",
        );
        assert_eq!(get(&out, "remote_host"), Some("127.0.0.1"));
        assert_eq!(get(&out, "remote_user"), Some("frank"));
        assert_eq!(get(&out, "method"), Some("get"));
        assert_eq!(get(&out, "path"), Some("/apache_pb.gif"));
        assert_eq!(get(&out, "protocol"), Some("http/1.0"));
        assert_eq!(get(&out, "status"), Some("200"));
        assert_eq!(get(&out, "body_bytes"), Some("2326"));
        assert_eq!(get(&out, "referer"), None);
    }

    #[test]
    fn parses_combined_format() {
        let out = pairs(
            b"10.0.0.7 - - [10/Oct/2000:13:55:36 -0700] \"POST /login HTTP/1.1\" 302 - \"http://example.com/\" \"Mozilla/5.0\"",
        );
        assert_eq!(get(&out, "remote_host"), Some("10.0.0.7"));
        assert_eq!(get(&out, "remote_user"), None);
        assert_eq!(get(&out, "status"), Some("302"));
        assert_eq!(get(&out, "body_bytes"), None);
        assert_eq!(get(&out, "referer"), Some("http://example.com/"));
        assert_eq!(get(&out, "user_agent"), Some("mozilla/5.0"));
    }

    #[test]
    fn ignores_non_matching_lines() {
        assert!(pairs(b"plain log message").is_empty());
    }
}
