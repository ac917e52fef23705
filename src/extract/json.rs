//! JSON structure extraction.
//!
//! Runs only when the payload starts with `{`. The walker descends the
//! object without a depth cap, emitting every node path (components
//! joined by NUL bytes, array levels injecting `[*]`) and the scalar
//! leaves as values. Values are lowercased and length-capped by the
//! shared pair rules.

use serde_json::Value;

use super::push_pair;

/// Separator between path components in extracted keys.
pub const PATH_SEPARATOR: char = '\0';
/// Path component standing in for any array index.
pub const ARRAY_COMPONENT: &str = "[*]";

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}

fn join_path(path: &[String]) -> String {
    let mut joined = String::new();
    for (i, component) in path.iter().enumerate() {
        if i > 0 {
            joined.push(PATH_SEPARATOR);
        }
        joined.push_str(component);
    }
    joined
}

fn walk(value: &Value, path: &mut Vec<String>, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            if !path.is_empty() {
                push_pair(out, &join_path(path), "");
            }
            for (key, child) in map {
                path.push(key.clone());
                walk(child, path, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            if !path.is_empty() {
                push_pair(out, &join_path(path), "");
            }
            path.push(ARRAY_COMPONENT.to_string());
            for item in items {
                walk(item, path, out);
            }
            path.pop();
        }
        scalar => {
            if let Some(s) = scalar_string(scalar) {
                push_pair(out, &join_path(path), &s);
            }
        }
    }
}

pub fn extract_json(data: &[u8], out: &mut Vec<(String, String)>) {
    if data.first() != Some(&b'{') {
        return;
    }
    let value: Value = match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(_) => return,
    };
    let mut path = Vec::new();
    walk(&value, &mut path, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(data: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        extract_json(data, &mut out);
        out
    }

    #[test]
    fn emits_leaves_with_null_separated_paths() {
        let out = pairs(br#"{"a": {"b": "X"}, "n": 7, "ok": true, "none": null}"#);
        assert!(out.contains(&("a\0b".to_string(), "x".to_string())));
        assert!(out.contains(&("n".to_string(), "7".to_string())));
        assert!(out.contains(&("ok".to_string(), "true".to_string())));
        assert!(out.contains(&("none".to_string(), "null".to_string())));
        // the intermediate node path is emitted as well
        assert!(out.contains(&("a".to_string(), String::new())));
    }

    #[test]
    fn arrays_inject_wildcard_component() {
        let out = pairs(br#"{"tags": ["Red", "Blue"]}"#);
        assert!(out.contains(&("tags\0[*]".to_string(), "red".to_string())));
        assert!(out.contains(&("tags\0[*]".to_string(), "blue".to_string())));
    }

    #[test]
    fn only_object_payloads_parse() {
        assert!(pairs(b"[1, 2, 3]").is_empty());
        assert!(pairs(b"plain text {not json}").is_empty());
    }

    #[test]
    fn long_values_are_capped() {
        let long = "y".repeat(200);
        let doc = format!(r#"{{"k": "{}"}}"#, long);
        let out = pairs(doc.as_bytes());
        assert_eq!(out[0].1.len(), crate::extract::MAX_PAIR_LEN);
    }
}
