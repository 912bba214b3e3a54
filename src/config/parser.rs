//! Hand-rolled `key = value` grammar (spec.md §6), bit-exact:
//!
//! - lines are `key = value`
//! - comments start with `;` or `#`, but only when preceded by
//!   whitespace (or at the start of the line) — `abc;def` keeps its
//!   semicolon, `abc ;def` does not.
//! - values are trimmed, then stripped of one layer of surrounding ASCII
//!   quotes
//! - booleans accept `true|false|1|0|yes|no` case-insensitively (parsed
//!   by the typed layer, not here)

use crate::error::ConfigError;
use std::collections::BTreeMap;

pub fn parse_str(input: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();

    for (lineno, raw_line) in input.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Syntax {
            line: lineno + 1,
            message: "expected `key = value`".to_string(),
        })?;

        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(ConfigError::Syntax {
                line: lineno + 1,
                message: "empty key".to_string(),
            });
        }

        let value = strip_quotes(value.trim());
        out.insert(key, value);
    }

    Ok(out)
}

/// Truncate `line` at the first `;`/`#` that is preceded by whitespace,
/// treating the start of the line as satisfying that condition.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut prev_is_whitespace = true;
    for (i, &b) in bytes.iter().enumerate() {
        if (b == b';' || b == b'#') && prev_is_whitespace {
            return &line[..i];
        }
        prev_is_whitespace = b == b' ' || b == b'\t';
    }
    line
}

fn strip_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s7_comment_begins_only_at_space_semicolon() {
        let input = "tuya_local_key = abc;def#ghi ; inline note";
        let map = parse_str(input).unwrap();
        assert_eq!(map.get("tuya_local_key").unwrap(), "abc;def#ghi");
    }

    #[test]
    fn full_line_comments_are_skipped() {
        let input = "; a header comment\n# another\nkey = value\n";
        let map = parse_str(input).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("key").unwrap(), "value");
    }

    #[test]
    fn surrounding_quotes_are_stripped() {
        let map = parse_str("name = \"hello world\"").unwrap();
        assert_eq!(map.get("name").unwrap(), "hello world");
    }

    #[test]
    fn blank_lines_are_ignored() {
        let map = parse_str("a = 1\n\n\nb = 2\n").unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn missing_equals_is_a_syntax_error() {
        let err = parse_str("not_a_kv_line").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { .. }));
    }

    #[test]
    fn booleans_are_case_insensitive() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("No"), Some(false));
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("nah"), None);
    }
}
