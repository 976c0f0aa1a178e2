//! Lenient repair of model-supplied tool arguments.
//!
//! Models occasionally emit argument JSON with raw newlines inside
//! strings, single-quoted keys or values, unquoted keys, or trailing
//! commas. Dispatch never fails on these: a repair pass runs first, and
//! total failure falls back to an empty object.

use std::sync::LazyLock;

use regex::Regex;

/// Unquoted object keys: `{foo: 1}` or `, bar: 2`.
static UNQUOTED_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("valid key regex")
});

/// Trailing commas before a closing brace or bracket.
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#",\s*([}\]])"#).expect("valid comma regex"));

/// Parse tool arguments, repairing common damage. Always returns an
/// object; irrecoverable input yields `{}`.
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return value;
        }
    }

    let repaired = repair(trimmed);
    match serde_json::from_str::<serde_json::Value>(&repaired) {
        Ok(value) if value.is_object() => value,
        _ => {
            tracing::warn!("irrecoverable tool arguments, falling back to {{}}: {trimmed}");
            serde_json::json!({})
        }
    }
}

fn repair(raw: &str) -> String {
    let requoted = normalize_single_quotes(raw);
    let escaped = escape_control_chars_in_strings(&requoted);
    let quoted = UNQUOTED_KEY.replace_all(&escaped, "$1\"$2\":");
    TRAILING_COMMA.replace_all(&quoted, "$1").into_owned()
}

/// Rewrite single-quoted string literals (keys and values alike) as
/// double-quoted JSON strings. Apostrophes inside double-quoted strings
/// are left alone; embedded `"` is escaped and `\'` unescaped on the way
/// through.
fn normalize_single_quotes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    let mut in_double = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_double {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => {
                    in_double = false;
                    escaped = false;
                }
                _ => escaped = false,
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                out.push('"');
                while let Some(inner) = chars.next() {
                    match inner {
                        '\'' => break,
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(other) => {
                                out.push('\\');
                                out.push(other);
                            }
                            None => out.push('\\'),
                        },
                        '"' => out.push_str("\\\""),
                        _ => out.push(inner),
                    }
                }
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Escape raw newlines/tabs that appear inside string literals.
fn escape_control_chars_in_strings(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in raw.chars() {
        if in_string {
            match c {
                '\\' if !escaped => {
                    escaped = true;
                    out.push(c);
                    continue;
                }
                '"' if !escaped => in_string = false,
                '\n' => {
                    out.push_str("\\n");
                    escaped = false;
                    continue;
                }
                '\r' => {
                    out.push_str("\\r");
                    escaped = false;
                    continue;
                }
                '\t' => {
                    out.push_str("\\t");
                    escaped = false;
                    continue;
                }
                _ => {}
            }
            escaped = false;
        } else if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_json_passes_through() {
        let args = parse_arguments(r#"{"command": "ls -la", "timeout": 30}"#);
        assert_eq!(args["command"], "ls -la");
        assert_eq!(args["timeout"], 30);
    }

    #[test]
    fn test_empty_input_is_empty_object() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments("   "), serde_json::json!({}));
    }

    #[test]
    fn test_unescaped_newline_in_string() {
        let raw = "{\"content\": \"line one\nline two\"}";
        let args = parse_arguments(raw);
        assert_eq!(args["content"], "line one\nline two");
    }

    #[test]
    fn test_trailing_comma() {
        let args = parse_arguments(r#"{"path": ".",}"#);
        assert_eq!(args["path"], ".");
    }

    #[test]
    fn test_unquoted_keys() {
        let args = parse_arguments(r#"{operation: "list", path: "."}"#);
        assert_eq!(args["operation"], "list");
        assert_eq!(args["path"], ".");
    }

    #[test]
    fn test_single_quoted_keys_and_values() {
        let args = parse_arguments(r#"{'path': '.'}"#);
        assert_eq!(args["path"], ".");

        let args = parse_arguments(r#"{'operation': 'list', 'count': 3}"#);
        assert_eq!(args["operation"], "list");
        assert_eq!(args["count"], 3);
    }

    #[test]
    fn test_single_quotes_mixed_with_double() {
        let args = parse_arguments(r#"{"operation": 'list', 'path': "."}"#);
        assert_eq!(args["operation"], "list");
        assert_eq!(args["path"], ".");
    }

    #[test]
    fn test_apostrophe_inside_double_quoted_string_untouched() {
        // The repair path must not mistake an apostrophe for a quote.
        let args = parse_arguments(r#"{message: "it's fine",}"#);
        assert_eq!(args["message"], "it's fine");
    }

    #[test]
    fn test_escaped_quote_inside_single_quoted_value() {
        let args = parse_arguments(r#"{'msg': 'it\'s ok'}"#);
        assert_eq!(args["msg"], "it's ok");
    }

    #[test]
    fn test_double_quote_inside_single_quoted_value() {
        let args = parse_arguments(r#"{'cmd': 'say "hi"'}"#);
        assert_eq!(args["cmd"], r#"say "hi""#);
    }

    #[test]
    fn test_single_quotes_with_trailing_comma() {
        let args = parse_arguments(r#"{'operation': 'list', 'path': '.',}"#);
        assert_eq!(args["operation"], "list");
        assert_eq!(args["path"], ".");
    }

    #[test]
    fn test_combined_damage() {
        let raw = "{command: \"echo hi\ndone\", }";
        let args = parse_arguments(raw);
        assert_eq!(args["command"], "echo hi\ndone");
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let args = parse_arguments(r#"{"command": "echo \"quoted\""}"#);
        assert_eq!(args["command"], r#"echo "quoted""#);
    }

    #[test]
    fn test_colon_inside_string_value_untouched() {
        let args = parse_arguments(r#"{"url": "http://host:8080/path"}"#);
        assert_eq!(args["url"], "http://host:8080/path");
    }

    #[test]
    fn test_irrecoverable_falls_back_to_empty() {
        assert_eq!(parse_arguments("not json"), serde_json::json!({}));
        assert_eq!(parse_arguments("[1, 2, 3]"), serde_json::json!({}));
        assert_eq!(parse_arguments("\"just a string\""), serde_json::json!({}));
    }
}
