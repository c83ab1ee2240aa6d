//! Strict-then-lenient parsing of a repaired candidate into a JSON object.

use serde_json::{Map, Value};

use crate::RecoveryError;

/// Escape raw control characters that appear inside string literals.
///
/// Models frequently emit literal newlines and tabs inside JSON strings.
/// Characters outside string literals are left untouched.
pub fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// Parse `text` strictly, falling back to the lenient mode on failure.
pub fn parse_record(text: &str) -> Result<Map<String, Value>, RecoveryError> {
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(strict) => {
            tracing::debug!(error = %strict, "Strict parse failed, retrying leniently");
            serde_json::from_str::<Value>(&escape_control_chars(text)).map_err(|e| {
                RecoveryError::MalformedAfterRepair {
                    diagnostic: e.to_string(),
                }
            })?
        }
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(RecoveryError::MalformedAfterRepair {
            diagnostic: format!("expected a JSON object, found {}", kind_of(&other)),
        }),
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_mode_accepts_raw_newlines_in_strings() {
        let text = "{\"code\": \"fn main() {\n\tprintln!();\n}\"}";
        let map = parse_record(text).unwrap();
        assert_eq!(map["code"], "fn main() {\n\tprintln!();\n}");
    }

    #[test]
    fn escaping_ignores_structure_outside_strings() {
        let text = "{\n  \"a\": \"x\\\"y\"\n}";
        assert_eq!(escape_control_chars(text), text);
    }

    #[test]
    fn malformed_reports_diagnostic() {
        match parse_record("{\"a\": }") {
            Err(RecoveryError::MalformedAfterRepair { diagnostic }) => {
                assert!(!diagnostic.is_empty());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            parse_record("[1, 2]"),
            Err(RecoveryError::MalformedAfterRepair { .. })
        ));
    }
}
