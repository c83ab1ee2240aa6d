//! Post-parse normalization: boolean coercion and approval inference.

use serde_json::{Map, Value};

use crate::schema::ApprovalRule;

const NEGATIVE_PHRASES: &[&str] = &["approved: false", "not approved", "not yet approved"];
const POSITIVE_PHRASES: &[&str] = &["approved: true", "is approved"];

/// Replace top-level `"true"` / `"false"` strings (any case) with booleans.
pub fn coerce_string_booleans(record: &mut Map<String, Value>) {
    for value in record.values_mut() {
        let coerced = match value {
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        };
        if let Some(flag) = coerced {
            *value = Value::Bool(flag);
        }
    }
}

/// Decide approval from free text. Negative phrasing wins over positive and
/// anything unrecognised is treated as not approved.
pub fn approval_from_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    if NEGATIVE_PHRASES.iter().any(|p| lower.contains(p)) {
        return false;
    }
    POSITIVE_PHRASES.iter().any(|p| lower.contains(p))
}

/// Fill in a missing approval flag from its companion text field.
pub fn infer_approval(record: &mut Map<String, Value>, rule: &ApprovalRule) {
    if record.get(&rule.field).is_some_and(|v| !v.is_null()) {
        return;
    }
    let text = record
        .get(&rule.companion)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let approved = approval_from_text(text);
    tracing::debug!(field = %rule.field, approved, "Inferred approval flag");
    record.insert(rule.field.clone(), Value::Bool(approved));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule() -> ApprovalRule {
        ApprovalRule {
            field: "approved".into(),
            companion: "review".into(),
        }
    }

    #[test]
    fn string_booleans_become_booleans() {
        let mut map = json!({"a": "TRUE", "b": "False", "c": "yes", "d": {"e": "true"}})
            .as_object()
            .cloned()
            .unwrap();
        coerce_string_booleans(&mut map);
        assert_eq!(map["a"], true);
        assert_eq!(map["b"], false);
        assert_eq!(map["c"], "yes");
        // Only the top level is coerced.
        assert_eq!(map["d"]["e"], "true");
    }

    #[test]
    fn approval_phrases() {
        assert!(!approval_from_text("The change is not approved yet"));
        assert!(approval_from_text("Everything checks out, this is approved."));
        assert!(!approval_from_text("Some thoughts on naming."));
        assert!(!approval_from_text("Approved: FALSE"));
        assert!(approval_from_text("Approved: True"));
        assert!(!approval_from_text("It is not yet approved"));
    }

    #[test]
    fn inference_only_fills_missing_flag() {
        let mut map = json!({"review": "is approved", "approved": false})
            .as_object()
            .cloned()
            .unwrap();
        infer_approval(&mut map, &rule());
        assert_eq!(map["approved"], false);

        let mut map = json!({"review": "is approved"}).as_object().cloned().unwrap();
        infer_approval(&mut map, &rule());
        assert_eq!(map["approved"], true);
    }

    #[test]
    fn inference_without_companion_fails_closed() {
        let mut map = Map::new();
        infer_approval(&mut map, &rule());
        assert_eq!(map["approved"], false);
    }
}
