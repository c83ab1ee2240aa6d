//! Textual repair rules applied to an extracted candidate before parsing.
//!
//! Each rule is a small named transformation. Rules run in order and each one
//! sees the output of the previous rule. When the candidate already parses as
//! strict JSON no rule runs at all, so repair never alters valid input.

use std::sync::LazyLock;

use regex::Regex;

/// A named textual fix-up over a candidate record.
pub trait RepairRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, candidate: &str) -> String;
}

// ---------------------------------------------------------------------------
// trailing_commas
// ---------------------------------------------------------------------------

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma pattern is valid"));

/// Removes a comma that directly precedes a closing `}` or `]`.
pub struct TrailingCommas;

impl RepairRule for TrailingCommas {
    fn name(&self) -> &'static str {
        "trailing_commas"
    }

    fn apply(&self, candidate: &str) -> String {
        TRAILING_COMMA.replace_all(candidate, "$1").into_owned()
    }
}

// ---------------------------------------------------------------------------
// line_continuations
// ---------------------------------------------------------------------------

/// Joins a line onto the next one with a `\n` escape when it cannot end a JSON
/// token, which is what a raw newline inside a string value looks like.
pub struct LineContinuations;

fn ends_mid_value(line: &str) -> bool {
    match line.chars().last() {
        None => false,
        Some(c) => !matches!(c, ',' | '{' | '[' | '}' | ']' | '"' | 'e' | 'l') && !c.is_ascii_digit(),
    }
}

impl RepairRule for LineContinuations {
    fn name(&self) -> &'static str {
        "line_continuations"
    }

    fn apply(&self, candidate: &str) -> String {
        let lines: Vec<&str> = candidate.split('\n').collect();
        let mut out = String::with_capacity(candidate.len() + 16);
        for (i, line) in lines.iter().enumerate() {
            let line = line.trim_end_matches('\r');
            out.push_str(line);
            if i + 1 == lines.len() {
                break;
            }
            if ends_mid_value(line.trim_end()) {
                out.push_str("\\n");
            } else {
                out.push('\n');
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// approval_flag
// ---------------------------------------------------------------------------

static APPROVAL_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(approved:\s*(true|false))\s*"\s*\}\s*$"#).expect("approval pattern is valid")
});

/// Lifts an `approved: true|false` statement that closes the last string value
/// into a real boolean member of the record.
pub struct ApprovalFlag {
    field: String,
}

impl ApprovalFlag {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Default for ApprovalFlag {
    fn default() -> Self {
        Self::new("approved")
    }
}

impl RepairRule for ApprovalFlag {
    fn name(&self) -> &'static str {
        "approval_flag"
    }

    fn apply(&self, candidate: &str) -> String {
        let key = format!("\"{}\"", self.field);
        let has_key = candidate
            .match_indices(&key)
            .any(|(at, _)| candidate[at + key.len()..].trim_start().starts_with(':'));
        if has_key {
            return candidate.to_string();
        }

        let Some(caps) = APPROVAL_IN_TEXT.captures(candidate) else {
            return candidate.to_string();
        };
        let (Some(whole), Some(statement), Some(value)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            return candidate.to_string();
        };

        let mut out = String::with_capacity(candidate.len() + 32);
        out.push_str(&candidate[..whole.start()]);
        out.push_str(statement.as_str());
        out.push_str(&format!(
            "\",\n  \"{}\": {}\n}}",
            self.field,
            value.as_str().to_ascii_lowercase()
        ));
        out
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The standard rule set, in application order.
pub fn default_rules() -> Vec<Box<dyn RepairRule>> {
    vec![
        Box::new(TrailingCommas),
        Box::new(LineContinuations),
        Box::new(ApprovalFlag::default()),
    ]
}

/// Apply `rules` to `candidate` unless it already parses as strict JSON.
pub fn repair(candidate: &str, rules: &[Box<dyn RepairRule>]) -> String {
    if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
        return candidate.to_string();
    }

    let mut text = candidate.to_string();
    for rule in rules {
        let next = rule.apply(&text);
        if next != text {
            tracing::debug!(rule = rule.name(), "Repair rule changed candidate");
            text = next;
        }
    }
    text
}
