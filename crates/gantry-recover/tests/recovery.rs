//! End-to-end recovery of realistic generator transcripts.

use gantry_recover::{recover, FieldType, RecordSchema, Recovery, RecoveryError};
use serde::Deserialize;
use serde_json::json;

fn reviewer() -> RecordSchema {
    RecordSchema::new("ReviewerOutput")
        .required("review", FieldType::String, "Detailed code review feedback")
        .with_approval("review")
}

fn developer() -> RecordSchema {
    RecordSchema::new("DeveloperOutput")
        .required("code", FieldType::String, "Summary of the implementation")
        .required("files", FieldType::StringMap, "File name to file contents")
}

#[derive(Debug, Deserialize)]
struct Review {
    review: String,
    approved: bool,
}

// ---------------------------------------------------------------------------
// Test 1: Prose, trailing commas and a broken line in one transcript
// ---------------------------------------------------------------------------

#[test]
fn messy_developer_output_recovers() {
    let text = r#"Here is my implementation:

{
  "code": "Adds a login handler.
It validates the password first.",
  "files": {
    "login.py": "def login(): pass",
  },
}

Let me know if you need changes."#;

    let record = recover(text, &developer()).unwrap();
    assert_eq!(
        record.get("code"),
        Some(&json!("Adds a login handler.\nIt validates the password first."))
    );
    assert_eq!(record.fields["files"]["login.py"], "def login(): pass");
}

// ---------------------------------------------------------------------------
// Test 2: Approval inference
// ---------------------------------------------------------------------------

#[test]
fn approval_inferred_from_review_text() {
    let cases = [
        (r#"{"review": "The change is not approved yet"}"#, false),
        (r#"{"review": "Everything checks out, this is approved."}"#, true),
        (r#"{"review": "Some thoughts on naming."}"#, false),
    ];
    for (text, expected) in cases {
        let review: Review = Recovery::new().recover_as(text, &reviewer()).unwrap();
        assert_eq!(review.approved, expected, "for {text}");
    }
}

#[test]
fn approval_statement_at_end_of_review_is_lifted() {
    let text = "```json\n{\n  \"review\": \"Solid work. Approved: true\"\n}\n```";
    let review: Review = Recovery::new().recover_as(text, &reviewer()).unwrap();
    assert!(review.approved);
    assert_eq!(review.review, "Solid work. Approved: true");
}

#[test]
fn string_boolean_is_coerced_before_validation() {
    let text = r#"{"review": "fine", "approved": "True"}"#;
    let record = recover(text, &reviewer()).unwrap();
    assert_eq!(record.fields["approved"], true);
}

// ---------------------------------------------------------------------------
// Test 3: Typed failures
// ---------------------------------------------------------------------------

#[test]
fn prose_only_is_no_structured_data() {
    let err = recover("Sorry, I cannot help with that.", &reviewer()).unwrap_err();
    assert_eq!(err, RecoveryError::NoStructuredDataFound);
}

#[test]
fn unrepairable_candidate_is_malformed() {
    let err = recover(r#"{"review": "x" "approved": true}"#, &reviewer()).unwrap_err();
    match err {
        RecoveryError::MalformedAfterRepair { diagnostic } => assert!(!diagnostic.is_empty()),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn wrong_types_fail_schema_validation() {
    let err = recover(r#"{"code": 12, "files": {}}"#, &developer()).unwrap_err();
    match err {
        RecoveryError::SchemaValidationFailed { schema, diagnostic } => {
            assert_eq!(schema, "DeveloperOutput");
            assert!(diagnostic.contains("code"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn repair_can_be_disabled() {
    let text = r#"{"code": "x", "files": {},}"#;
    assert!(recover(text, &developer()).is_ok());
    assert!(matches!(
        Recovery::without_repair().recover(text, &developer()),
        Err(RecoveryError::MalformedAfterRepair { .. })
    ));
}

// ---------------------------------------------------------------------------
// Test 4: Valid input passes through untouched
// ---------------------------------------------------------------------------

#[test]
fn valid_json_is_recovered_verbatim() {
    let text = r#"{"code": "line one, ]\nline two", "files": {"a.rs": "fn a() {}"}}"#;
    let record = recover(text, &developer()).unwrap();
    assert_eq!(record.fields["code"], "line one, ]\nline two");
    assert_eq!(record.fields["files"], json!({"a.rs": "fn a() {}"}));
}
