//! Output recovery for generative stages.
//!
//! Turns unreliable free text (prose around a JSON object, fenced blocks,
//! trailing commas, raw newlines inside strings) into a record validated
//! against a [`RecordSchema`], or one of three typed failures. Nothing in this
//! crate panics on model output; every path ends in `Ok` or a [`RecoveryError`].
//!
//! The stages run in order:
//! 1. [`extract`]: find the candidate object in the text.
//! 2. [`repair`]: named textual fix-ups, skipped for already-valid JSON.
//! 3. [`parse`]: strict parse, then lenient parse.
//! 4. [`normalize`]: boolean coercion and approval inference.
//! 5. [`schema`]: field set and type validation.

pub mod extract;
pub mod normalize;
pub mod parse;
pub mod repair;
pub mod schema;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

pub use repair::{default_rules, ApprovalFlag, LineContinuations, RepairRule, TrailingCommas};
pub use schema::{ApprovalRule, FieldSpec, FieldType, RecordSchema};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecoveryError {
    #[error("no structured data found in output")]
    NoStructuredDataFound,

    #[error("output is malformed after repair: {diagnostic}")]
    MalformedAfterRepair { diagnostic: String },

    #[error("output failed schema '{schema}': {diagnostic}")]
    SchemaValidationFailed { schema: String, diagnostic: String },
}

/// A record that passed validation against a named schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub schema: String,
    pub fields: Map<String, Value>,
}

impl ValidatedRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Deserialize the record into a concrete output type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, RecoveryError> {
        serde_json::from_value(Value::Object(self.fields)).map_err(|e| {
            RecoveryError::SchemaValidationFailed {
                schema: self.schema,
                diagnostic: e.to_string(),
            }
        })
    }
}

/// A configured recovery pipeline.
pub struct Recovery {
    rules: Vec<Box<dyn RepairRule>>,
    repair_enabled: bool,
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            repair_enabled: true,
        }
    }
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pipeline that parses the extracted candidate without any repair.
    pub fn without_repair() -> Self {
        Self {
            rules: Vec::new(),
            repair_enabled: false,
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn RepairRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn recover(&self, text: &str, schema: &RecordSchema) -> Result<ValidatedRecord, RecoveryError> {
        let candidate = extract::extract_candidate(text)?;

        let repaired = if self.repair_enabled {
            repair::repair(candidate, &self.rules)
        } else {
            candidate.to_string()
        };

        let mut record = parse::parse_record(&repaired)?;
        normalize::coerce_string_booleans(&mut record);
        if let Some(rule) = &schema.approval {
            normalize::infer_approval(&mut record, rule);
        }

        let fields = schema
            .validate(record)
            .map_err(|diagnostic| RecoveryError::SchemaValidationFailed {
                schema: schema.name.clone(),
                diagnostic,
            })?;

        tracing::debug!(schema = %schema.name, fields = fields.len(), "Recovered record");
        Ok(ValidatedRecord {
            schema: schema.name.clone(),
            fields,
        })
    }

    /// Recover and deserialize into `T` in one step.
    pub fn recover_as<T: DeserializeOwned>(&self, text: &str, schema: &RecordSchema) -> Result<T, RecoveryError> {
        self.recover(text, schema)?.into_typed()
    }
}

/// Recover a record with the default rule set.
pub fn recover(text: &str, schema: &RecordSchema) -> Result<ValidatedRecord, RecoveryError> {
    Recovery::default().recover(text, schema)
}
