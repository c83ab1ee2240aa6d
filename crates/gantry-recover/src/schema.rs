//! Record schemas: declared field set, types and optional approval inference.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::parse::kind_of;

/// The accepted shape of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Bool,
    Integer,
    Number,
    /// Object whose values are all strings (e.g. file name → contents).
    StringMap,
    List,
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::StringMap => value
                .as_object()
                .is_some_and(|m| m.values().all(Value::is_string)),
            FieldType::List => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn json_type(self) -> Value {
        match self {
            FieldType::String => json!({"type": "string"}),
            FieldType::Bool => json!({"type": "boolean"}),
            FieldType::Integer => json!({"type": "integer"}),
            FieldType::Number => json!({"type": "number"}),
            FieldType::StringMap => {
                json!({"type": "object", "additionalProperties": {"type": "string"}})
            }
            FieldType::List => json!({"type": "array"}),
            FieldType::Any => json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub required: bool,
    pub description: String,
}

/// Infers a missing boolean `field` from the free text in `companion`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRule {
    pub field: String,
    pub companion: String,
}

/// The declared shape of one stage's structured output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub approval: Option<ApprovalRule>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            approval: None,
        }
    }

    pub fn required(self, name: &str, ty: FieldType, description: &str) -> Self {
        self.field(name, ty, true, description)
    }

    pub fn optional(self, name: &str, ty: FieldType, description: &str) -> Self {
        self.field(name, ty, false, description)
    }

    /// Declare a required boolean `approved` field inferred from `companion`
    /// when the record omits it.
    pub fn with_approval(self, companion: &str) -> Self {
        let mut schema = self.required(
            "approved",
            FieldType::Bool,
            "Whether the reviewed work is approved",
        );
        schema.approval = Some(ApprovalRule {
            field: "approved".to_string(),
            companion: companion.to_string(),
        });
        schema
    }

    fn field(mut self, name: &str, ty: FieldType, required: bool, description: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            required,
            description: description.to_string(),
        });
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Check `record` against the declared fields.
    ///
    /// Undeclared fields are dropped. Absent optional fields come back as
    /// `null`. The error string names the first offending field.
    pub fn validate(&self, mut record: Map<String, Value>) -> Result<Map<String, Value>, String> {
        let mut validated = Map::new();
        for spec in &self.fields {
            match record.remove(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required field '{}'", spec.name));
                }
                None | Some(Value::Null) => {
                    validated.insert(spec.name.clone(), Value::Null);
                }
                Some(value) if spec.ty.accepts(&value) => {
                    validated.insert(spec.name.clone(), value);
                }
                Some(value) => {
                    return Err(format!(
                        "field '{}' expected {:?}, found {}",
                        spec.name,
                        spec.ty,
                        kind_of(&value)
                    ));
                }
            }
        }
        if !record.is_empty() {
            let dropped: Vec<&String> = record.keys().collect();
            tracing::debug!(schema = %self.name, ?dropped, "Dropped undeclared fields");
        }
        Ok(validated)
    }

    /// A JSON-Schema style description suitable for prompting a generator.
    pub fn describe(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.fields {
            let mut prop = spec.ty.json_type();
            if let Value::Object(obj) = &mut prop {
                obj.insert("description".into(), Value::String(spec.description.clone()));
            }
            properties.insert(spec.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}
