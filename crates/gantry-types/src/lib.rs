//! Shared types, errors, run state, and checkpoint snapshot for the Gantry stage engine.
//!
//! This crate provides the foundational types used across all other Gantry crates:
//! - `GantryError` — engine-level fault taxonomy
//! - `Run` / `RunStatus` — one pipeline invocation and its lifecycle state
//! - `StageOutput` — result of executing a stage handler
//! - `Checkpoint` — serializable snapshot for pause/resume and crash recovery

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unified error type for engine and store faults.
///
/// Stage-level failures are *not* represented here; they travel as data in
/// [`StageOutput`] and [`Run::errors`].
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    // === Run lifecycle ===
    #[error("Run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("Run '{run_id}' already exists")]
    RunExists { run_id: String },

    #[error("Run '{run_id}' cannot be resumed from status '{status}'")]
    NotResumable { run_id: String, status: RunStatus },

    #[error("No checkpoint stored for run '{run_id}'")]
    CheckpointMissing { run_id: String },

    #[error("Run '{run_id}' was stopped")]
    Cancelled { run_id: String },

    // === Pipeline definition ===
    #[error("Pipeline '{name}' is not registered")]
    PipelineNotFound { name: String },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Stage '{stage}' is not part of the pipeline")]
    UnknownStage { stage: String },

    #[error("Routing from '{from}' chose '{target}', which is not one of its declared targets")]
    InvalidRoute { from: String, target: String },

    // === Collaborators ===
    #[error("Handler for stage '{stage}' failed: {message}")]
    HandlerError { stage: String, message: String },

    #[error("Artifact '{name}' error: {message}")]
    ArtifactError { name: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl GantryError {
    /// Returns `true` if the error represents a cooperative stop rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, GantryError::Cancelled { .. })
    }

    /// Returns `true` for faults caused by a broken pipeline definition.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            GantryError::ValidationError(_)
                | GantryError::UnknownStage { .. }
                | GantryError::InvalidRoute { .. }
                | GantryError::PipelineNotFound { .. }
        )
    }
}

/// A convenience alias for `Result<T, GantryError>`.
pub type Result<T> = std::result::Result<T, GantryError>;

/// Stage-output values keyed by field name.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Retry counters keyed by counter name; owned and bumped by routing functions.
pub type RetryCounters = BTreeMap<String, u32>;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    /// Terminal statuses end a run for good; `Paused` is not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Completed | RunStatus::Error
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Usage: accumulated resource counters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Usage where only the total is known.
    pub fn total(total_tokens: u64) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(rhs.total_tokens);
    }
}

// ---------------------------------------------------------------------------
// StageFailure: one recorded stage-level failure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
    #[serde(default)]
    pub errors: Vec<String>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StageOutput: result of executing a stage handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    pub success: bool,
    pub fields: Fields,
    pub message: String,
    pub errors: Vec<String>,
    pub usage: Usage,
}

impl StageOutput {
    /// Create a successful output carrying the given fields.
    pub fn success(fields: Fields) -> Self {
        Self {
            success: true,
            fields,
            message: String::new(),
            errors: Vec::new(),
            usage: Usage::default(),
        }
    }

    /// Create a failed output with a single error message.
    pub fn fail(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            fields: Fields::new(),
            message: reason.clone(),
            errors: vec![reason],
            usage: Usage::default(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

// ---------------------------------------------------------------------------
// Run: one pipeline invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub pipeline: String,
    pub title: String,
    pub input: serde_json::Value,
    pub status: RunStatus,
    pub fields: Fields,
    pub retry_counters: RetryCounters,
    pub errors: Vec<StageFailure>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a fresh run with a generated id.
    pub fn new(
        pipeline: impl Into<String>,
        title: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: generate_run_id(&title, now),
            pipeline: pipeline.into(),
            title,
            input,
            status: RunStatus::Running,
            fields: Fields::new(),
            retry_counters: RetryCounters::new(),
            errors: Vec::new(),
            usage: Usage::default(),
            created_at: now,
            ended_at: None,
        }
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Read a field, treating JSON `null` as absent.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    /// Convenience accessor for boolean fields; absent or non-bool reads as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.field(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Read a string from the initiating input payload.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(|v| v.as_str())
    }

    pub fn retry_count(&self, counter: &str) -> u32 {
        self.retry_counters.get(counter).copied().unwrap_or(0)
    }

    /// Subset of `fields` limited to `keys`. Missing keys are reported as `null`.
    pub fn restricted(&self, keys: &[String]) -> Fields {
        keys.iter()
            .map(|k| {
                let v = self.fields.get(k).cloned().unwrap_or(serde_json::Value::Null);
                (k.clone(), v)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Checkpoint: serializable snapshot for pause/resume
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub pending_stage_id: String,
    pub fields: Fields,
    pub retry_counters: RetryCounters,
    #[serde(default)]
    pub errors: Vec<StageFailure>,
    #[serde(default)]
    pub usage: Usage,
    /// Stages of other fan-out branches that still have to run after the
    /// pending stage's branch terminates, in execution order.
    #[serde(default)]
    pub queued: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot `run` so that execution continues at `pending_stage_id`.
    pub fn capture(run: &Run, pending_stage_id: impl Into<String>, queued: Vec<String>) -> Self {
        Self {
            run_id: run.id.clone(),
            pending_stage_id: pending_stage_id.into(),
            fields: run.fields.clone(),
            retry_counters: run.retry_counters.clone(),
            errors: run.errors.clone(),
            usage: run.usage,
            queued,
            saved_at: Utc::now(),
        }
    }

    /// Overwrite the execution state of `run` with this snapshot.
    pub fn restore_into(&self, run: &mut Run) {
        run.fields = self.fields.clone();
        run.retry_counters = self.retry_counters.clone();
        run.errors = self.errors.clone();
        run.usage = self.usage;
    }
}

// ---------------------------------------------------------------------------
// Run id generation
// ---------------------------------------------------------------------------

/// Build a run id of the form `<YYYYmmdd_HHMMSS>_<slug>_<8 hex>`.
///
/// The slug keeps at most 30 characters of the title with every
/// non-alphanumeric character replaced by `_`.
pub fn generate_run_id(title: &str, now: DateTime<Utc>) -> String {
    let slug: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(30)
        .collect();
    let slug = slug.trim_matches('_');
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    let stamp = now.format("%Y%m%d_%H%M%S");
    if slug.is_empty() {
        format!("{stamp}_{suffix}")
    } else {
        format!("{stamp}_{slug}_{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- GantryError ---

    #[test]
    fn error_display_invalid_route() {
        let err = GantryError::InvalidRoute {
            from: "Reviewer".into(),
            target: "Nowhere".into(),
        };
        assert_eq!(
            err.to_string(),
            "Routing from 'Reviewer' chose 'Nowhere', which is not one of its declared targets"
        );
    }

    #[test]
    fn error_display_not_resumable() {
        let err = GantryError::NotResumable {
            run_id: "r1".into(),
            status: RunStatus::Stopped,
        };
        assert_eq!(
            err.to_string(),
            "Run 'r1' cannot be resumed from status 'stopped'"
        );
    }

    #[test]
    fn cancellation_is_not_a_definition_error() {
        let err = GantryError::Cancelled { run_id: "r".into() };
        assert!(err.is_cancellation());
        assert!(!err.is_definition_error());

        let err = GantryError::UnknownStage { stage: "x".into() };
        assert!(err.is_definition_error());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GantryError = io_err.into();
        assert!(matches!(err, GantryError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    // --- RunStatus ---

    #[test]
    fn run_status_serializes_to_snake_case() {
        assert_eq!(serde_json::to_string(&RunStatus::Paused).unwrap(), "\"paused\"");
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
        let s: RunStatus = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(s, RunStatus::Stopped);
    }

    #[test]
    fn paused_is_not_terminal() {
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Error.is_terminal());
    }

    // --- Usage ---

    #[test]
    fn usage_accumulates() {
        let mut u = Usage::new(10, 5);
        u += Usage::total(7);
        assert_eq!(u.input_tokens, 10);
        assert_eq!(u.output_tokens, 5);
        assert_eq!(u.total_tokens, 22);
    }

    // --- StageOutput ---

    #[test]
    fn stage_output_fail_records_reason() {
        let o = StageOutput::fail("no JSON found");
        assert!(!o.success);
        assert_eq!(o.errors, vec!["no JSON found".to_string()]);
        assert!(o.fields.is_empty());
    }

    #[test]
    fn stage_output_builder() {
        let o = StageOutput::success(Fields::new())
            .with_field("srs", json!("spec"))
            .with_usage(Usage::total(3));
        assert!(o.success);
        assert_eq!(o.fields["srs"], json!("spec"));
        assert_eq!(o.usage.total_tokens, 3);
    }

    // --- Run ---

    #[test]
    fn restricted_reports_missing_as_null() {
        let mut run = Run::new("qa", "Todo app", json!({}));
        run.fields.insert("srs".into(), json!("spec"));
        run.fields.insert("code".into(), json!("fn main() {}"));

        let view = run.restricted(&["srs".to_string(), "review".to_string()]);
        assert_eq!(view.len(), 2);
        assert_eq!(view["srs"], json!("spec"));
        assert_eq!(view["review"], serde_json::Value::Null);
    }

    #[test]
    fn flag_reads_false_when_null() {
        let mut run = Run::new("qa", "x", json!({}));
        run.fields.insert("review_approved".into(), serde_json::Value::Null);
        assert!(!run.flag("review_approved"));
        run.fields.insert("review_approved".into(), json!(true));
        assert!(run.flag("review_approved"));
    }

    // --- Checkpoint ---

    #[test]
    fn checkpoint_capture_and_restore() {
        let mut run = Run::new("qa", "x", json!({}));
        run.fields.insert("mrs".into(), json!("market"));
        run.retry_counters.insert("review_count".into(), 2);
        run.usage = Usage::total(40);

        let cp = Checkpoint::capture(&run, "Developer", vec!["ManualQA".into()]);
        assert_eq!(cp.pending_stage_id, "Developer");
        assert_eq!(cp.queued, vec!["ManualQA".to_string()]);

        let json = serde_json::to_string(&cp).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, cp);

        let mut fresh = Run::new("qa", "x", json!({}));
        restored.restore_into(&mut fresh);
        assert_eq!(fresh.fields, run.fields);
        assert_eq!(fresh.retry_count("review_count"), 2);
        assert_eq!(fresh.usage.total_tokens, 40);
    }

    // --- Run ids ---

    #[test]
    fn run_id_contains_slug_and_timestamp() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = generate_run_id("A todo app, with tags!", now);
        assert!(id.starts_with("20240501_123045_A_todo_app__with_tags_"), "got {id}");
    }

    #[test]
    fn run_ids_are_unique() {
        let now = Utc::now();
        assert_ne!(generate_run_id("same", now), generate_run_id("same", now));
    }

    #[test]
    fn run_id_without_slug() {
        let now = Utc::now();
        let id = generate_run_id("!!!", now);
        assert_eq!(id.matches('_').count(), 2, "got {id}");
    }
}
