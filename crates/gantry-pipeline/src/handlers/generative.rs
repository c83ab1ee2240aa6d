//! Generative stages: prompt a text generator, recover a typed record from
//! the reply, and map it onto run fields.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::Value;

use gantry_recover::{RecordSchema, Recovery};
use gantry_types::{Fields, Result, StageOutput, Usage};

use crate::handler::{StageContext, StageHandler, TokenEmitter};
use crate::retry::{execute_with_retry, BackoffPolicy};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

// ---------------------------------------------------------------------------
// Generator seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// The full reply of one generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// A streaming text model.
///
/// Implementations forward fragments through `emitter` as they arrive and
/// must stop with `Err(Cancelled)` when `emit` refuses a fragment.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, stage: &str, prompt: &Prompt, emitter: &TokenEmitter) -> Result<Generation>;
}

// ---------------------------------------------------------------------------
// PromptTemplate
// ---------------------------------------------------------------------------

/// System and user templates with `{key}` placeholders.
///
/// A placeholder resolves against the stage's input fields first, then the
/// run's initiating payload. Strings substitute verbatim, other JSON values
/// in compact form, `null` as an empty string. Unknown keys stay literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub system: String,
    pub user: String,
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    pub fn render(&self, ctx: &StageContext, schema: &RecordSchema) -> Prompt {
        let system = format!(
            "{}\n\nCRITICAL: You must respond with a raw JSON object wrapped in a markdown code block: ```json {{ ... }} ```. \nRequired JSON Schema: {}",
            substitute(&self.system, ctx),
            schema.describe()
        );
        Prompt {
            system,
            user: substitute(&self.user, ctx),
        }
    }
}

fn substitute(template: &str, ctx: &StageContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            let value = ctx
                .fields
                .get(key)
                .or_else(|| ctx.input.get(key));
            match value {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) => String::new(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// GenerativeStage
// ---------------------------------------------------------------------------

/// A [`StageHandler`] backed by a [`TextGenerator`] and the recovery pipeline.
///
/// Recovery failures are returned as unsuccessful outputs (with the
/// generation's usage), never as errors, so the engine records them as
/// stage-level failures and keeps routing.
pub struct GenerativeStage {
    generator: Arc<dyn TextGenerator>,
    schema: RecordSchema,
    template: PromptTemplate,
    field_map: BTreeMap<String, String>,
    recovery: Recovery,
    max_retries: usize,
    backoff: BackoffPolicy,
}

impl GenerativeStage {
    pub fn new(generator: Arc<dyn TextGenerator>, schema: RecordSchema, template: PromptTemplate) -> Self {
        Self {
            generator,
            schema,
            template,
            field_map: BTreeMap::new(),
            recovery: Recovery::new(),
            max_retries: 0,
            backoff: BackoffPolicy::None,
        }
    }

    /// Store record key `record_key` under run field `field`.
    pub fn map_field(mut self, record_key: &str, field: &str) -> Self {
        self.field_map.insert(record_key.to_string(), field.to_string());
        self
    }

    pub fn with_recovery(mut self, recovery: Recovery) -> Self {
        self.recovery = recovery;
        self
    }

    /// Re-generate up to `max_retries` times when recovery fails.
    pub fn with_retries(mut self, max_retries: usize, backoff: BackoffPolicy) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    async fn attempt(&self, ctx: &StageContext, prompt: &Prompt) -> Result<StageOutput> {
        ctx.check_cancelled()?;
        let generation = self
            .generator
            .generate(&ctx.stage_id, prompt, ctx.emitter())
            .await?;

        match self.recovery.recover(&generation.text, &self.schema) {
            Ok(record) => {
                let mut fields = Fields::new();
                for (key, value) in record.fields {
                    let field = self.field_map.get(&key).cloned().unwrap_or(key);
                    fields.insert(field, value);
                }
                Ok(StageOutput::success(fields)
                    .with_message(format!("{} output recovered", self.schema.name))
                    .with_usage(generation.usage))
            }
            Err(e) => {
                tracing::warn!(
                    run = %ctx.run_id,
                    stage = %ctx.stage_id,
                    schema = %self.schema.name,
                    error = %e,
                    "Output recovery failed"
                );
                Ok(StageOutput::fail(e.to_string()).with_usage(generation.usage))
            }
        }
    }
}

#[async_trait]
impl StageHandler for GenerativeStage {
    fn handler_type(&self) -> &str {
        "generative"
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        let prompt = self.template.render(ctx, &self.schema);
        tracing::debug!(
            stage = %ctx.stage_id,
            system_len = prompt.system.len(),
            user_len = prompt.user.len(),
            "Rendered prompt"
        );
        execute_with_retry(
            || self.attempt(ctx, &prompt),
            self.max_retries,
            &self.backoff,
            &ctx.stage_id,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use gantry_recover::FieldType;
    use gantry_types::GantryError;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays canned replies in order and records the prompts it saw.
    struct Scripted {
        replies: Mutex<Vec<String>>,
        prompts: Mutex<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _stage: &str, prompt: &Prompt, emitter: &TokenEmitter) -> Result<Generation> {
            self.prompts.lock().unwrap().push(prompt.clone());
            let text = self.replies.lock().unwrap().pop().unwrap_or_default();
            for chunk in text.as_bytes().chunks(8) {
                emitter.emit(&String::from_utf8_lossy(chunk))?;
            }
            Ok(Generation {
                text,
                usage: Usage::total(10),
            })
        }
    }

    fn review_schema() -> RecordSchema {
        RecordSchema::new("ReviewerOutput")
            .required("review", FieldType::String, "Review comments")
            .with_approval("review")
    }

    fn ctx(fields: Fields, cancel: CancellationToken) -> StageContext {
        StageContext::new("run-1", "Reviewer", json!({"product_idea": "todo app"}), fields, cancel, None)
    }

    // 1. Placeholders resolve from fields, then input; unknown keys stay literal
    #[test]
    fn template_renders_placeholders_and_schema_suffix() {
        let mut fields = Fields::new();
        fields.insert("srs".into(), json!("the SRS"));
        fields.insert("code".into(), Value::Null);
        let ctx = ctx(fields, CancellationToken::new());
        let template = PromptTemplate::new("You review {product_idea}.", "SRS: {srs}\nCode: {code}\n{mystery}");
        let prompt = template.render(&ctx, &review_schema());

        assert!(prompt.system.starts_with("You review todo app."));
        assert!(prompt.system.contains("CRITICAL: You must respond with a raw JSON object"));
        assert!(prompt.system.contains("ReviewerOutput"));
        assert_eq!(prompt.user, "SRS: the SRS\nCode: \n{mystery}");
    }

    // 2. Recovered record is mapped onto run fields
    #[tokio::test]
    async fn recovered_record_maps_fields() {
        let generator = Scripted::new(&["Here you go:\n```json\n{\"review\": \"Looks fine. The code is approved.\"}\n```"]);
        let stage = GenerativeStage::new(generator, review_schema(), PromptTemplate::new("s", "u"))
            .map_field("approved", "review_approved");

        let output = stage.execute(&ctx(Fields::new(), CancellationToken::new())).await.unwrap();
        assert!(output.success);
        assert_eq!(output.fields["review_approved"], true);
        assert!(!output.fields.contains_key("approved"));
        assert_eq!(output.usage.total_tokens, 10);
    }

    // 3. Recovery failure is a failed output, not an error
    #[tokio::test]
    async fn recovery_failure_is_stage_failure() {
        let generator = Scripted::new(&["I could not produce anything useful."]);
        let stage = GenerativeStage::new(generator, review_schema(), PromptTemplate::new("s", "u"));

        let output = stage.execute(&ctx(Fields::new(), CancellationToken::new())).await.unwrap();
        assert!(!output.success);
        assert!(output.message.contains("no structured data"));
        assert_eq!(output.usage.total_tokens, 10);
    }

    // 4. Re-generation after a recovery failure
    #[tokio::test]
    async fn retries_regenerate_until_recovered() {
        let generator = Scripted::new(&["nothing", r#"{"review": "approved: true"}"#]);
        let stage = GenerativeStage::new(generator.clone(), review_schema(), PromptTemplate::new("s", "u"))
            .with_retries(2, BackoffPolicy::None);

        let output = stage.execute(&ctx(Fields::new(), CancellationToken::new())).await.unwrap();
        assert!(output.success);
        assert_eq!(output.fields["approved"], true);
        assert_eq!(output.usage.total_tokens, 20);
        assert_eq!(generator.prompts.lock().unwrap().len(), 2);
    }

    // 5. A cancelled run never reaches the generator
    #[tokio::test]
    async fn cancelled_before_generation() {
        let generator = Scripted::new(&["{}"]);
        let stage = GenerativeStage::new(generator.clone(), review_schema(), PromptTemplate::new("s", "u"))
            .with_retries(3, BackoffPolicy::None);
        let cancel = CancellationToken::new();
        cancel.cancel("stop");

        match stage.execute(&ctx(Fields::new(), cancel)).await {
            Err(GantryError::Cancelled { run_id }) => assert_eq!(run_id, "run-1"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(generator.prompts.lock().unwrap().is_empty());
    }
}
