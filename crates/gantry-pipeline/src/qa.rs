//! The QA reference pipeline: product requirements, a development loop gated
//! by test execution and review, then test strategy and two parallel testers.
//!
//! ```text
//! entry (start_mode)
//!   full       -> ProductManager -> Developer -> Executor
//!   sts_only   -> TestManager
//!   tests_only -> AutomationQA
//!
//! Executor  -> Reviewer     (tests passed, or dev_retries exhausted)
//!           -> Developer    (otherwise)
//! Reviewer  -> TestManager  (approved, or review_count exhausted)
//!           -> Developer    (otherwise)
//! TestManager -> TestLead -> { AutomationQA, ManualQA }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use gantry_recover::{FieldType, RecordSchema, RecoveryError, ValidatedRecord};
use gantry_types::Result;

use crate::artifacts::ArtifactNaming;
use crate::graph::{PipelineBuilder, PipelineDefinition, RouteContext, StageSpec};
use crate::handler::StageHandler;
use crate::handlers::{GenerativeStage, PromptTemplate, TextGenerator};
use crate::retry::{BackoffPolicy, RetryBudget};

pub const PIPELINE_NAME: &str = "qa";

pub const PRODUCT_MANAGER: &str = "ProductManager";
pub const DEVELOPER: &str = "Developer";
pub const EXECUTOR: &str = "Executor";
pub const REVIEWER: &str = "Reviewer";
pub const TEST_MANAGER: &str = "TestManager";
pub const TEST_LEAD: &str = "TestLead";
pub const AUTOMATION_QA: &str = "AutomationQA";
pub const MANUAL_QA: &str = "ManualQA";

/// Developer reruns allowed after failed test execution.
pub const MAX_DEV_RETRIES: u32 = 3;
/// Developer reruns allowed after a rejected review.
pub const MAX_REVIEW_ROUNDS: u32 = 3;

/// Stages paused before when human review is enabled.
pub const DEFAULT_INTERRUPTS: [&str; 6] = [DEVELOPER, REVIEWER, TEST_MANAGER, TEST_LEAD, AUTOMATION_QA, MANUAL_QA];

pub fn default_interrupts() -> Vec<String> {
    DEFAULT_INTERRUPTS.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Stage records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductManagerOutput {
    pub mrs: String,
    pub srs: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeveloperOutput {
    pub code: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOutput {
    pub tests_passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerOutput {
    pub review: String,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStrategyOutput {
    pub test_strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLeadOutput {
    pub step: String,
    pub test_plan: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationOutput {
    pub automation_tests: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOutput {
    pub manual_tests: String,
    #[serde(default)]
    pub bugs: Option<String>,
}

/// One validated output per stage kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage")]
pub enum StageRecord {
    ProductManager(ProductManagerOutput),
    Developer(DeveloperOutput),
    Executor(ExecutorOutput),
    Reviewer(ReviewerOutput),
    TestManager(TestStrategyOutput),
    TestLead(TestLeadOutput),
    AutomationQA(AutomationOutput),
    ManualQA(ManualOutput),
}

impl StageRecord {
    /// Type a record recovered against [`schema_for`]`(stage)`.
    pub fn from_record(stage: &str, record: ValidatedRecord) -> std::result::Result<Self, RecoveryError> {
        Ok(match stage {
            PRODUCT_MANAGER => Self::ProductManager(record.into_typed()?),
            DEVELOPER => Self::Developer(record.into_typed()?),
            EXECUTOR => Self::Executor(record.into_typed()?),
            REVIEWER => Self::Reviewer(record.into_typed()?),
            TEST_MANAGER => Self::TestManager(record.into_typed()?),
            TEST_LEAD => Self::TestLead(record.into_typed()?),
            AUTOMATION_QA => Self::AutomationQA(record.into_typed()?),
            MANUAL_QA => Self::ManualQA(record.into_typed()?),
            other => {
                return Err(RecoveryError::SchemaValidationFailed {
                    schema: record.schema,
                    diagnostic: format!("no record type for stage '{other}'"),
                })
            }
        })
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::ProductManager(_) => PRODUCT_MANAGER,
            Self::Developer(_) => DEVELOPER,
            Self::Executor(_) => EXECUTOR,
            Self::Reviewer(_) => REVIEWER,
            Self::TestManager(_) => TEST_MANAGER,
            Self::TestLead(_) => TEST_LEAD,
            Self::AutomationQA(_) => AUTOMATION_QA,
            Self::ManualQA(_) => MANUAL_QA,
        }
    }
}

/// The record schema a stage's reply is recovered against.
pub fn schema_for(stage: &str) -> Option<RecordSchema> {
    let schema = match stage {
        PRODUCT_MANAGER => RecordSchema::new("ProductManagerOutput")
            .required("mrs", FieldType::String, "Market Requirements Specification (Markdown content)")
            .required("srs", FieldType::String, "Software Requirements Specification (Markdown content)"),
        DEVELOPER => RecordSchema::new("DeveloperOutput")
            .required("code", FieldType::String, "Source Code Explanation (Markdown content)")
            .required("files", FieldType::StringMap, "Dictionary of filename to file content"),
        EXECUTOR => RecordSchema::new("ExecutorOutput")
            .required("tests_passed", FieldType::Bool, "Whether the generated code ran cleanly")
            .required("output", FieldType::String, "Execution log"),
        REVIEWER => RecordSchema::new("ReviewerOutput")
            .required("review", FieldType::String, "Code Review Report (Markdown content)")
            .with_approval("review"),
        TEST_MANAGER => RecordSchema::new("TestStrategyOutput")
            .required("test_strategy", FieldType::String, "Test Specification Document (Markdown content)"),
        TEST_LEAD => RecordSchema::new("TestLeadOutput")
            .required("step", FieldType::String, "System Test Execution Plan (Markdown content)")
            .required("test_plan", FieldType::String, "Test Plan (Markdown content)"),
        AUTOMATION_QA => RecordSchema::new("AutomationOutput")
            .required("automation_tests", FieldType::String, "Python Test Script (Code content)"),
        MANUAL_QA => RecordSchema::new("ManualOutput")
            .required("manual_tests", FieldType::String, "Manual Test Cases (Markdown content)")
            .optional("bugs", FieldType::String, "Bug Reports (Markdown content, if any)"),
        _ => return None,
    };
    Some(schema)
}

/// File names and categories for persisted outputs.
pub fn artifact_naming() -> ArtifactNaming {
    ArtifactNaming::new()
        .with("mrs", "MRS.md", "requirements")
        .with("srs", "SRS.md", "requirements")
        .with("test_strategy", "STS.md", "testing")
        .with("step", "STEP.md", "testing")
        .with("test_plan", "Test_Plan.md", "testing")
        .with("automation_tests", "Automation_Tests.py", "testing")
        .with("manual_tests", "Manual_Test_Cases.md", "testing")
        .with("bugs", "Bugs.md", "bugs")
        .with("files", "files", "src")
}

fn default_template(stage: &str) -> PromptTemplate {
    match stage {
        PRODUCT_MANAGER => PromptTemplate::new(
            "You are a product manager. Turn the idea into a market requirements specification and a software requirements specification.",
            "Product idea:\n{product_idea}",
        ),
        DEVELOPER => PromptTemplate::new(
            "You are a senior developer. Implement the requirements as a small, runnable Python application.",
            "Software requirements:\n{srs}\n\nPrevious review feedback (empty on the first pass):\n{review}",
        ),
        EXECUTOR => PromptTemplate::new(
            "You execute code and report whether it ran without errors.",
            "Explanation:\n{code}\n\nFiles:\n{files}",
        ),
        REVIEWER => PromptTemplate::new(
            "You are a code reviewer. Check the code against the requirements and decide whether it is approved for testing.",
            "Software requirements:\n{srs}\n\nCode:\n{code}",
        ),
        TEST_MANAGER => PromptTemplate::new(
            "You are a test manager. Write the test specification for the product.",
            "Software requirements:\n{srs}",
        ),
        TEST_LEAD => PromptTemplate::new(
            "You are a test lead. Derive a system test execution plan and a test plan from the strategy.",
            "Test strategy:\n{test_strategy}",
        ),
        AUTOMATION_QA => PromptTemplate::new(
            "You are an automation QA engineer. Write a pytest script covering the plan.",
            "System test execution plan:\n{step}\n\nTest plan:\n{test_plan}",
        ),
        _ => PromptTemplate::new(
            "You are a manual QA engineer. Write manual test cases and report any bugs you find.",
            "System test execution plan:\n{step}\n\nTest plan:\n{test_plan}",
        ),
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

fn select_start(run: &gantry_types::Run) -> String {
    match run.input_str("start_mode").unwrap_or("full") {
        "tests_only" => AUTOMATION_QA.to_string(),
        "sts_only" => TEST_MANAGER.to_string(),
        _ => PRODUCT_MANAGER.to_string(),
    }
}

fn execution_router(budget: RetryBudget) -> impl Fn(&mut RouteContext<'_>) -> String + Send + Sync + 'static {
    move |ctx| {
        if ctx.flag("tests_passed") || !budget.try_consume(ctx) {
            REVIEWER.to_string()
        } else {
            DEVELOPER.to_string()
        }
    }
}

fn review_router(budget: RetryBudget) -> impl Fn(&mut RouteContext<'_>) -> String + Send + Sync + 'static {
    move |ctx| {
        if ctx.flag("review_approved") || !budget.try_consume(ctx) {
            TEST_MANAGER.to_string()
        } else {
            DEVELOPER.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// QaPipeline builder
// ---------------------------------------------------------------------------

/// Assembles the QA pipeline around one [`TextGenerator`].
pub struct QaPipeline {
    generator: Arc<dyn TextGenerator>,
    executor: Option<Arc<dyn StageHandler>>,
    templates: BTreeMap<String, PromptTemplate>,
    regenerations: usize,
    backoff: BackoffPolicy,
}

impl QaPipeline {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            executor: None,
            templates: BTreeMap::new(),
            regenerations: 0,
            backoff: BackoffPolicy::None,
        }
    }

    /// Replace the generative Executor with a handler that really runs code.
    /// It must produce `tests_passed` and `execution_log`.
    pub fn with_executor(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.executor = Some(handler);
        self
    }

    pub fn with_template(mut self, stage: &str, template: PromptTemplate) -> Self {
        self.templates.insert(stage.to_string(), template);
        self
    }

    /// Re-generate a stage's reply when recovery fails.
    pub fn with_regenerations(mut self, attempts: usize, backoff: BackoffPolicy) -> Self {
        self.regenerations = attempts;
        self.backoff = backoff;
        self
    }

    fn generative(&self, stage: &str) -> Arc<dyn StageHandler> {
        let template = self
            .templates
            .get(stage)
            .cloned()
            .unwrap_or_else(|| default_template(stage));
        let schema = schema_for(stage).unwrap_or_else(|| RecordSchema::new(stage));
        let mut handler = GenerativeStage::new(self.generator.clone(), schema, template)
            .with_retries(self.regenerations, self.backoff.clone());
        match stage {
            REVIEWER => handler = handler.map_field("approved", "review_approved"),
            EXECUTOR => handler = handler.map_field("output", "execution_log"),
            _ => {}
        }
        Arc::new(handler)
    }

    pub fn build(self) -> Result<PipelineDefinition> {
        let executor = self
            .executor
            .clone()
            .unwrap_or_else(|| self.generative(EXECUTOR));

        PipelineBuilder::new(PIPELINE_NAME)
            .stage(
                StageSpec::with_handler(PRODUCT_MANAGER, self.generative(PRODUCT_MANAGER))
                    .outputs(&["mrs", "srs"])
                    .artifacts(&["mrs", "srs"])
                    .then(DEVELOPER),
            )
            .stage(
                StageSpec::with_handler(DEVELOPER, self.generative(DEVELOPER))
                    .inputs(&["srs", "review"])
                    .outputs(&["code", "files"])
                    .artifacts(&["code", "files"])
                    .interruptible()
                    .then(EXECUTOR),
            )
            .stage(
                StageSpec::with_handler(EXECUTOR, executor)
                    .inputs(&["code", "files"])
                    .outputs(&["tests_passed", "execution_log"])
                    .route(
                        &[REVIEWER, DEVELOPER],
                        execution_router(RetryBudget::new("dev_retries", MAX_DEV_RETRIES)),
                    ),
            )
            .stage(
                StageSpec::with_handler(REVIEWER, self.generative(REVIEWER))
                    .inputs(&["srs", "code"])
                    .outputs(&["review", "review_approved"])
                    .artifacts(&["review"])
                    .interruptible()
                    .route(
                        &[TEST_MANAGER, DEVELOPER],
                        review_router(RetryBudget::new("review_count", MAX_REVIEW_ROUNDS)),
                    ),
            )
            .stage(
                StageSpec::with_handler(TEST_MANAGER, self.generative(TEST_MANAGER))
                    .inputs(&["srs"])
                    .outputs(&["test_strategy"])
                    .artifacts(&["test_strategy"])
                    .interruptible()
                    .then(TEST_LEAD),
            )
            .stage(
                StageSpec::with_handler(TEST_LEAD, self.generative(TEST_LEAD))
                    .inputs(&["test_strategy"])
                    .outputs(&["step", "test_plan"])
                    .artifacts(&["step", "test_plan"])
                    .interruptible()
                    .fan_out(&[AUTOMATION_QA, MANUAL_QA]),
            )
            .stage(
                StageSpec::with_handler(AUTOMATION_QA, self.generative(AUTOMATION_QA))
                    .inputs(&["step", "test_plan"])
                    .outputs(&["automation_tests"])
                    .artifacts(&["automation_tests"])
                    .interruptible(),
            )
            .stage(
                StageSpec::with_handler(MANUAL_QA, self.generative(MANUAL_QA))
                    .inputs(&["step", "test_plan"])
                    .outputs(&["manual_tests", "bugs"])
                    .artifacts(&["manual_tests", "bugs"])
                    .interruptible(),
            )
            .entry_routed(&[PRODUCT_MANAGER, TEST_MANAGER, AUTOMATION_QA], select_start)
            .naming(artifact_naming())
            .build()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::TokenEmitter;
    use crate::handlers::{Generation, Prompt};
    use crate::validation::{validate, Severity};
    use async_trait::async_trait;
    use gantry_types::{Fields, RetryCounters, Run};
    use serde_json::json;

    struct Silent;

    #[async_trait]
    impl TextGenerator for Silent {
        async fn generate(&self, _stage: &str, _prompt: &Prompt, _emitter: &TokenEmitter) -> Result<Generation> {
            Ok(Generation::default())
        }
    }

    // 1. The reference pipeline builds with no errors
    #[test]
    fn pipeline_is_valid() {
        let def = QaPipeline::new(Arc::new(Silent)).build().unwrap();
        assert_eq!(def.stages().count(), 8);
        assert!(validate(&def).iter().all(|d| d.severity != Severity::Error));
        let interruptible = def.interruptible_stages();
        for stage in DEFAULT_INTERRUPTS {
            assert!(interruptible.contains(&stage), "{stage} should be interruptible");
        }
    }

    // 2. Entry routing by start mode
    #[test]
    fn start_mode_selects_entry() {
        let def = QaPipeline::new(Arc::new(Silent)).build().unwrap();
        let entry = |mode: Option<&str>| {
            let input = match mode {
                Some(m) => json!({"product_idea": "x", "start_mode": m}),
                None => json!({"product_idea": "x"}),
            };
            def.select_entry(&Run::new(PIPELINE_NAME, "t", input)).unwrap()
        };
        assert_eq!(entry(None), PRODUCT_MANAGER);
        assert_eq!(entry(Some("full")), PRODUCT_MANAGER);
        assert_eq!(entry(Some("sts_only")), TEST_MANAGER);
        assert_eq!(entry(Some("tests_only")), AUTOMATION_QA);
    }

    // 3. Execution router loops back three times, then moves on
    #[test]
    fn execution_router_is_bounded() {
        let router = execution_router(RetryBudget::new("dev_retries", MAX_DEV_RETRIES));
        let mut fields = Fields::new();
        fields.insert("tests_passed".into(), json!(false));
        let input = json!({});
        let mut counters = RetryCounters::new();

        let mut picks = Vec::new();
        for _ in 0..5 {
            let mut ctx = RouteContext {
                stage: EXECUTOR,
                input: &input,
                fields: &fields,
                retry_counters: &mut counters,
            };
            picks.push(router(&mut ctx));
        }
        assert_eq!(picks, vec![DEVELOPER, DEVELOPER, DEVELOPER, REVIEWER, REVIEWER]);
        assert_eq!(counters["dev_retries"], 3);

        fields.insert("tests_passed".into(), json!(true));
        let mut fresh = RetryCounters::new();
        let mut ctx = RouteContext {
            stage: EXECUTOR,
            input: &input,
            fields: &fields,
            retry_counters: &mut fresh,
        };
        assert_eq!(router(&mut ctx), REVIEWER);
        assert!(fresh.is_empty());
    }

    // 4. Review approval proceeds immediately
    #[test]
    fn review_router_respects_approval() {
        let router = review_router(RetryBudget::new("review_count", MAX_REVIEW_ROUNDS));
        let mut fields = Fields::new();
        fields.insert("review_approved".into(), json!(true));
        let input = json!({});
        let mut counters = RetryCounters::new();
        let mut ctx = RouteContext {
            stage: REVIEWER,
            input: &input,
            fields: &fields,
            retry_counters: &mut counters,
        };
        assert_eq!(router(&mut ctx), TEST_MANAGER);
    }

    // 5. Recovered records type into the tagged union
    #[test]
    fn manual_record_without_bugs() {
        let schema = schema_for(MANUAL_QA).unwrap();
        let record = gantry_recover::recover(r#"{"manual_tests": "TC-1: open app"}"#, &schema).unwrap();
        match StageRecord::from_record(MANUAL_QA, record).unwrap() {
            StageRecord::ManualQA(out) => {
                assert_eq!(out.manual_tests, "TC-1: open app");
                assert!(out.bugs.is_none());
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn developer_record_with_files() {
        let schema = schema_for(DEVELOPER).unwrap();
        let text = "```json\n{\"code\": \"Simple app\", \"files\": {\"app.py\": \"print('hi')\"},}\n```";
        let record = gantry_recover::recover(text, &schema).unwrap();
        let typed = StageRecord::from_record(DEVELOPER, record).unwrap();
        assert_eq!(typed.stage(), DEVELOPER);
        match typed {
            StageRecord::Developer(out) => assert_eq!(out.files["app.py"], "print('hi')"),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn unknown_stage_has_no_schema() {
        assert!(schema_for("Janitor").is_none());
        let record = ValidatedRecord {
            schema: "X".into(),
            fields: serde_json::Map::new(),
        };
        assert!(StageRecord::from_record("Janitor", record).is_err());
    }

    #[test]
    fn naming_follows_artifact_map() {
        let naming = artifact_naming();
        assert_eq!(naming.resolve("srs"), ("SRS.md".to_string(), "requirements".to_string()));
        assert_eq!(naming.resolve("bugs"), ("Bugs.md".to_string(), "bugs".to_string()));
        assert_eq!(naming.resolve("review"), ("review.txt".to_string(), "requirements".to_string()));
    }
}
