//! Pipeline definitions: stages, transitions, routing functions.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use gantry_types::{Fields, GantryError, Result, RetryCounters, Run};

use crate::artifacts::ArtifactNaming;
use crate::handler::StageHandler;
use crate::validation::validate_or_raise;

/// Sentinel used as the `from` of an invalid entry selection.
pub const ENTRY: &str = "<entry>";

pub type RouteFn = Arc<dyn Fn(&mut RouteContext<'_>) -> String + Send + Sync>;
pub type EntryFn = Arc<dyn Fn(&Run) -> String + Send + Sync>;

// ---------------------------------------------------------------------------
// RouteContext
// ---------------------------------------------------------------------------

/// What a routing function sees. Retry counters are owned by the routing
/// functions; the engine never bumps them itself.
pub struct RouteContext<'a> {
    pub stage: &'a str,
    pub input: &'a Value,
    pub fields: &'a Fields,
    pub retry_counters: &'a mut RetryCounters,
}

impl RouteContext<'_> {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    /// Boolean field; absent or non-bool reads as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.field(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn retries(&self, counter: &str) -> u32 {
        self.retry_counters.get(counter).copied().unwrap_or(0)
    }

    /// Increment `counter` and return its new value.
    pub fn bump(&mut self, counter: &str) -> u32 {
        let slot = self.retry_counters.entry(counter.to_string()).or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum Transition {
    Terminal,
    /// Unconditional successor(s). More than one target is a fan-out.
    Next(Vec<String>),
    /// A routing function restricted to `targets`.
    Routed { targets: Vec<String>, router: RouteFn },
}

impl Transition {
    /// Every stage this transition may lead to.
    pub fn targets(&self) -> &[String] {
        match self {
            Transition::Terminal => &[],
            Transition::Next(targets) => targets,
            Transition::Routed { targets, .. } => targets,
        }
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Terminal => f.write_str("Terminal"),
            Transition::Next(t) => f.debug_tuple("Next").field(t).finish(),
            Transition::Routed { targets, .. } => {
                f.debug_struct("Routed").field("targets", targets).finish()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StageSpec
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StageSpec {
    pub id: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub interruptible: bool,
    /// Output keys whose string values are saved as artifacts.
    pub artifacts: Vec<String>,
    pub handler: Arc<dyn StageHandler>,
    pub transition: Transition,
}

fn owned(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

impl StageSpec {
    pub fn new(id: impl Into<String>, handler: impl StageHandler + 'static) -> Self {
        Self::with_handler(id, Arc::new(handler))
    }

    pub fn with_handler(id: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            interruptible: false,
            artifacts: Vec::new(),
            handler,
            transition: Transition::Terminal,
        }
    }

    pub fn inputs(mut self, keys: &[&str]) -> Self {
        self.inputs = owned(keys);
        self
    }

    pub fn outputs(mut self, keys: &[&str]) -> Self {
        self.outputs = owned(keys);
        self
    }

    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    pub fn artifacts(mut self, keys: &[&str]) -> Self {
        self.artifacts = owned(keys);
        self
    }

    pub fn then(mut self, target: &str) -> Self {
        self.transition = Transition::Next(vec![target.to_string()]);
        self
    }

    pub fn fan_out(mut self, targets: &[&str]) -> Self {
        self.transition = Transition::Next(owned(targets));
        self
    }

    pub fn route<F>(mut self, targets: &[&str], router: F) -> Self
    where
        F: Fn(&mut RouteContext<'_>) -> String + Send + Sync + 'static,
    {
        self.transition = Transition::Routed {
            targets: owned(targets),
            router: Arc::new(router),
        };
        self
    }
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("id", &self.id)
            .field("handler", &self.handler.handler_type())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("interruptible", &self.interruptible)
            .field("transition", &self.transition)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Entry selection
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EntrySelector {
    pub targets: Vec<String>,
    select: EntryFn,
}

impl EntrySelector {
    pub fn fixed(stage: &str) -> Self {
        let stage = stage.to_string();
        Self {
            targets: vec![stage.clone()],
            select: Arc::new(move |_| stage.clone()),
        }
    }

    pub fn routed<F>(targets: &[&str], select: F) -> Self
    where
        F: Fn(&Run) -> String + Send + Sync + 'static,
    {
        Self {
            targets: owned(targets),
            select: Arc::new(select),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineDefinition
// ---------------------------------------------------------------------------

/// Immutable stage graph. Construct through [`PipelineBuilder`].
#[derive(Clone)]
pub struct PipelineDefinition {
    pub name: String,
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
    entry: EntrySelector,
    naming: ArtifactNaming,
}

impl PipelineDefinition {
    pub fn stage(&self, id: &str) -> Option<&StageSpec> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Like [`stage`](Self::stage) but an unknown id is a fault.
    pub fn require_stage(&self, id: &str) -> Result<&StageSpec> {
        self.stage(id).ok_or_else(|| GantryError::UnknownStage {
            stage: id.to_string(),
        })
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.iter()
    }

    pub fn entry_targets(&self) -> &[String] {
        &self.entry.targets
    }

    /// Run the entry selector; a choice outside the entry set is a fault.
    pub fn select_entry(&self, run: &Run) -> Result<String> {
        let chosen = (self.entry.select)(run);
        if self.entry.targets.contains(&chosen) {
            Ok(chosen)
        } else {
            Err(GantryError::InvalidRoute {
                from: ENTRY.to_string(),
                target: chosen,
            })
        }
    }

    /// Every output key declared by any stage.
    pub fn declared_outputs(&self) -> BTreeSet<String> {
        self.stages
            .iter()
            .flat_map(|s| s.outputs.iter().cloned())
            .collect()
    }

    pub fn interruptible_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.interruptible)
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn naming(&self) -> &ArtifactNaming {
        &self.naming
    }
}

impl fmt::Debug for PipelineDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDefinition")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("entry", &self.entry.targets)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageSpec>,
    entry: Option<EntrySelector>,
    naming: ArtifactNaming,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            entry: None,
            naming: ArtifactNaming::default(),
        }
    }

    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    pub fn entry(mut self, stage: &str) -> Self {
        self.entry = Some(EntrySelector::fixed(stage));
        self
    }

    pub fn entry_routed<F>(mut self, targets: &[&str], select: F) -> Self
    where
        F: Fn(&Run) -> String + Send + Sync + 'static,
    {
        self.entry = Some(EntrySelector::routed(targets, select));
        self
    }

    pub fn naming(mut self, naming: ArtifactNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Assemble without linting. Used by the lints' own tests.
    pub(crate) fn assemble(self) -> PipelineDefinition {
        let entry = match self.entry {
            Some(entry) => entry,
            None => match self.stages.first() {
                Some(first) => EntrySelector::fixed(&first.id),
                None => EntrySelector {
                    targets: Vec::new(),
                    select: Arc::new(|_| String::new()),
                },
            },
        };
        let index = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        PipelineDefinition {
            name: self.name,
            stages: self.stages,
            index,
            entry,
            naming: self.naming,
        }
    }

    /// Assemble and lint; any error-severity diagnostic fails the build.
    /// Without an explicit entry the first declared stage is the entry.
    pub fn build(self) -> Result<PipelineDefinition> {
        let definition = self.assemble();
        for diagnostic in validate_or_raise(&definition)? {
            tracing::warn!(
                pipeline = %definition.name,
                rule = %diagnostic.rule,
                "{}",
                diagnostic.message
            );
        }
        Ok(definition)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_types::StageOutput;
    use serde_json::json;

    use crate::handler::StageContext;

    struct Noop;

    #[async_trait]
    impl StageHandler for Noop {
        fn handler_type(&self) -> &str {
            "noop"
        }
        async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput> {
            Ok(StageOutput::default())
        }
    }

    #[test]
    fn builder_defaults_entry_to_first_stage() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).then("B"))
            .stage(StageSpec::new("B", Noop))
            .build()
            .unwrap();
        assert_eq!(def.entry_targets().to_vec(), vec!["A".to_string()]);
        let run = Run::new("p", "t", json!({}));
        assert_eq!(def.select_entry(&run).unwrap(), "A");
    }

    #[test]
    fn entry_outside_declared_set_is_invalid_route() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop))
            .entry_routed(&["A"], |_| "Z".to_string())
            .build()
            .unwrap();
        let run = Run::new("p", "t", json!({}));
        match def.select_entry(&run) {
            Err(GantryError::InvalidRoute { from, target }) => {
                assert_eq!(from, ENTRY);
                assert_eq!(target, "Z");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn route_context_bumps_counters() {
        let fields = Fields::new();
        let mut counters = RetryCounters::new();
        let input = json!({});
        let mut ctx = RouteContext {
            stage: "Executor",
            input: &input,
            fields: &fields,
            retry_counters: &mut counters,
        };
        assert_eq!(ctx.retries("dev_retries"), 0);
        assert_eq!(ctx.bump("dev_retries"), 1);
        assert_eq!(ctx.bump("dev_retries"), 2);
        assert!(!ctx.flag("tests_passed"));
        assert_eq!(counters["dev_retries"], 2);
    }

    #[test]
    fn declared_outputs_and_interruptible_stages() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).outputs(&["x", "y"]).then("B"))
            .stage(StageSpec::new("B", Noop).outputs(&["y", "z"]).interruptible())
            .build()
            .unwrap();
        let outputs: Vec<_> = def.declared_outputs().into_iter().collect();
        assert_eq!(outputs, vec!["x", "y", "z"]);
        assert_eq!(def.interruptible_stages(), vec!["B"]);
        assert!(def.require_stage("C").is_err());
    }

    #[test]
    fn build_rejects_dangling_targets() {
        let result = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).then("Missing"))
            .build();
        assert!(matches!(result, Err(GantryError::ValidationError(_))));
    }
}
