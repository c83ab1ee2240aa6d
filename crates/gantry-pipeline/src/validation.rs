//! Pipeline validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! on any `Error`-severity issue. [`PipelineBuilder::build`](crate::PipelineBuilder::build)
//! runs the latter.

use std::collections::{BTreeSet, HashSet, VecDeque};

use gantry_types::{GantryError, Result};

use crate::graph::{PipelineDefinition, Transition};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub stage_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        if def.stages().next().is_some() {
            return vec![];
        }
        vec![Diagnostic {
            rule: self.name().into(),
            severity: Severity::Error,
            message: format!("Pipeline '{}' declares no stages", def.name),
            stage_id: None,
            edge: None,
            fix: Some("Add at least one stage".into()),
        }]
    }
}

struct DuplicateStageRule;
impl LintRule for DuplicateStageRule {
    fn name(&self) -> &str { "duplicate_stage" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        def.stages()
            .filter(|s| !seen.insert(s.id.as_str()))
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Stage '{}' is declared more than once", s.id),
                stage_id: Some(s.id.clone()),
                edge: None,
                fix: Some("Give every stage a unique id".into()),
            })
            .collect()
    }
}

struct EntryTargetsRule;
impl LintRule for EntryTargetsRule {
    fn name(&self) -> &str { "entry_targets" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        if def.entry_targets().is_empty() {
            return vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Entry selector has an empty target set".into(),
                stage_id: None,
                edge: None,
                fix: Some("Declare at least one entry stage".into()),
            }];
        }
        def.entry_targets()
            .iter()
            .filter(|t| def.stage(t).is_none())
            .map(|t| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Entry target '{t}' is not a stage"),
                stage_id: Some(t.clone()),
                edge: None,
                fix: Some(format!("Add stage '{t}' or remove it from the entry set")),
            })
            .collect()
    }
}

struct TransitionTargetsRule;
impl LintRule for TransitionTargetsRule {
    fn name(&self) -> &str { "transition_targets" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for stage in def.stages() {
            match &stage.transition {
                Transition::Terminal => {}
                Transition::Next(targets) | Transition::Routed { targets, .. }
                    if targets.is_empty() =>
                {
                    out.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!("Stage '{}' has a transition with no targets", stage.id),
                        stage_id: Some(stage.id.clone()),
                        edge: None,
                        fix: Some("Use a terminal transition instead".into()),
                    });
                }
                transition => {
                    for target in transition.targets() {
                        if def.stage(target).is_none() {
                            out.push(Diagnostic {
                                rule: self.name().into(),
                                severity: Severity::Error,
                                message: format!(
                                    "Transition {} -> {} references non-existent stage '{}'",
                                    stage.id, target, target
                                ),
                                stage_id: None,
                                edge: Some((stage.id.clone(), target.clone())),
                                fix: Some(format!("Add stage '{target}' or fix the transition")),
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

struct FanOutDistinctRule;
impl LintRule for FanOutDistinctRule {
    fn name(&self) -> &str { "fan_out_distinct" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        def.stages()
            .filter_map(|stage| {
                let Transition::Next(targets) = &stage.transition else {
                    return None;
                };
                let unique: HashSet<_> = targets.iter().collect();
                (unique.len() != targets.len()).then(|| Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!("Stage '{}' fans out to the same stage twice", stage.id),
                    stage_id: Some(stage.id.clone()),
                    edge: None,
                    fix: Some("Remove the duplicate target".into()),
                })
            })
            .collect()
    }
}

struct InputsProducibleRule;
impl LintRule for InputsProducibleRule {
    fn name(&self) -> &str { "inputs_producible" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let produced: BTreeSet<String> = def.declared_outputs();
        let mut out = Vec::new();
        for stage in def.stages() {
            for input in &stage.inputs {
                if !produced.contains(input) {
                    out.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Stage '{}' reads '{}', which no stage produces",
                            stage.id, input
                        ),
                        stage_id: Some(stage.id.clone()),
                        edge: None,
                        fix: Some(format!("Declare '{input}' as an output of an earlier stage")),
                    });
                }
            }
        }
        out
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, def: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for entry in def.entry_targets() {
            if visited.insert(entry.as_str()) {
                queue.push_back(entry.as_str());
            }
        }
        while let Some(current) = queue.pop_front() {
            let Some(stage) = def.stage(current) else {
                continue;
            };
            for target in stage.transition.targets() {
                if visited.insert(target.as_str()) {
                    queue.push_back(target.as_str());
                }
            }
        }

        def.stages()
            .filter(|s| !visited.contains(s.id.as_str()))
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Stage '{}' is not reachable from any entry stage", s.id),
                stage_id: Some(s.id.clone()),
                edge: None,
                fix: Some(format!("Add a transition leading to '{}' or remove it", s.id)),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules.
pub fn validate(definition: &PipelineDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NonEmptyRule),
        Box::new(DuplicateStageRule),
        Box::new(EntryTargetsRule),
        Box::new(TransitionTargetsRule),
        Box::new(FanOutDistinctRule),
        Box::new(InputsProducibleRule),
        Box::new(ReachabilityRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(definition));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(definition: &PipelineDefinition) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(definition);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(GantryError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

/// Check a caller-supplied interrupt set against a definition.
///
/// Unknown stages and stages not flagged interruptible produce warnings; the
/// engine ignores such entries.
pub fn validate_interrupts(definition: &PipelineDefinition, interrupts: &[String]) -> Vec<Diagnostic> {
    interrupts
        .iter()
        .filter_map(|id| {
            let message = match definition.stage(id) {
                None => format!("Interrupt requested for unknown stage '{id}'"),
                Some(stage) if !stage.interruptible => {
                    format!("Stage '{id}' is not interruptible; interrupt ignored")
                }
                Some(_) => return None,
            };
            Some(Diagnostic {
                rule: "interrupts".into(),
                severity: Severity::Warning,
                message,
                stage_id: Some(id.clone()),
                edge: None,
                fix: None,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gantry_types::StageOutput;

    use crate::graph::{PipelineBuilder, StageSpec};
    use crate::handler::{StageContext, StageHandler};

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

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn clean_pipeline_has_no_diagnostics() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).outputs(&["x"]).then("B"))
            .stage(StageSpec::new("B", Noop).inputs(&["x"]))
            .assemble();
        assert!(validate(&def).is_empty());
    }

    #[test]
    fn empty_pipeline_is_an_error() {
        let def = PipelineBuilder::new("p").assemble();
        let diags = validate(&def);
        assert!(rules_hit(&diags).contains(&"non_empty"));
        assert!(validate_or_raise(&def).is_err());
    }

    #[test]
    fn duplicate_and_dangling_are_errors() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).then("Ghost"))
            .stage(StageSpec::new("A", Noop))
            .assemble();
        let diags = validate(&def);
        let hit = rules_hit(&diags);
        assert!(hit.contains(&"duplicate_stage"));
        assert!(hit.contains(&"transition_targets"));
        let dangling = diags
            .iter()
            .find(|d| d.rule == "transition_targets")
            .unwrap();
        assert_eq!(dangling.edge, Some(("A".into(), "Ghost".into())));
    }

    #[test]
    fn empty_route_target_set_is_an_error() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).route(&[], |_| "A".to_string()))
            .assemble();
        let err = validate_or_raise(&def).unwrap_err();
        assert!(err.to_string().contains("no targets"));
    }

    #[test]
    fn unknown_entry_target_is_an_error() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop))
            .entry_routed(&["A", "Nope"], |_| "A".to_string())
            .assemble();
        assert!(rules_hit(&validate(&def)).contains(&"entry_targets"));
    }

    #[test]
    fn unreachable_and_unproducible_are_warnings() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).inputs(&["seed"]))
            .stage(StageSpec::new("Island", Noop))
            .assemble();
        let diags = validate(&def);
        assert!(diags.iter().all(|d| d.severity == Severity::Warning));
        let hit = rules_hit(&diags);
        assert!(hit.contains(&"reachability"));
        assert!(hit.contains(&"inputs_producible"));
        assert!(validate_or_raise(&def).is_ok());
    }

    #[test]
    fn interrupt_set_checked_against_flags() {
        let def = PipelineBuilder::new("p")
            .stage(StageSpec::new("A", Noop).then("B"))
            .stage(StageSpec::new("B", Noop).interruptible())
            .assemble();
        let diags = validate_interrupts(&def, &["A".into(), "B".into(), "Z".into()]);
        let stages: Vec<_> = diags.iter().filter_map(|d| d.stage_id.as_deref()).collect();
        assert_eq!(stages, vec!["A", "Z"]);
    }
}
