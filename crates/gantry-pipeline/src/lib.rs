//! Stage-graph pipeline engine, run store, event bus, and stage handlers.
//!
//! This crate implements the Gantry runner: routed stage graphs with bounded
//! retry loops, human-in-the-loop interrupts, cooperative cancellation,
//! checkpoint/resume, the progress event bus, and the QA reference pipeline.

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod events;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod qa;
pub mod retry;
pub mod store;
pub mod validation;

pub use artifacts::{ArtifactNaming, ArtifactSink, FileArtifactSink, MemoryArtifactSink};
pub use cancellation::CancellationToken;
pub use config::EngineConfig;
pub use engine::PipelineEngine;
pub use events::{Delivery, EventBus, EventKind, EventSink, EventStream, PipelineEvent, TokenAssembler};
pub use graph::{PipelineBuilder, PipelineDefinition, RouteContext, StageSpec, Transition, ENTRY};
pub use handler::{StageContext, StageHandler, TokenEmitter};
pub use handlers::{GenerativeStage, Generation, Prompt, PromptTemplate, TextGenerator, TranscriptGenerator};
pub use qa::{QaPipeline, StageRecord};
pub use retry::{execute_with_retry, BackoffPolicy, RetryBudget};
pub use store::{
    ArtifactRecord, CheckpointStore, FileStore, MemoryStore, RunMetadata, RunRegistry, RunStore, StatusUpdate,
};
pub use validation::{validate, validate_interrupts, validate_or_raise, Diagnostic, LintRule, Severity};
