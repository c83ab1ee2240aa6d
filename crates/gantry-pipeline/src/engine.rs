//! Pipeline execution engine: the per-run stage loop.
//!
//! Each run is driven by one worker, strictly sequentially:
//! interrupt check, stop check, boundary checkpoint, handler, merge,
//! artifacts, routing. Fan-out targets become queued branches executed
//! depth-first on the same worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;

use gantry_types::{
    Checkpoint, GantryError, Result, Run, RunStatus, StageFailure, StageOutput,
};

use crate::artifacts::{ArtifactSink, FileArtifactSink};
use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::events::{EventBus, EventStream, PipelineEvent};
use crate::graph::{PipelineDefinition, RouteContext, StageSpec, Transition};
use crate::handler::StageContext;
use crate::store::{
    ArtifactRecord, CheckpointStore, FileStore, RunMetadata, RunRegistry, RunStore, StatusUpdate,
};
use crate::validation::validate_interrupts;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Owns registered pipelines, persistence, the event bus and the live
/// cancellation tokens of running workers.
pub struct PipelineEngine {
    pipelines: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
    store: Arc<dyn RunStore>,
    artifacts: Arc<dyn ArtifactSink>,
    bus: EventBus,
    live: Mutex<HashMap<String, CancellationToken>>,
}

/// Where a worker picks up: the next stage and the branches queued behind it.
struct Cursor {
    current: String,
    queued: VecDeque<String>,
    /// Skip the interrupt on the first step (resuming a paused run).
    resuming_pause: bool,
}

// ---------------------------------------------------------------------------
// PipelineEngine
// ---------------------------------------------------------------------------

impl PipelineEngine {
    pub fn new(store: Arc<dyn RunStore>, artifacts: Arc<dyn ArtifactSink>, bus: EventBus) -> Self {
        Self {
            pipelines: RwLock::new(HashMap::new()),
            store,
            artifacts,
            bus,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// File-backed engine rooted at the configured directories.
    ///
    /// Spawns the event broadcaster, so call it inside a tokio runtime.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(FileStore::new(config.data_dir.clone())),
            Arc::new(FileArtifactSink::new(config.artifacts_root())),
            EventBus::new(config.subscriber_capacity),
        )
    }

    pub fn register(&self, definition: PipelineDefinition) {
        let name = definition.name.clone();
        let previous = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(definition));
        if previous.is_some() {
            tracing::info!(pipeline = %name, "Replaced pipeline definition");
        } else {
            tracing::info!(pipeline = %name, "Registered pipeline");
        }
    }

    pub fn definition(&self, name: &str) -> Result<Arc<PipelineDefinition>> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| GantryError::PipelineNotFound {
                name: name.to_string(),
            })
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub async fn list_runs(&self) -> Result<Vec<RunMetadata>> {
        self.store.list().await
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    /// Start `run` and drive it until it pauses or terminates.
    pub async fn start(&self, run: Run, interrupts: &[String]) -> Result<Run> {
        let token = self.claim(&run.id)?;
        let run_id = run.id.clone();
        let result = self.start_claimed(run, interrupts, token).await;
        self.release(&run_id);
        result
    }

    /// Continue a paused (or crashed) run from its checkpoint.
    pub async fn resume(&self, run_id: &str, interrupts: &[String]) -> Result<Run> {
        let token = self.claim(run_id)?;
        let result = self.resume_claimed(run_id, interrupts, token).await;
        self.release(run_id);
        result
    }

    /// [`start`](Self::start) on a dedicated task.
    pub fn spawn_start(self: &Arc<Self>, run: Run, interrupts: Vec<String>) -> Result<JoinHandle<Result<Run>>> {
        let token = self.claim(&run.id)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let run_id = run.id.clone();
            let result = engine.start_claimed(run, &interrupts, token).await;
            engine.release(&run_id);
            result
        }))
    }

    /// [`resume`](Self::resume) on a dedicated task.
    pub fn spawn_resume(self: &Arc<Self>, run_id: &str, interrupts: Vec<String>) -> Result<JoinHandle<Result<Run>>> {
        let token = self.claim(run_id)?;
        let engine = Arc::clone(self);
        let run_id = run_id.to_string();
        Ok(tokio::spawn(async move {
            let result = engine.resume_claimed(&run_id, &interrupts, token).await;
            engine.release(&run_id);
            result
        }))
    }

    /// Ask a run to stop.
    ///
    /// A live run is stopped cooperatively by its worker. A paused run (or a
    /// running run whose worker is gone) is marked `stopped` directly; the
    /// run id stays claimed meanwhile, so a concurrent start or resume is
    /// refused. Returns `false` if the run had already terminated.
    pub async fn request_stop(&self, run_id: &str) -> Result<bool> {
        {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = live.get(run_id) {
                token.cancel("stop requested");
                tracing::info!(run = %run_id, "Stop requested for live run");
                return Ok(true);
            }
            let token = CancellationToken::new();
            token.cancel("stop requested");
            live.insert(run_id.to_string(), token);
        }

        let result = self.stop_idle(run_id).await;
        self.release(run_id);
        result
    }

    async fn stop_idle(&self, run_id: &str) -> Result<bool> {
        let meta = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| GantryError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if meta.status.is_terminal() {
            return Ok(false);
        }
        self.store
            .update_status(run_id, StatusUpdate::new(RunStatus::Stopped))
            .await?;
        self.store.clear_checkpoint(run_id).await?;
        self.bus
            .publish(PipelineEvent::completed(run_id, RunStatus::Stopped));
        tracing::info!(run = %run_id, from = %meta.status, "Run stopped while not executing");
        Ok(true)
    }

    /// Load an artifact by name through the run's manifest.
    pub async fn fetch_artifact(&self, run_id: &str, name: &str) -> Result<Option<String>> {
        let manifest = self.store.manifest(run_id).await?;
        match manifest.iter().find(|r| r.name == name) {
            Some(record) => self.artifacts.load(run_id, &record.location).await,
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Worker bookkeeping
    // -----------------------------------------------------------------------

    fn claim(&self, run_id: &str) -> Result<CancellationToken> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.contains_key(run_id) {
            return Err(GantryError::NotResumable {
                run_id: run_id.to_string(),
                status: RunStatus::Running,
            });
        }
        let token = CancellationToken::new();
        live.insert(run_id.to_string(), token.clone());
        Ok(token)
    }

    fn release(&self, run_id: &str) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }

    async fn start_claimed(&self, mut run: Run, interrupts: &[String], token: CancellationToken) -> Result<Run> {
        let definition = self.definition(&run.pipeline)?;
        warn_interrupts(&definition, interrupts);

        run.status = RunStatus::Running;
        run.ended_at = None;
        for key in definition.declared_outputs() {
            let seeded = run.input.get(&key).cloned().unwrap_or(Value::Null);
            run.fields.entry(key).or_insert(seeded);
        }

        if let Err(e) = self.store.create(RunMetadata::from_run(&run)).await {
            self.bus.publish(PipelineEvent::error(&run.id, &e.to_string()));
            return Err(e);
        }
        tracing::info!(run = %run.id, pipeline = %run.pipeline, "Run started");
        self.bus
            .publish(PipelineEvent::start(&run.id, &run.pipeline, &run.title));

        let entry = match definition.select_entry(&run) {
            Ok(entry) => entry,
            Err(e) => return self.fault(run, e).await,
        };
        let cursor = Cursor {
            current: entry,
            queued: VecDeque::new(),
            resuming_pause: false,
        };
        self.drive(&definition, run, cursor, interrupts, &token).await
    }

    async fn resume_claimed(&self, run_id: &str, interrupts: &[String], token: CancellationToken) -> Result<Run> {
        let meta = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| GantryError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if !matches!(meta.status, RunStatus::Paused | RunStatus::Running) {
            return Err(GantryError::NotResumable {
                run_id: run_id.to_string(),
                status: meta.status,
            });
        }
        let checkpoint = self
            .store
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| GantryError::CheckpointMissing {
                run_id: run_id.to_string(),
            })?;
        let definition = self.definition(&meta.pipeline)?;
        warn_interrupts(&definition, interrupts);

        let mut run = meta.to_run();
        checkpoint.restore_into(&mut run);
        run.status = RunStatus::Running;
        if let Err(e) = self
            .store
            .update_status(run_id, StatusUpdate::new(RunStatus::Running))
            .await
        {
            return self.fault(run, e).await;
        }
        tracing::info!(
            run = %run_id,
            stage = %checkpoint.pending_stage_id,
            from = %meta.status,
            "Run resumed"
        );
        self.bus
            .publish(PipelineEvent::start(&run.id, &run.pipeline, &run.title));

        let cursor = Cursor {
            current: checkpoint.pending_stage_id.clone(),
            queued: checkpoint.queued.iter().cloned().collect(),
            resuming_pause: meta.status == RunStatus::Paused,
        };
        self.drive(&definition, run, cursor, interrupts, &token).await
    }

    // -----------------------------------------------------------------------
    // The loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        definition: &PipelineDefinition,
        mut run: Run,
        mut cursor: Cursor,
        interrupts: &[String],
        token: &CancellationToken,
    ) -> Result<Run> {
        let interrupts: HashSet<&str> = interrupts.iter().map(String::as_str).collect();

        loop {
            let stage = match definition.require_stage(&cursor.current) {
                Ok(stage) => stage,
                Err(e) => return self.fault(run, e).await,
            };

            // Interrupt strictly before the stage runs.
            let skip_interrupt = std::mem::take(&mut cursor.resuming_pause);
            if stage.interruptible && interrupts.contains(stage.id.as_str()) && !skip_interrupt {
                return self.pause(run, &cursor).await;
            }

            if token.is_cancelled() {
                return self.finish(run, RunStatus::Stopped).await;
            }
            match self.ended_elsewhere(&run.id).await {
                Ok(Some(status)) => return self.yield_to(run, status).await,
                Ok(None) => {}
                Err(e) => return self.fault(run, e).await,
            }

            let boundary = Checkpoint::capture(&run, &stage.id, cursor.queued.iter().cloned().collect());
            if let Err(e) = self.store.save_checkpoint(&boundary).await {
                return self.fault(run, e).await;
            }

            let output = match self.run_stage(&run, stage, token).await {
                Some(output) => output,
                None => return self.finish(run, RunStatus::Stopped).await,
            };

            merge_output(&mut run, stage, &output);
            self.persist_artifacts(definition, &mut run, stage, &output).await;
            self.bus.publish(PipelineEvent::stage_complete(
                &run.id,
                &stage.id,
                output.success,
                &output.message,
            ));

            let next = match &stage.transition {
                Transition::Terminal => Vec::new(),
                Transition::Next(targets) => targets.clone(),
                Transition::Routed { targets, router } => {
                    let mut ctx = RouteContext {
                        stage: &stage.id,
                        input: &run.input,
                        fields: &run.fields,
                        retry_counters: &mut run.retry_counters,
                    };
                    let chosen = router(&mut ctx);
                    if !targets.contains(&chosen) {
                        let err = GantryError::InvalidRoute {
                            from: stage.id.clone(),
                            target: chosen,
                        };
                        return self.fault(run, err).await;
                    }
                    tracing::debug!(run = %run.id, from = %stage.id, to = %chosen, "Routed");
                    vec![chosen]
                }
            };

            for target in next.into_iter().rev() {
                cursor.queued.push_front(target);
            }
            match cursor.queued.pop_front() {
                Some(next) => cursor.current = next,
                None => {
                    let status = if run.errors.is_empty() {
                        RunStatus::Completed
                    } else {
                        RunStatus::Error
                    };
                    return self.finish(run, status).await;
                }
            }
        }
    }

    /// Invoke the stage handler. `None` means the run must stop without
    /// merging this stage's output.
    async fn run_stage(&self, run: &Run, stage: &StageSpec, token: &CancellationToken) -> Option<StageOutput> {
        tracing::info!(run = %run.id, stage = %stage.id, handler = %stage.handler.handler_type(), "Stage started");
        self.bus.publish(PipelineEvent::stage_start(&run.id, &stage.id));

        let ctx = StageContext::new(
            run.id.clone(),
            stage.id.clone(),
            run.input.clone(),
            run.restricted(&stage.inputs),
            token.clone(),
            Some(self.bus.clone()),
        );
        let result = stage.handler.execute(&ctx).await;
        self.bus.flush_tokens(&run.id, &stage.id);

        match result {
            Err(e) if e.is_cancellation() => {
                tracing::info!(run = %run.id, stage = %stage.id, "Handler observed stop");
                None
            }
            _ if token.is_cancelled() => {
                tracing::info!(run = %run.id, stage = %stage.id, "Stop observed after handler returned");
                None
            }
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(run = %run.id, stage = %stage.id, error = %e, "Handler failed");
                Some(StageOutput::fail(e.to_string()))
            }
        }
    }

    async fn persist_artifacts(
        &self,
        definition: &PipelineDefinition,
        run: &mut Run,
        stage: &StageSpec,
        output: &StageOutput,
    ) {
        for key in &stage.artifacts {
            if !stage.outputs.contains(key) {
                continue;
            }
            let Some(value) = output.fields.get(key) else {
                continue;
            };
            let (file_name, category) = definition.naming().resolve(key);
            let items: Vec<(String, &str)> = match value {
                Value::String(text) if !text.is_empty() => vec![(file_name, text.as_str())],
                Value::Object(files) => files
                    .iter()
                    .filter_map(|(name, v)| v.as_str().map(|text| (name.clone(), text)))
                    .collect(),
                _ => Vec::new(),
            };

            for (name, content) in items {
                match self.save_artifact(&run.id, &stage.id, &name, &category, content).await {
                    Ok(location) => {
                        self.bus.publish(PipelineEvent::artifact_produced(
                            &run.id, &stage.id, &name, &category, &location,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(run = %run.id, stage = %stage.id, artifact = %name, error = %e, "Artifact not saved");
                        run.errors.push(StageFailure {
                            stage: stage.id.clone(),
                            message: format!("artifact '{name}' not saved"),
                            errors: vec![e.to_string()],
                            at: Utc::now(),
                        });
                    }
                }
            }
        }
    }

    async fn save_artifact(
        &self,
        run_id: &str,
        stage_id: &str,
        name: &str,
        category: &str,
        content: &str,
    ) -> Result<String> {
        let location = self.artifacts.save(run_id, name, category, content).await?;
        self.store
            .record_artifact(
                run_id,
                ArtifactRecord {
                    name: name.to_string(),
                    category: category.to_string(),
                    stage: stage_id.to_string(),
                    timestamp: Utc::now(),
                    location: location.clone(),
                },
            )
            .await?;
        Ok(location)
    }

    // -----------------------------------------------------------------------
    // Exits
    // -----------------------------------------------------------------------

    async fn pause(&self, mut run: Run, cursor: &Cursor) -> Result<Run> {
        match self.ended_elsewhere(&run.id).await {
            Ok(Some(status)) => return self.yield_to(run, status).await,
            Ok(None) => {}
            Err(e) => return self.fault(run, e).await,
        }
        let checkpoint = Checkpoint::capture(&run, &cursor.current, cursor.queued.iter().cloned().collect());
        if let Err(e) = self.store.save_checkpoint(&checkpoint).await {
            return self.fault(run, e).await;
        }
        run.status = RunStatus::Paused;
        if let Err(e) = self
            .store
            .update_status(
                &run.id,
                StatusUpdate::new(RunStatus::Paused).with_usage(run.usage.total_tokens),
            )
            .await
        {
            return self.fault(run, e).await;
        }
        tracing::info!(run = %run.id, stage = %cursor.current, "Run paused before stage");
        self.bus.publish(PipelineEvent::paused(&run.id, &cursor.current));
        Ok(run)
    }

    async fn finish(&self, mut run: Run, status: RunStatus) -> Result<Run> {
        match self.ended_elsewhere(&run.id).await {
            Ok(Some(stored)) => return self.yield_to(run, stored).await,
            Ok(None) => {}
            Err(e) => return self.fault(run, e).await,
        }
        run.status = status;
        run.ended_at = Some(Utc::now());
        let update = StatusUpdate::new(status)
            .with_usage(run.usage.total_tokens)
            .with_extra("error_count", Value::from(run.errors.len()));
        if let Err(e) = self.store.update_status(&run.id, update).await {
            return self.fault(run, e).await;
        }
        if let Err(e) = self.store.clear_checkpoint(&run.id).await {
            tracing::warn!(run = %run.id, error = %e, "Checkpoint not cleared");
        }
        tracing::info!(
            run = %run.id,
            status = %status,
            errors = run.errors.len(),
            tokens = run.usage.total_tokens,
            "Run finished"
        );
        self.bus.publish(PipelineEvent::completed(&run.id, status));
        Ok(run)
    }

    /// Terminal status already in the registry, written by a stop that did
    /// not go through this worker's token (another process, or a race).
    async fn ended_elsewhere(&self, run_id: &str) -> Result<Option<RunStatus>> {
        Ok(self
            .store
            .get(run_id)
            .await?
            .map(|meta| meta.status)
            .filter(RunStatus::is_terminal))
    }

    /// Give up a run whose terminal status was recorded elsewhere. The stored
    /// status stands and its `completed` event has already been published.
    async fn yield_to(&self, mut run: Run, status: RunStatus) -> Result<Run> {
        run.status = status;
        run.ended_at = Some(Utc::now());
        if let Err(e) = self.store.clear_checkpoint(&run.id).await {
            tracing::warn!(run = %run.id, error = %e, "Checkpoint not cleared");
        }
        tracing::info!(run = %run.id, status = %status, "Run already ended elsewhere, worker exits");
        Ok(run)
    }

    /// Engine-level fault: mark the run errored (best effort), emit `error`,
    /// and hand the error back to the caller.
    async fn fault(&self, mut run: Run, err: GantryError) -> Result<Run> {
        tracing::error!(run = %run.id, error = %err, "Run aborted by engine fault");
        run.status = RunStatus::Error;
        run.ended_at = Some(Utc::now());
        let update = StatusUpdate::new(RunStatus::Error)
            .with_usage(run.usage.total_tokens)
            .with_extra("fault", Value::String(err.to_string()));
        if let Err(e) = self.store.update_status(&run.id, update).await {
            tracing::warn!(run = %run.id, error = %e, "Could not record fault status");
        }
        if let Err(e) = self.store.clear_checkpoint(&run.id).await {
            tracing::warn!(run = %run.id, error = %e, "Checkpoint not cleared");
        }
        self.bus.publish(PipelineEvent::error(&run.id, &err.to_string()));
        Err(err)
    }
}

fn warn_interrupts(definition: &PipelineDefinition, interrupts: &[String]) {
    for diagnostic in validate_interrupts(definition, interrupts) {
        tracing::warn!(pipeline = %definition.name, "{}", diagnostic.message);
    }
}

/// Merge declared outputs, accumulate usage and record a failed stage.
fn merge_output(run: &mut Run, stage: &StageSpec, output: &StageOutput) {
    for (key, value) in &output.fields {
        if stage.outputs.contains(key) {
            run.fields.insert(key.clone(), value.clone());
        } else {
            tracing::warn!(run = %run.id, stage = %stage.id, field = %key, "Ignoring undeclared output field");
        }
    }
    run.usage += output.usage;
    if !output.success {
        let message = if output.message.is_empty() {
            "stage failed".to_string()
        } else {
            output.message.clone()
        };
        run.errors.push(StageFailure {
            stage: stage.id.clone(),
            message,
            errors: output.errors.clone(),
            at: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
