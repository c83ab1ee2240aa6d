//! Run registry and checkpoint store.
//!
//! [`FileStore`] keeps one directory per run:
//!
//! ```text
//! <root>/<run_id>/run_metadata.json
//! <root>/<run_id>/checkpoint.json
//! <root>/<run_id>/artifacts_manifest.json
//! ```
//!
//! Every write goes to a temporary file that is then renamed over the target,
//! and read-modify-write sequences for one run are serialised by a per-run
//! async mutex. [`MemoryStore`] offers the same contract without touching disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use gantry_types::{Checkpoint, GantryError, Result, Run, RunStatus};

const METADATA_FILE: &str = "run_metadata.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const MANIFEST_FILE: &str = "artifacts_manifest.json";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Durable metadata for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub id: String,
    pub title: String,
    pub pipeline: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_total: u64,
    /// The initiating payload, kept so a later process can resume the run.
    #[serde(default)]
    pub input: Value,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl RunMetadata {
    pub fn from_run(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            title: run.title.clone(),
            pipeline: run.pipeline.clone(),
            created_at: run.created_at,
            status: run.status,
            ended_at: run.ended_at,
            usage_total: run.usage.total_tokens,
            input: run.input.clone(),
            extra: Map::new(),
        }
    }

    /// Rebuild an empty run shell; execution state comes from a checkpoint.
    pub fn to_run(&self) -> Run {
        let mut run = Run::new(self.pipeline.clone(), self.title.clone(), self.input.clone())
            .with_id(self.id.clone());
        run.status = self.status;
        run.created_at = self.created_at;
        run.ended_at = self.ended_at;
        run
    }
}

/// A status transition plus any metadata to merge alongside it.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: RunStatus,
    pub usage_total: Option<u64>,
    pub extra: Map<String, Value>,
}

impl StatusUpdate {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            usage_total: None,
            extra: Map::new(),
        }
    }

    pub fn with_usage(mut self, total: u64) -> Self {
        self.usage_total = Some(total);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    fn apply(self, meta: &mut RunMetadata) {
        meta.status = self.status;
        if self.status.is_terminal() {
            meta.ended_at = Some(Utc::now());
        }
        if let Some(total) = self.usage_total {
            meta.usage_total = total;
        }
        meta.extra.extend(self.extra);
    }
}

/// One entry of a run's artifact manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub category: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub location: String,
}

fn upsert_artifact(manifest: &mut Vec<ArtifactRecord>, record: ArtifactRecord) {
    manifest.retain(|r| r.name != record.name);
    manifest.push(record);
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn create(&self, meta: RunMetadata) -> Result<()>;
    async fn update_status(&self, run_id: &str, update: StatusUpdate) -> Result<RunMetadata>;
    async fn get(&self, run_id: &str) -> Result<Option<RunMetadata>>;
    /// All runs, most recently created first.
    async fn list(&self) -> Result<Vec<RunMetadata>>;
    /// Upsert a manifest entry; the last write for a name wins.
    async fn record_artifact(&self, run_id: &str, record: ArtifactRecord) -> Result<()>;
    async fn manifest(&self, run_id: &str) -> Result<Vec<ArtifactRecord>>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>>;
    async fn checkpoint_exists(&self, run_id: &str) -> Result<bool>;
    async fn clear_checkpoint(&self, run_id: &str) -> Result<()>;
}

/// Everything the engine needs from persistence.
pub trait RunStore: RunRegistry + CheckpointStore {}

impl<T: RunRegistry + CheckpointStore> RunStore for T {}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

pub struct FileStore {
    root: PathBuf,
    locks: LockMap,
}

struct RunLock<'a> {
    locks: &'a LockMap,
    run_id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.run_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.run_id);
        }
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Serialise writes for one run. The map entry is dropped again once
    /// no task holds or waits for it.
    async fn lock_run(&self, run_id: &str) -> RunLock<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(run_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        RunLock {
            locks: &self.locks,
            run_id: run_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| GantryError::Other(format!("'{}' has no parent", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn require_metadata(&self, run_id: &str) -> Result<RunMetadata> {
        Self::read_json(&self.run_dir(run_id).join(METADATA_FILE))
            .await?
            .ok_or_else(|| GantryError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }
}

#[async_trait]
impl RunRegistry for FileStore {
    async fn create(&self, meta: RunMetadata) -> Result<()> {
        let _lock = self.lock_run(&meta.id).await;
        let path = self.run_dir(&meta.id).join(METADATA_FILE);
        if tokio::fs::try_exists(&path).await? {
            return Err(GantryError::RunExists { run_id: meta.id });
        }
        Self::write_json(&path, &meta).await?;
        tracing::debug!(run = %meta.id, path = %path.display(), "Run metadata created");
        Ok(())
    }

    async fn update_status(&self, run_id: &str, update: StatusUpdate) -> Result<RunMetadata> {
        let _lock = self.lock_run(run_id).await;
        let mut meta = self.require_metadata(run_id).await?;
        update.apply(&mut meta);
        Self::write_json(&self.run_dir(run_id).join(METADATA_FILE), &meta).await?;
        tracing::debug!(run = %run_id, status = %meta.status, "Run status updated");
        Ok(meta)
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunMetadata>> {
        Self::read_json(&self.run_dir(run_id).join(METADATA_FILE)).await
    }

    async fn list(&self) -> Result<Vec<RunMetadata>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(METADATA_FILE);
            match Self::read_json::<RunMetadata>(&path).await {
                Ok(Some(meta)) => runs.push(meta),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable run metadata");
                }
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn record_artifact(&self, run_id: &str, record: ArtifactRecord) -> Result<()> {
        let _lock = self.lock_run(run_id).await;
        let path = self.run_dir(run_id).join(MANIFEST_FILE);
        let mut manifest: Vec<ArtifactRecord> = Self::read_json(&path).await?.unwrap_or_default();
        upsert_artifact(&mut manifest, record);
        Self::write_json(&path, &manifest).await
    }

    async fn manifest(&self, run_id: &str) -> Result<Vec<ArtifactRecord>> {
        Ok(Self::read_json(&self.run_dir(run_id).join(MANIFEST_FILE))
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _lock = self.lock_run(&checkpoint.run_id).await;
        let path = self.run_dir(&checkpoint.run_id).join(CHECKPOINT_FILE);
        Self::write_json(&path, checkpoint).await?;
        tracing::debug!(
            run = %checkpoint.run_id,
            pending = %checkpoint.pending_stage_id,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        Self::read_json(&self.run_dir(run_id).join(CHECKPOINT_FILE)).await
    }

    async fn checkpoint_exists(&self, run_id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.run_dir(run_id).join(CHECKPOINT_FILE)).await?)
    }

    async fn clear_checkpoint(&self, run_id: &str) -> Result<()> {
        let _lock = self.lock_run(run_id).await;
        match tokio::fs::remove_file(self.run_dir(run_id).join(CHECKPOINT_FILE)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryEntry {
    meta: Option<RunMetadata>,
    checkpoint: Option<Checkpoint>,
    manifest: Vec<ArtifactRecord>,
}

/// In-process store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_runs<T>(&self, f: impl FnOnce(&mut HashMap<String, MemoryEntry>) -> T) -> T {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut runs)
    }
}

#[async_trait]
impl RunRegistry for MemoryStore {
    async fn create(&self, meta: RunMetadata) -> Result<()> {
        self.with_runs(|runs| {
            let entry = runs.entry(meta.id.clone()).or_default();
            if entry.meta.is_some() {
                return Err(GantryError::RunExists { run_id: meta.id });
            }
            entry.meta = Some(meta);
            Ok(())
        })
    }

    async fn update_status(&self, run_id: &str, update: StatusUpdate) -> Result<RunMetadata> {
        self.with_runs(|runs| {
            let meta = runs
                .get_mut(run_id)
                .and_then(|e| e.meta.as_mut())
                .ok_or_else(|| GantryError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            update.apply(meta);
            Ok(meta.clone())
        })
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunMetadata>> {
        Ok(self.with_runs(|runs| runs.get(run_id).and_then(|e| e.meta.clone())))
    }

    async fn list(&self) -> Result<Vec<RunMetadata>> {
        let mut all: Vec<RunMetadata> =
            self.with_runs(|runs| runs.values().filter_map(|e| e.meta.clone()).collect());
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn record_artifact(&self, run_id: &str, record: ArtifactRecord) -> Result<()> {
        self.with_runs(|runs| {
            upsert_artifact(&mut runs.entry(run_id.to_string()).or_default().manifest, record);
        });
        Ok(())
    }

    async fn manifest(&self, run_id: &str) -> Result<Vec<ArtifactRecord>> {
        Ok(self.with_runs(|runs| {
            runs.get(run_id)
                .map(|e| e.manifest.clone())
                .unwrap_or_default()
        }))
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.with_runs(|runs| {
            runs.entry(checkpoint.run_id.clone()).or_default().checkpoint = Some(checkpoint.clone());
        });
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.with_runs(|runs| runs.get(run_id).and_then(|e| e.checkpoint.clone())))
    }

    async fn checkpoint_exists(&self, run_id: &str) -> Result<bool> {
        Ok(self.with_runs(|runs| runs.get(run_id).is_some_and(|e| e.checkpoint.is_some())))
    }

    async fn clear_checkpoint(&self, run_id: &str) -> Result<()> {
        self.with_runs(|runs| {
            if let Some(entry) = runs.get_mut(run_id) {
                entry.checkpoint = None;
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
