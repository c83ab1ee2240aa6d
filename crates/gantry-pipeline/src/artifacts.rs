//! Artifact persistence and the output-key → file naming map.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use gantry_types::{GantryError, Result};

pub const DEFAULT_CATEGORY: &str = "requirements";

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Maps a stage output key to the artifact file name and category it is saved
/// under. Unmapped keys become `<key>.txt` in the `requirements` category.
#[derive(Debug, Clone, Default)]
pub struct ArtifactNaming {
    entries: BTreeMap<String, (String, String)>,
}

impl ArtifactNaming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, file_name: &str, category: &str) -> Self {
        self.entries
            .insert(key.to_string(), (file_name.to_string(), category.to_string()));
        self
    }

    pub fn resolve(&self, key: &str) -> (String, String) {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| (format!("{key}.txt"), DEFAULT_CATEGORY.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Storage transport for artifact content.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Store `content` and return the location it can be loaded from.
    async fn save(&self, run_id: &str, name: &str, category: &str, content: &str) -> Result<String>;

    /// Load content previously stored at `location` for `run_id`.
    async fn load(&self, run_id: &str, location: &str) -> Result<Option<String>>;
}

/// Writes artifacts to `<root>/<run_id>/<category>/<name>`.
pub struct FileArtifactSink {
    root: PathBuf,
}

impl FileArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, run_id: &str, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || location.is_empty() {
            return Err(GantryError::ArtifactError {
                name: location.to_string(),
                message: "location must be a relative path inside the run directory".into(),
            });
        }
        Ok(self.root.join(run_id).join(relative))
    }
}

#[async_trait]
impl ArtifactSink for FileArtifactSink {
    async fn save(&self, run_id: &str, name: &str, category: &str, content: &str) -> Result<String> {
        let location = format!("{category}/{name}");
        let path = self.resolve(run_id, &location)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| GantryError::ArtifactError {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        tracing::debug!(run = %run_id, path = %path.display(), "Artifact written");
        Ok(location)
    }

    async fn load(&self, run_id: &str, location: &str) -> Result<Option<String>> {
        let path = self.resolve(run_id, location)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps artifacts in memory, keyed by run and location.
#[derive(Default)]
pub struct MemoryArtifactSink {
    blobs: Mutex<HashMap<(String, String), String>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactSink for MemoryArtifactSink {
    async fn save(&self, run_id: &str, name: &str, category: &str, content: &str) -> Result<String> {
        let location = format!("{category}/{name}");
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((run_id.to_string(), location.clone()), content.to_string());
        Ok(location)
    }

    async fn load(&self, run_id: &str, location: &str) -> Result<Option<String>> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(run_id.to_string(), location.to_string()))
            .cloned())
    }
}
