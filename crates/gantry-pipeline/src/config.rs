//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use gantry_types::Result;

/// Settings shared by the engine, its stores and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the run registry (one directory per run).
    pub data_dir: PathBuf,
    /// Root for artifact content. Defaults to `data_dir` when unset.
    pub artifacts_dir: Option<PathBuf>,
    /// Per-subscriber event buffer; a full subscriber misses events.
    pub subscriber_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("runs"),
            artifacts_dir: None,
            subscriber_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing keys take their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn artifacts_root(&self) -> &Path {
        self.artifacts_dir.as_deref().unwrap_or(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"data_dir": "/tmp/g"}"#).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/g"));
        assert_eq!(config.subscriber_capacity, 256);
        assert_eq!(config.artifacts_root(), Path::new("/tmp/g"));
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.json");
        std::fs::write(
            &path,
            r#"{"artifacts_dir": "/srv/artifacts", "subscriber_capacity": 8}"#,
        )
        .unwrap();
        let config = EngineConfig::load(&path).await.unwrap();
        assert_eq!(config.subscriber_capacity, 8);
        assert_eq!(config.artifacts_root(), Path::new("/srv/artifacts"));
        assert_eq!(config.data_dir, PathBuf::from("runs"));
    }

    #[tokio::test]
    async fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, gantry_types::GantryError::Io(_)));
    }
}
