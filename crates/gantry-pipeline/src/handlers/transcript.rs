//! Offline generator that replays saved stage replies from disk.

use std::path::PathBuf;

use async_trait::async_trait;

use gantry_types::{GantryError, Result, Usage};

use super::generative::{Generation, Prompt, TextGenerator};
use crate::handler::TokenEmitter;

/// Replays `<dir>/<stage>.txt` as the reply for `stage`, streamed in
/// fixed-size fragments. Usage is reported as one token per fragment.
#[derive(Debug, Clone)]
pub struct TranscriptGenerator {
    dir: PathBuf,
    chunk_chars: usize,
}

impl TranscriptGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            chunk_chars: 16,
        }
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    pub fn path_for(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{stage}.txt"))
    }
}

#[async_trait]
impl TextGenerator for TranscriptGenerator {
    async fn generate(&self, stage: &str, _prompt: &Prompt, emitter: &TokenEmitter) -> Result<Generation> {
        let path = self.path_for(stage);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| GantryError::HandlerError {
                stage: stage.to_string(),
                message: format!("no transcript at {}: {e}", path.display()),
            })?;

        let chars: Vec<char> = text.chars().collect();
        let mut fragments = 0u64;
        for chunk in chars.chunks(self.chunk_chars) {
            emitter.emit(&chunk.iter().collect::<String>())?;
            fragments += 1;
            tokio::task::yield_now().await;
        }
        tracing::debug!(stage = %stage, path = %path.display(), fragments, "Replayed transcript");

        Ok(Generation {
            text,
            usage: Usage::new(0, fragments),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::handler::StageContext;
    use serde_json::json;

    fn prompt() -> Prompt {
        Prompt {
            system: String::new(),
            user: String::new(),
        }
    }

    #[tokio::test]
    async fn replays_file_for_stage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Reviewer.txt"), "0123456789abcdefXYZ").unwrap();
        let generator = TranscriptGenerator::new(dir.path());
        let ctx = StageContext::new("r", "Reviewer", json!({}), Default::default(), CancellationToken::new(), None);

        let generation = generator.generate("Reviewer", &prompt(), ctx.emitter()).await.unwrap();
        assert_eq!(generation.text, "0123456789abcdefXYZ");
        assert_eq!(generation.usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn missing_transcript_is_handler_error() {
        let dir = tempfile::tempdir().unwrap();
        let generator = TranscriptGenerator::new(dir.path());
        let ctx = StageContext::new("r", "Developer", json!({}), Default::default(), CancellationToken::new(), None);

        match generator.generate("Developer", &prompt(), ctx.emitter()).await {
            Err(GantryError::HandlerError { stage, .. }) => assert_eq!(stage, "Developer"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stops_when_emitter_refuses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Developer.txt"), "some reply").unwrap();
        let generator = TranscriptGenerator::new(dir.path()).with_chunk_chars(2);
        let cancel = CancellationToken::new();
        cancel.cancel("stop");
        let ctx = StageContext::new("r", "Developer", json!({}), Default::default(), cancel, None);

        assert!(matches!(
            generator.generate("Developer", &prompt(), ctx.emitter()).await,
            Err(GantryError::Cancelled { .. })
        ));
    }
}
