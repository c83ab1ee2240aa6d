//! Built-in stage handlers.

pub mod generative;
pub mod transcript;

pub use generative::{GenerativeStage, Generation, Prompt, PromptTemplate, TextGenerator};
pub use transcript::TranscriptGenerator;
