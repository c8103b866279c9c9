//! # Model Backends
//!
//! The three inference backends and the coordinator that rations accelerator
//! memory between them.
//!
//! Pipelines never talk to a backend type directly; they go through the
//! [`coordinator::ResourceCoordinator`], which hands out exclusive leases.
//! The traits below are the seams: production wires in the candle-backed
//! implementations, tests substitute scripted stand-ins so pipeline logic
//! can run without downloading a single weight file.
//!
//! Inference entry points are deliberately synchronous; callers run them
//! under `tokio::task::spawn_blocking` so a long decode never stalls the
//! scheduler's event loop. Loading is async because it may download
//! artifacts.

pub mod coordinator;
pub mod embedder;
pub mod generator;
pub mod whisper;

use crate::config::ModelsConfig;
use crate::error::JobError;
use async_trait::async_trait;

/// Speech-to-text backend (heavy, accelerator-resident).
#[async_trait]
pub trait SpeechModel: Send + Sized + 'static {
    async fn load(models: &ModelsConfig) -> Result<Self, JobError>;

    /// Transcribe mono 16 kHz samples, biased by a priming prompt, in a
    /// fixed target language.
    fn transcribe(
        &mut self,
        audio: &[f32],
        priming_prompt: &str,
        language: &str,
    ) -> Result<String, JobError>;
}

/// Text-generation backend (heavy, accelerator-resident).
#[async_trait]
pub trait ChatModel: Send + Sized + 'static {
    async fn load(models: &ModelsConfig) -> Result<Self, JobError>;

    /// Complete a system/user prompt pair.
    ///
    /// Must return [`JobError::ContextTooLarge`] when the prompt cannot fit
    /// in the model's context window alongside `max_tokens` of output;
    /// the Q&A pipeline retries that class with a smaller context.
    fn complete(
        &mut self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: usize,
        temperature: f64,
    ) -> Result<String, JobError>;
}

/// Sentence-embedding backend (CPU-resident, outside the accelerator
/// exclusion entirely).
#[async_trait]
pub trait EmbeddingModel: Send + Sized + 'static {
    async fn load(models: &ModelsConfig) -> Result<Self, JobError>;

    fn embed(&mut self, text: &str) -> Result<Vec<f32>, JobError>;

    /// Batch embedding; the default just loops, implementations may batch
    /// properly.
    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, JobError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}
