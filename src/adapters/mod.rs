//! Adapter interfaces for external systems.
//!
//! Adapters provide a unified interface over the services the pipeline
//! calls out to: speech-to-text, the LLM used for enrichment, and the
//! push channel used for reminders.

pub mod homeassistant;
pub mod ollama;
pub mod whisper;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::OwnerId;

pub use homeassistant::{HomeAssistantConfig, HomeAssistantNotifier, LogNotifier};
pub use ollama::OllamaClient;
pub use whisper::WhisperTranscriber;

/// Errors raised while turning audio into text
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("Audio file not found: {0}")]
    MissingAudio(PathBuf),

    #[error("Transcriber failed: {0}")]
    Backend(String),

    #[error("Transcription produced no text")]
    Empty,

    #[error("Transcription timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while summarizing, tagging or embedding
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("Model service unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model service error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Model '{0}' not found; pull it or change the configured model")]
    ModelNotFound(String),

    #[error("Could not parse model output: {0}")]
    Parse(String),

    #[error("No embedding returned by model")]
    EmptyEmbedding,

    #[error("Enrichment timed out after {0:?}")]
    Timeout(Duration),
}

/// Output of the summarize-and-tag call
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    /// Short summary (a few words)
    pub summary: String,

    /// Tag from the allowed set, if the model picked a known one
    pub tag: Option<String>,

    /// Proposed reminder time, if the note is time-based
    pub notify_at: Option<DateTime<Utc>>,
}

/// A reminder to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub url: Option<String>,
}

/// Speech-to-text backend
#[async_trait]
pub trait TranscriptionAdapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Transcribe an audio file to text
    async fn transcribe(&self, audio: &Path) -> Result<String, TranscriptionError>;

    /// Health check
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// LLM backend for summaries, tags and embeddings
#[async_trait]
pub trait EnrichmentAdapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Summarize a transcript and pick one tag from `allowed_tags`
    async fn summarize_and_tag(
        &self,
        text: &str,
        allowed_tags: &[String],
    ) -> Result<Enrichment, EnrichmentError>;

    /// Embed text as a fixed-length vector
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EnrichmentError>;

    /// Health check
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Push channel for reminders
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Deliver a reminder to the owner
    async fn notify(&self, owner: OwnerId, notification: &Notification) -> Result<()>;
}
