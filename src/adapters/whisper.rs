//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary for transcription.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{TranscriptionAdapter, TranscriptionError};

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
}

/// Transcriber backed by the whisper CLI
pub struct WhisperTranscriber {
    /// Path to the whisper binary
    binary_path: String,

    /// Model name passed to `--model`
    model: String,

    /// Spoken language; whisper detects it when unset
    language: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(
        binary_path: impl Into<String>,
        model: impl Into<String>,
        language: Option<String>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            model: model.into(),
            language,
        }
    }

    async fn run_whisper(&self, audio: &Path) -> anyhow::Result<String> {
        let temp_dir = tempfile::tempdir().context("Failed to create temp dir")?;

        let mut command = Command::new(&self.binary_path);
        command
            .arg(audio)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json");
        if let Some(language) = &self.language {
            command.arg("--language").arg(language);
        }

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("whisper exited with {}: {}", output.status, stderr.trim());
        }

        let stem = audio.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json_content = tokio::fs::read_to_string(&json_path)
            .await
            .context("Failed to read whisper output")?;

        let whisper: WhisperOutput =
            serde_json::from_str(&json_content).context("Failed to parse whisper JSON")?;

        Ok(whisper.text.trim().to_string())
    }
}

#[async_trait]
impl TranscriptionAdapter for WhisperTranscriber {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, audio: &Path) -> Result<String, TranscriptionError> {
        if !audio.exists() {
            return Err(TranscriptionError::MissingAudio(audio.to_path_buf()));
        }

        let text = self
            .run_whisper(audio)
            .await
            .map_err(|e| TranscriptionError::Backend(format!("{:#}", e)))?;

        if text.is_empty() {
            return Err(TranscriptionError::Empty);
        }
        Ok(text)
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let output = Command::new(&self.binary_path)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("whisper health check failed: {}", stderr.trim());
        }
        Ok(())
    }
}
