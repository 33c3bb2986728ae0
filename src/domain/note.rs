//! Note records and their processing state.
//!
//! A Note is the unit the pipeline drives through its state machine. The
//! row is the unit of mutation: every change goes through the note store.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Row id of a note
pub type NoteId = i64;

/// Id of the owner (user) a note belongs to
pub type OwnerId = i64;

/// Processing state of a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Created or invalidated, waiting for a pipeline run
    Pending,

    /// Audio is being transcribed
    Transcribing,

    /// Transcript is being summarized, tagged and embedded
    Processing,

    /// All derived fields are present
    Completed,

    /// The last run failed; see `error_message`
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transcribing => "transcribing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// States a pipeline run may start from
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// States that only exist while a run is in flight
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Transcribing | Self::Processing)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown processing status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ProcessingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "transcribing" => Ok(Self::Transcribing),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A fixed-dimension float32 vector.
///
/// Stored as little-endian bytes; the pipeline only cares about its length.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Number of dimensions
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn into_values(self) -> Vec<f32> {
        self.0
    }

    /// Encode as little-endian f32 bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode little-endian f32 bytes; `None` if the length is not a multiple of 4
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self(values))
    }
}

/// A voice or text note
#[derive(Debug, Clone, Serialize)]
pub struct Note {
    pub id: NoteId,
    pub owner_id: OwnerId,

    /// Raw transcript (empty until transcribed for audio notes)
    pub raw_transcript: String,

    /// Short model-generated summary
    pub summary: Option<String>,

    /// Single tag from the owner's tag set
    pub tag: Option<String>,

    /// Source audio file, if the note was recorded
    pub audio_path: Option<PathBuf>,

    /// Present only once the note completed and was not edited since
    #[serde(skip)]
    pub embedding: Option<Embedding>,

    pub status: ProcessingStatus,

    /// Present only when `status` is `Failed`
    pub error_message: Option<String>,

    /// When a reminder for this note should fire
    pub notify_at: Option<DateTime<Utc>>,

    pub archived: bool,

    /// Bumped by owner actions that supersede an in-flight run
    pub generation: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    /// Whether the note needs the transcription step
    pub fn needs_transcription(&self) -> bool {
        self.raw_transcript.trim().is_empty()
    }
}

/// Input for creating a note
#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub owner_id: OwnerId,
    pub raw_transcript: String,
    pub audio_path: Option<PathBuf>,
}

/// Derived fields written when a run completes
#[derive(Debug, Clone)]
pub struct CompletedNote {
    pub summary: String,
    pub tag: Option<String>,
    pub embedding: Embedding,
    pub notify_at: Option<DateTime<Utc>>,
}

/// Which notes a listing includes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFilter {
    /// Only notes that are not archived
    #[default]
    Active,

    /// Everything
    All,

    /// Only archived notes
    Archived,
}

/// One page of a note listing
#[derive(Debug, Clone, Serialize)]
pub struct NotePage {
    pub notes: Vec<Note>,
    pub total: usize,
}
