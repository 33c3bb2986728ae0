//! The interface callers use: create, edit, retry, search and subscribe.
//!
//! Every operation is scoped to an owner. A note id that belongs to someone
//! else behaves exactly like one that does not exist.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::db::{Database, StoreError};
use super::event_bus::{EventBus, Subscription};
use super::pipeline::{PipelineError, PipelineSettings, ProcessingPipeline, WorkerPool};
use super::scheduler::{RestoreSummary, ScheduledJob, Scheduler, SchedulingError};
use super::store::NoteStore;
use super::vector::VectorStore;
use crate::adapters::{EnrichmentAdapter, EnrichmentError, TranscriptionAdapter};
use crate::domain::{
    status_payload, ArchiveFilter, NewNote, Note, NoteEvent, NoteId, NotePage, OwnerId,
    ProcessingStatus,
};

/// Errors returned to callers of [`NoteService`]
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Note not found: {0}")]
    NotFound(NoteId),

    #[error("Cannot {action} note {id} while it is {status}")]
    InvalidState {
        id: NoteId,
        status: ProcessingStatus,
        action: &'static str,
    },

    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding failed: {0}")]
    Enrichment(#[from] EnrichmentError),

    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("Pipeline error: {0}")]
    Pipeline(PipelineError),

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::InvalidTransition { id, from, action } => Self::InvalidState {
                id,
                status: from,
                action,
            },
            other => Self::Store(other),
        }
    }
}

impl From<PipelineError> for ServiceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Store(e) => e.into(),
            other => Self::Pipeline(other),
        }
    }
}

/// What to find neighbours of
#[derive(Debug, Clone)]
pub enum SimilarTo {
    /// Free text, embedded on the fly
    Text(String),

    /// An existing note, which is excluded from the results
    Note(NoteId),
}

/// A search hit with its note
#[derive(Debug, Clone, Serialize)]
pub struct SimilarNote {
    pub note: Note,
    pub distance: f32,
}

/// Operations that can be applied to many notes at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Archive,
    Unarchive,
    Delete,
    Retry,
}

/// Per-note results of a bulk action
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub succeeded: Vec<NoteId>,
    pub failed: Vec<(NoteId, String)>,
}

/// What `recover()` or a `sweep()` did
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Notes left mid-run by an earlier process, now failed
    pub interrupted: usize,

    /// Pending notes handed back to the pipeline
    pub resubmitted: usize,

    pub reminders: RestoreSummary,
}

/// Service tuning
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub pipeline: PipelineSettings,

    /// Frames buffered per event subscriber
    pub subscriber_buffer: usize,

    /// How late a missed reminder may still fire after a restart
    pub misfire_grace: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineSettings::default(),
            subscriber_buffer: 64,
            misfire_grace: Duration::from_secs(3600),
        }
    }
}

/// Owner-facing note operations
pub struct NoteService {
    notes: NoteStore,
    vectors: VectorStore,
    events: EventBus,
    scheduler: Scheduler,
    pipeline: ProcessingPipeline,
    enricher: Arc<dyn EnrichmentAdapter>,
    settings: ServiceSettings,
}

impl NoteService {
    /// Wire the stores, bus, scheduler and pipeline over one database
    pub fn new(
        db: Database,
        transcriber: Arc<dyn TranscriptionAdapter>,
        enricher: Arc<dyn EnrichmentAdapter>,
        reminder: Arc<dyn ScheduledJob>,
        settings: ServiceSettings,
    ) -> Self {
        let notes = NoteStore::new(db.clone());
        let vectors = VectorStore::new(db.clone());
        let events = EventBus::new(settings.subscriber_buffer);
        let scheduler = Scheduler::new(db, reminder, settings.misfire_grace);
        let pipeline = ProcessingPipeline::new(
            notes.clone(),
            transcriber,
            Arc::clone(&enricher),
            events.clone(),
            scheduler.clone(),
            settings.pipeline.clone(),
        );

        Self {
            notes,
            vectors,
            events,
            scheduler,
            pipeline,
            enricher,
            settings,
        }
    }

    pub fn pipeline(&self) -> &ProcessingPipeline {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start the worker pool
    pub fn start(&self) -> Result<WorkerPool, ServiceError> {
        Ok(self.pipeline.start()?)
    }

    /// Create a pending note and hand it to the pipeline
    pub async fn create_note(
        &self,
        owner: OwnerId,
        transcript: Option<String>,
        audio: Option<PathBuf>,
    ) -> Result<Note, ServiceError> {
        let note = self.notes.insert(&NewNote {
            owner_id: owner,
            raw_transcript: transcript.unwrap_or_default().trim().to_string(),
            audio_path: audio,
        })?;
        info!(owner, note_id = note.id, "Note created");

        self.events
            .publish(owner, NoteEvent::Created, &note.id.to_string());
        self.enqueue(note.id).await?;
        Ok(note)
    }

    /// Requeue a failed note as `pending` and hand it to the pipeline
    pub async fn retry(&self, owner: OwnerId, id: NoteId) -> Result<Note, ServiceError> {
        let note = self.notes.begin_retry(id, owner)?;
        info!(owner, note_id = id, "Retry requested");
        self.events.publish(
            owner,
            NoteEvent::Status,
            &status_payload(id, ProcessingStatus::Pending),
        );
        self.enqueue(id).await?;
        Ok(note)
    }

    /// Replace the transcript and reprocess from scratch
    pub async fn edit_transcript(
        &self,
        owner: OwnerId,
        id: NoteId,
        text: &str,
    ) -> Result<Note, ServiceError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ServiceError::InvalidInput(
                "transcript cannot be empty".to_string(),
            ));
        }

        let note = self.pipeline.invalidate(owner, id, text)?;
        self.enqueue(id).await?;
        Ok(note)
    }

    /// Set or clear the tag without reprocessing
    pub fn set_tag(
        &self,
        owner: OwnerId,
        id: NoteId,
        tag: Option<&str>,
    ) -> Result<Note, ServiceError> {
        let tag = match tag.map(str::trim).filter(|t| !t.is_empty()) {
            Some(tag) => Some(
                self.tags(owner)?
                    .into_iter()
                    .find(|known| known.eq_ignore_ascii_case(tag))
                    .ok_or_else(|| ServiceError::UnknownTag(tag.to_string()))?,
            ),
            None => None,
        };
        Ok(self.notes.set_tag(id, owner, tag.as_deref())?)
    }

    pub fn archive(&self, owner: OwnerId, id: NoteId) -> Result<Note, ServiceError> {
        let note = self.notes.set_archived(id, owner, true)?;
        self.events
            .publish(owner, NoteEvent::Archived, &id.to_string());
        Ok(note)
    }

    pub fn unarchive(&self, owner: OwnerId, id: NoteId) -> Result<Note, ServiceError> {
        let note = self.notes.set_archived(id, owner, false)?;
        self.events
            .publish(owner, NoteEvent::Unarchived, &id.to_string());
        Ok(note)
    }

    /// Delete a note, its vector, its reminder and its audio file
    pub async fn delete(&self, owner: OwnerId, id: NoteId) -> Result<(), ServiceError> {
        // Ownership check before touching the reminder
        self.notes.get_owned(id, owner)?;
        if let Err(e) = self.scheduler.cancel(id) {
            warn!(note_id = id, error = %e, "Failed to cancel reminder for deleted note");
        }

        let note = self.notes.delete(id, owner)?;
        self.events.publish(owner, NoteEvent::Deleted, &id.to_string());
        info!(owner, note_id = id, "Note deleted");

        if let Some(audio) = &note.audio_path {
            match tokio::fs::remove_file(audio).await {
                Ok(()) => debug!(path = %audio.display(), "Audio removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %audio.display(), error = %e, "Failed to remove audio"),
            }
        }
        Ok(())
    }

    /// Apply one action to many notes; failures are reported per note
    pub async fn bulk(&self, owner: OwnerId, ids: &[NoteId], action: BulkAction) -> BulkReport {
        let mut report = BulkReport::default();
        for &id in ids {
            let result = match action {
                BulkAction::Archive => self.archive(owner, id).map(|_| ()),
                BulkAction::Unarchive => self.unarchive(owner, id).map(|_| ()),
                BulkAction::Delete => self.delete(owner, id).await,
                BulkAction::Retry => self.retry(owner, id).await.map(|_| ()),
            };
            match result {
                Ok(()) => report.succeeded.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        report
    }

    pub fn get(&self, owner: OwnerId, id: NoteId) -> Result<Note, ServiceError> {
        Ok(self.notes.get_owned(id, owner)?)
    }

    /// A page of notes, newest first
    pub fn list(
        &self,
        owner: OwnerId,
        filter: ArchiveFilter,
        offset: usize,
        limit: usize,
    ) -> Result<NotePage, ServiceError> {
        Ok(self.notes.list(owner, filter, offset, limit)?)
    }

    /// Nearest notes by meaning, nearest first
    pub async fn search_similar(
        &self,
        owner: OwnerId,
        target: SimilarTo,
        limit: usize,
    ) -> Result<Vec<SimilarNote>, ServiceError> {
        let (vector, exclude) = match target {
            SimilarTo::Text(query) => {
                let query = query.trim();
                if query.is_empty() {
                    return Err(ServiceError::InvalidInput(
                        "search text cannot be empty".to_string(),
                    ));
                }
                let timeout = self.settings.pipeline.enrichment_timeout;
                let vector = tokio::time::timeout(timeout, self.enricher.embed(query))
                    .await
                    .unwrap_or(Err(EnrichmentError::Timeout(timeout)))?;
                (vector, Vec::new())
            }
            SimilarTo::Note(id) => {
                let note = self.notes.get_owned(id, owner)?;
                match note.embedding {
                    Some(embedding) => (embedding.into_values(), vec![id]),
                    None => return Ok(Vec::new()),
                }
            }
        };

        let neighbors = self.vectors.query(owner, &vector, limit, &exclude)?;
        let mut results = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match self.notes.get_owned(neighbor.note_id, owner) {
                Ok(note) => results.push(SimilarNote {
                    note,
                    distance: neighbor.distance,
                }),
                // Deleted between the query and the lookup
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(results)
    }

    /// Live event stream for an owner
    pub fn subscribe_events(&self, owner: OwnerId) -> Subscription {
        self.events.subscribe(owner)
    }

    /// The owner's tag set, or the defaults if none was saved
    pub fn tags(&self, owner: OwnerId) -> Result<Vec<String>, ServiceError> {
        Ok(self
            .notes
            .tags_for(owner)?
            .unwrap_or_else(|| self.settings.pipeline.default_tags.clone()))
    }

    /// Replace the owner's tag set; blanks and case-insensitive duplicates are dropped
    pub fn set_tags(&self, owner: OwnerId, tags: &[String]) -> Result<Vec<String>, ServiceError> {
        let mut cleaned: Vec<String> = Vec::new();
        for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !cleaned.iter().any(|known| known.eq_ignore_ascii_case(tag)) {
                cleaned.push(tag.to_string());
            }
        }
        if cleaned.is_empty() {
            return Err(ServiceError::InvalidInput(
                "tag set cannot be empty".to_string(),
            ));
        }

        self.notes.set_tags(owner, &cleaned)?;
        Ok(cleaned)
    }

    /// Startup recovery: fail interrupted runs, resubmit pending notes,
    /// re-arm reminders
    pub async fn recover(&self) -> Result<RecoveryReport, ServiceError> {
        let report = self.sweep(Duration::ZERO).await?;
        info!(
            interrupted = report.interrupted,
            resubmitted = report.resubmitted,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Periodic catch-up for work written by other processes on the same
    /// database: fail runs stale for `stale_after`, submit pending notes
    /// not already in flight, arm reminder rows not yet held
    pub async fn sweep(&self, stale_after: Duration) -> Result<RecoveryReport, ServiceError> {
        let interrupted = self.pipeline.reconcile(stale_after)?;

        let mut resubmitted = 0;
        for id in self.notes.pending_ids()? {
            if self.pipeline.is_in_flight(id) {
                continue;
            }
            self.enqueue(id).await?;
            resubmitted += 1;
        }

        let reminders = self.scheduler.sync()?;
        Ok(RecoveryReport {
            interrupted,
            resubmitted,
            reminders,
        })
    }

    /// Submit to the pool; without a running pool the note stays pending
    async fn enqueue(&self, id: NoteId) -> Result<(), ServiceError> {
        match self.pipeline.submit(id).await {
            Ok(_) => Ok(()),
            Err(PipelineError::NotRunning) => {
                debug!(note_id = id, "Worker pool not running; note left pending");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
