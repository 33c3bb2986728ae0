//! Note processing pipeline.
//!
//! Drives a note through `pending -> [transcribing ->] processing ->
//! completed | failed`. Every transition is persisted and published before
//! the next step starts.
//!
//! Concurrency rules:
//! - A bounded worker pool takes note ids from one bounded queue
//! - A note has at most one run queued or executing; a second request sets
//!   a rerun flag and the active run goes again once it finishes
//! - Owner edits bump the note's generation; a run whose conditional write
//!   matches no row has been superseded and stops without publishing

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::db::StoreError;
use super::event_bus::EventBus;
use super::scheduler::Scheduler;
use super::store::NoteStore;
use crate::adapters::{
    EnrichmentAdapter, EnrichmentError, TranscriptionAdapter, TranscriptionError,
};
use crate::domain::{
    status_payload, CompletedNote, Embedding, Note, NoteEvent, NoteId, OwnerId, ProcessingStatus,
};

/// Message for a note that has nothing to process
pub const NOTHING_TO_PROCESS: &str = "No audio file or transcript available";

/// Message written by the reconciliation sweep
pub const INTERRUPTED: &str = "Processing interrupted; retry to resume";

/// Default tag set for owners who never saved their own
pub const DEFAULT_TAGS: [&str; 5] = ["Idea", "Todo", "Work", "Personal", "Reference"];

/// Errors raised by the pipeline itself (adapter errors become `failed`)
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Processing queue is closed")]
    QueueClosed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Concurrent runs
    pub workers: usize,

    /// Queued note ids before `submit` waits
    pub queue_capacity: usize,

    pub transcription_timeout: Duration,
    pub enrichment_timeout: Duration,

    /// Tags offered to the model when the owner has no saved set
    pub default_tags: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            transcription_timeout: Duration::from_secs(300),
            enrichment_timeout: Duration::from_secs(120),
            default_tags: DEFAULT_TAGS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Result of [`ProcessingPipeline::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Queued for a worker
    Queued,

    /// Already queued or running; it will run again afterwards
    Coalesced,
}

/// How a single run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,

    /// The note is now `failed` with this message
    Failed(String),

    /// An owner action bumped the generation mid-run; results discarded
    Superseded,

    /// The note was not in a runnable state
    Skipped(ProcessingStatus),

    /// The note no longer exists
    Missing,

    /// Another run owns the note; it will run again afterwards
    Coalesced,
}

struct Inner {
    notes: NoteStore,
    transcriber: Arc<dyn TranscriptionAdapter>,
    enricher: Arc<dyn EnrichmentAdapter>,
    events: EventBus,
    scheduler: Scheduler,
    settings: PipelineSettings,

    /// Notes queued or running, with their rerun flag
    in_flight: Mutex<HashMap<NoteId, bool>>,
    idle: Notify,
    queue: Mutex<Option<mpsc::Sender<NoteId>>>,
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<NoteId, bool>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, Option<mpsc::Sender<NoteId>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a note in flight; if it already is, ask for a rerun instead
    fn claim(&self, note_id: NoteId) -> bool {
        let mut in_flight = self.in_flight();
        match in_flight.get_mut(&note_id) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                in_flight.insert(note_id, false);
                true
            }
        }
    }

    /// Consume a pending rerun, or release the note if there is none
    fn take_rerun(&self, note_id: NoteId) -> bool {
        let mut in_flight = self.in_flight();
        match in_flight.get_mut(&note_id) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                in_flight.remove(&note_id);
                if in_flight.is_empty() {
                    self.idle.notify_waiters();
                }
                false
            }
        }
    }

    fn release(&self, note_id: NoteId) {
        let mut in_flight = self.in_flight();
        in_flight.remove(&note_id);
        if in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Releases a claim if the holder bails out early
struct ClaimGuard<'a> {
    inner: &'a Inner,
    note_id: NoteId,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(inner: &'a Inner, note_id: NoteId) -> Self {
        Self {
            inner,
            note_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(self.note_id);
        }
    }
}

/// The note state machine and its worker pool
#[derive(Clone)]
pub struct ProcessingPipeline {
    inner: Arc<Inner>,
}

impl ProcessingPipeline {
    pub fn new(
        notes: NoteStore,
        transcriber: Arc<dyn TranscriptionAdapter>,
        enricher: Arc<dyn EnrichmentAdapter>,
        events: EventBus,
        scheduler: Scheduler,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                notes,
                transcriber,
                enricher,
                events,
                scheduler,
                settings,
                in_flight: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                queue: Mutex::new(None),
            }),
        }
    }

    /// Spawn the worker pool
    pub fn start(&self) -> Result<WorkerPool, PipelineError> {
        let mut queue = self.inner.queue();
        if queue.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(self.inner.settings.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let size = self.inner.settings.workers.max(1);

        let workers = (0..size)
            .map(|worker| {
                let pipeline = self.clone();
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(note_id) = next else { break };
                        if let Err(e) = pipeline.drive(note_id).await {
                            error!(worker, note_id, error = %e, "Pipeline run failed");
                        }
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        *queue = Some(tx);
        info!(workers = size, "Processing pipeline started");

        Ok(WorkerPool {
            pipeline: self.clone(),
            workers,
        })
    }

    /// Queue a note for processing.
    ///
    /// Waits while the queue is full. A note that is already queued or
    /// running is not queued twice; it is rerun once the current run ends.
    pub async fn submit(&self, note_id: NoteId) -> Result<Submission, PipelineError> {
        let sender = self
            .inner
            .queue()
            .clone()
            .ok_or(PipelineError::NotRunning)?;

        if !self.inner.claim(note_id) {
            debug!(note_id, "Note already in flight; rerun requested");
            return Ok(Submission::Coalesced);
        }

        let guard = ClaimGuard::new(&self.inner, note_id);
        sender
            .send(note_id)
            .await
            .map_err(|_| PipelineError::QueueClosed)?;
        guard.disarm();

        Ok(Submission::Queued)
    }

    /// Process a note inline, under the same single-run guard as the pool
    pub async fn run(&self, note_id: NoteId) -> Result<RunOutcome, PipelineError> {
        if !self.inner.claim(note_id) {
            return Ok(RunOutcome::Coalesced);
        }
        self.drive(note_id).await
    }

    /// Reset a note to `pending` with a new transcript.
    ///
    /// This is the only way an owner edit reaches a note's processing
    /// state. Any run in flight is superseded and any reminder cancelled.
    pub fn invalidate(
        &self,
        owner: OwnerId,
        note_id: NoteId,
        transcript: &str,
    ) -> Result<Note, PipelineError> {
        let note = self.inner.notes.invalidate(note_id, owner, transcript)?;

        if let Err(e) = self.inner.scheduler.cancel(note_id) {
            warn!(note_id, error = %e, "Failed to cancel reminder for edited note");
        }
        self.publish_status(&note, ProcessingStatus::Pending);
        info!(note_id, generation = note.generation, "Note invalidated");
        Ok(note)
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Whether a note is queued or running
    pub fn is_in_flight(&self, note_id: NoteId) -> bool {
        self.inner.in_flight().contains_key(&note_id)
    }

    /// Fail notes stuck in `transcribing`/`processing` for at least
    /// `stale_after` that no run here owns
    pub fn reconcile(&self, stale_after: Duration) -> Result<usize, PipelineError> {
        let stale_after =
            chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self.inner.notes.stale_in_progress(Utc::now() - stale_after)?;

        let mut failed = 0;
        for note in stale {
            if !note.status.is_in_progress() || self.is_in_flight(note.id) {
                continue;
            }
            if self.inner.notes.fail(note.id, note.generation, INTERRUPTED)? {
                warn!(note_id = note.id, status = %note.status, "Interrupted run marked failed");
                self.publish_status(&note, ProcessingStatus::Failed);
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Run a claimed note, repeating while reruns were requested
    async fn drive(&self, note_id: NoteId) -> Result<RunOutcome, PipelineError> {
        let guard = ClaimGuard::new(&self.inner, note_id);
        loop {
            let outcome = self.process(note_id).await;
            if let Err(e) = &outcome {
                error!(note_id, error = %e, "Run aborted");
            }
            if !self.inner.take_rerun(note_id) {
                guard.disarm();
                return outcome;
            }
            debug!(note_id, "Rerunning note");
        }
    }

    #[instrument(skip(self), fields(owner = tracing::field::Empty))]
    async fn process(&self, note_id: NoteId) -> Result<RunOutcome, PipelineError> {
        let note = match self.inner.notes.get(note_id) {
            Ok(note) => note,
            Err(StoreError::NotFound(_)) => return Ok(RunOutcome::Missing),
            Err(e) => return Err(e.into()),
        };
        tracing::Span::current().record("owner", note.owner_id);

        if !note.status.is_runnable() {
            debug!(status = %note.status, "Note not runnable; skipping");
            return Ok(RunOutcome::Skipped(note.status));
        }

        let transcript = if note.needs_transcription() {
            let Some(audio) = note.audio_path.clone() else {
                return self.fail(&note, NOTHING_TO_PROCESS.to_string());
            };
            if !self.transition(&note, ProcessingStatus::Transcribing)? {
                return Ok(RunOutcome::Superseded);
            }

            let timeout = self.inner.settings.transcription_timeout;
            let result = tokio::time::timeout(timeout, self.inner.transcriber.transcribe(&audio))
                .await
                .unwrap_or(Err(TranscriptionError::Timeout(timeout)))
                .and_then(|text| {
                    let text = text.trim().to_string();
                    if text.is_empty() {
                        Err(TranscriptionError::Empty)
                    } else {
                        Ok(text)
                    }
                });

            let text = match result {
                Ok(text) => text,
                Err(e) => return self.fail(&note, e.to_string()),
            };
            if !self
                .inner
                .notes
                .record_transcript(note.id, note.generation, &text)?
            {
                return Ok(RunOutcome::Superseded);
            }
            self.publish_status(&note, ProcessingStatus::Processing);
            text
        } else {
            if !self.transition(&note, ProcessingStatus::Processing)? {
                return Ok(RunOutcome::Superseded);
            }
            note.raw_transcript.clone()
        };

        let tags = match self.inner.notes.tags_for(note.owner_id)? {
            Some(tags) => tags,
            None => self.inner.settings.default_tags.clone(),
        };

        let completed = match self.enrich(&transcript, &tags).await {
            Ok(completed) => completed,
            Err(e) => return self.fail(&note, e.to_string()),
        };

        if !self
            .inner
            .notes
            .complete(note.id, note.generation, &completed)?
        {
            return Ok(RunOutcome::Superseded);
        }
        self.publish_status(&note, ProcessingStatus::Completed);
        self.inner
            .events
            .publish(note.owner_id, NoteEvent::Processed, &note.id.to_string());

        self.update_reminder(note.id);
        info!(tag = ?completed.tag, "Note processed");
        Ok(RunOutcome::Completed)
    }

    /// Summarize, tag and embed; nothing is written here
    async fn enrich(
        &self,
        transcript: &str,
        tags: &[String],
    ) -> Result<CompletedNote, EnrichmentError> {
        let timeout = self.inner.settings.enrichment_timeout;

        let enrichment = tokio::time::timeout(
            timeout,
            self.inner.enricher.summarize_and_tag(transcript, tags),
        )
        .await
        .unwrap_or(Err(EnrichmentError::Timeout(timeout)))?;

        let vector = tokio::time::timeout(timeout, self.inner.enricher.embed(transcript))
            .await
            .unwrap_or(Err(EnrichmentError::Timeout(timeout)))?;
        if vector.is_empty() {
            return Err(EnrichmentError::EmptyEmbedding);
        }

        Ok(CompletedNote {
            summary: enrichment.summary,
            tag: enrichment.tag,
            embedding: Embedding::new(vector),
            notify_at: enrichment.notify_at.filter(|at| *at > Utc::now()),
        })
    }

    /// Arm or disarm the local timer from the job row `complete` wrote.
    ///
    /// An edit that landed after completion already removed the row, so a
    /// superseded reminder is never armed.
    fn update_reminder(&self, note_id: NoteId) {
        if let Err(e) = self.inner.scheduler.refresh(note_id) {
            warn!(note_id, error = %e, "Failed to update reminder");
        }
    }

    /// Persist a status change for the run's generation and publish it
    fn transition(&self, note: &Note, to: ProcessingStatus) -> Result<bool, PipelineError> {
        let applied = self
            .inner
            .notes
            .transition(note.id, note.generation, to)?;
        if applied {
            self.publish_status(note, to);
        }
        Ok(applied)
    }

    fn fail(&self, note: &Note, message: String) -> Result<RunOutcome, PipelineError> {
        if !self.inner.notes.fail(note.id, note.generation, &message)? {
            return Ok(RunOutcome::Superseded);
        }
        warn!(note_id = note.id, error = %message, "Note processing failed");
        self.publish_status(note, ProcessingStatus::Failed);
        Ok(RunOutcome::Failed(message))
    }

    fn publish_status(&self, note: &Note, status: ProcessingStatus) {
        self.inner.events.publish(
            note.owner_id,
            NoteEvent::Status,
            &status_payload(note.id, status),
        );
    }
}

/// Handle to the running workers
pub struct WorkerPool {
    pipeline: ProcessingPipeline,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue, let workers drain it, and wait for them
    pub async fn shutdown(self) {
        self.pipeline.inner.queue().take();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker panicked");
            }
        }
        info!("Processing pipeline stopped");
    }
}
