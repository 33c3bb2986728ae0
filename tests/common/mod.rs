//! Shared fakes for integration tests.
//!
//! The fakes stand in for whisper, Ollama and the reminder dispatcher so the
//! pipeline can be driven deterministically in-process.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};

use scribe::adapters::{
    Enrichment, EnrichmentAdapter, EnrichmentError, TranscriptionAdapter, TranscriptionError,
};
use scribe::core::{
    Database, NoteService, NoteStore, PipelineSettings, ScheduledJob, SchedulingError,
    ServiceSettings, Subscription,
};
use scribe::domain::{EventFrame, NoteId};

pub const TAGS: [&str; 3] = ["Idea", "Todo", "Work"];

/// Transcriber returning scripted results in order, then the fallback
pub struct FakeTranscriber {
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
    pub calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn returning(text: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, result: Result<&str, &str>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(result.map(str::to_string).map_err(str::to_string));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionAdapter for FakeTranscriber {
    fn name(&self) -> &str {
        "fake-transcriber"
    }

    async fn transcribe(&self, _audio: &Path) -> Result<String, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(TranscriptionError::Backend)
    }
}

/// Deterministic summarizer and embedder.
///
/// Summary is `"Summary: <text>"`, tag is the first allowed tag whose name
/// appears in the text (case-insensitive), vectors come from `vectors` or a
/// bag-of-letters fallback.
pub struct FakeEnricher {
    pub vectors: Mutex<HashMap<String, Vec<f32>>>,
    pub summarize_error: Mutex<Option<String>>,
    pub notify_at: Mutex<Option<DateTime<Utc>>>,
    pub delay: Mutex<Duration>,

    /// When set, each summarize call waits for a permit
    pub gate: Mutex<Option<Arc<Semaphore>>>,

    /// Signalled when a summarize call starts
    pub entered: Notify,

    pub summarize_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

impl Default for FakeEnricher {
    fn default() -> Self {
        Self {
            vectors: Mutex::new(HashMap::new()),
            summarize_error: Mutex::new(None),
            notify_at: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            gate: Mutex::new(None),
            entered: Notify::new(),
            summarize_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl FakeEnricher {
    pub fn with_vector(self, text: &str, vector: &[f32]) -> Self {
        self.vectors
            .lock()
            .unwrap()
            .insert(text.to_string(), vector.to_vec());
        self
    }

    /// Make summarize calls wait; returns the semaphore to release them
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_summaries(&self, message: Option<&str>) {
        *self.summarize_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub fn summary_of(text: &str) -> String {
    format!("Summary: {}", text)
}

fn letters_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 8];
    for (i, byte) in text.bytes().enumerate() {
        vector[(byte as usize + i) % 8] += 1.0;
    }
    vector
}

#[async_trait]
impl EnrichmentAdapter for FakeEnricher {
    fn name(&self) -> &str {
        "fake-enricher"
    }

    async fn summarize_and_tag(
        &self,
        text: &str,
        allowed_tags: &[String],
    ) -> Result<Enrichment, EnrichmentError> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        self.seen.lock().unwrap().push(text.to_string());
        self.entered.notify_one();

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = self.summarize_error.lock().unwrap().clone() {
            return Err(EnrichmentError::Parse(message));
        }

        let lowered = text.to_lowercase();
        Ok(Enrichment {
            summary: summary_of(text),
            tag: allowed_tags
                .iter()
                .find(|tag| lowered.contains(&tag.to_lowercase()))
                .cloned(),
            notify_at: *self.notify_at.lock().unwrap(),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EnrichmentError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let known = self.vectors.lock().unwrap().get(text).cloned();
        Ok(known.unwrap_or_else(|| letters_vector(text)))
    }
}

/// Scheduled job that records what fired
#[derive(Default)]
pub struct RecordingJob {
    pub fired: Mutex<Vec<(NoteId, DateTime<Utc>)>>,
    pub notify: Notify,
}

impl RecordingJob {
    pub fn fired_ids(&self) -> Vec<NoteId> {
        self.fired.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    /// Wait until at least `count` jobs fired, or the timeout passes
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.fired.lock().unwrap().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.fired.lock().unwrap().len() >= count;
            }
        }
    }
}

#[async_trait]
impl ScheduledJob for RecordingJob {
    async fn fire(&self, note_id: NoteId) -> Result<(), SchedulingError> {
        self.fired.lock().unwrap().push((note_id, Utc::now()));
        self.notify.notify_waiters();
        Ok(())
    }
}

/// A service over an in-memory database with fake adapters
pub struct Harness {
    pub db: Database,
    pub notes: NoteStore,
    pub service: NoteService,
    pub transcriber: Arc<FakeTranscriber>,
    pub enricher: Arc<FakeEnricher>,
    pub job: Arc<RecordingJob>,
}

pub fn settings() -> ServiceSettings {
    ServiceSettings {
        pipeline: PipelineSettings {
            workers: 4,
            queue_capacity: 16,
            transcription_timeout: Duration::from_secs(5),
            enrichment_timeout: Duration::from_secs(5),
            default_tags: TAGS.iter().map(|t| t.to_string()).collect(),
        },
        subscriber_buffer: 64,
        misfire_grace: Duration::from_secs(60),
    }
}

impl Harness {
    pub fn new(transcriber: FakeTranscriber, enricher: FakeEnricher) -> Self {
        Self::with_settings(transcriber, enricher, settings())
    }

    pub fn with_settings(
        transcriber: FakeTranscriber,
        enricher: FakeEnricher,
        settings: ServiceSettings,
    ) -> Self {
        let db = Database::open_in_memory().unwrap();
        let transcriber = Arc::new(transcriber);
        let enricher = Arc::new(enricher);
        let job = Arc::new(RecordingJob::default());

        let service = NoteService::new(
            db.clone(),
            transcriber.clone(),
            enricher.clone(),
            job.clone(),
            settings,
        );

        Self {
            notes: NoteStore::new(db.clone()),
            db,
            service,
            transcriber,
            enricher,
            job,
        }
    }

    pub fn text_only() -> Self {
        Self::new(FakeTranscriber::failing("no audio expected"), FakeEnricher::default())
    }
}

/// Every frame buffered so far, keep-alives skipped
pub fn drain(subscription: &mut Subscription) -> Vec<EventFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = subscription.try_recv() {
        if !frame.is_keepalive() {
            frames.push(frame);
        }
    }
    frames
}

/// The `status` values of the `note-status` frames for one note
pub fn statuses(frames: &[EventFrame], note_id: NoteId) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f.name() == Some("note-status"))
        .filter_map(|f| serde_json::from_str::<serde_json::Value>(f.data()?).ok())
        .filter(|v| v["note_id"] == note_id)
        .filter_map(|v| v["status"].as_str().map(str::to_string))
        .collect()
}

pub fn count_named(frames: &[EventFrame], name: &str) -> usize {
    frames.iter().filter(|f| f.name() == Some(name)).count()
}

/// A path that exists as far as the fake transcriber cares
pub fn audio_path(name: &str) -> PathBuf {
    PathBuf::from("/recordings").join(name)
}
