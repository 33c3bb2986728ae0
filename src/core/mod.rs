//! Core note processing.
//!
//! This module contains:
//! - Database: The SQLite file behind every store
//! - NoteStore: Generation-guarded note rows
//! - VectorStore: Per-note vectors and cosine k-NN
//! - EventBus: Per-owner fan-out of event frames
//! - Scheduler: Durable one-shot reminder jobs
//! - ProcessingPipeline: The note state machine and worker pool
//! - NoteService: The operations callers use

pub mod db;
pub mod event_bus;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod vector;

// Re-export commonly used types
pub use db::{Database, StoreError};
pub use event_bus::{EventBus, Subscription};
pub use notify::NotificationDispatcher;
pub use pipeline::{
    PipelineError, PipelineSettings, ProcessingPipeline, RunOutcome, Submission, WorkerPool,
    DEFAULT_TAGS,
};
pub use scheduler::{
    RestoreSummary, ScheduleOutcome, ScheduledJob, Scheduler, SchedulingError,
};
pub use service::{
    BulkAction, BulkReport, NoteService, RecoveryReport, ServiceError, ServiceSettings,
    SimilarNote, SimilarTo,
};
pub use store::NoteStore;
pub use vector::{cosine_distance, Neighbor, VectorStore};
