//! scribe - Voice and text note processing
//!
//! Notes are transcribed, summarized, tagged and embedded by a background
//! pipeline, searchable by meaning, and can carry a reminder that fires
//! later.
//!
//! # Architecture
//!
//! The system is built around a per-note state machine:
//! - Every transition is persisted before the next step starts
//! - Owner edits bump a generation counter; stale runs are discarded
//! - Connected clients receive status changes as event frames
//!
//! # Modules
//!
//! - `adapters`: External systems (whisper, Ollama, Home Assistant)
//! - `core`: Stores, event bus, scheduler, pipeline and service
//! - `domain`: Data structures (Note, ProcessingStatus, EventFrame)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Add a note and wait for its summary
//! scribe add --text "call the plumber tomorrow at 9"
//!
//! # Find related notes
//! scribe search "house repairs"
//!
//! # Process notes and fire reminders in the background
//! scribe run --follow
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{NoteService, ProcessingPipeline, ServiceError};
pub use domain::{Note, NoteId, OwnerId, ProcessingStatus};
