//! Domain types for scribe.
//!
//! This module contains the core data structures:
//! - Note: the record driven through the processing state machine
//! - Events: frames pushed to connected clients

pub mod events;
pub mod note;

// Re-export commonly used types
pub use events::{status_payload, EventFrame, NoteEvent, KEEPALIVE_FRAME};
pub use note::{
    ArchiveFilter, CompletedNote, Embedding, NewNote, Note, NoteId, NotePage, OwnerId,
    ProcessingStatus, UnknownStatus,
};
