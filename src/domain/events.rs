//! Event frames pushed to connected clients.
//!
//! Frames are plain text in Server-Sent-Events layout. Delivery is
//! best-effort: an event with no live subscriber is dropped.

use std::fmt;

use serde_json::json;

use super::note::{NoteId, ProcessingStatus};

/// Comment frame sent to every new subscriber before any event
pub const KEEPALIVE_FRAME: &str = ": ping\n\n";

/// Note lifecycle events published to an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEvent {
    /// A note was created
    Created,

    /// A note changed processing state
    Status,

    /// A note finished processing
    Processed,

    /// A note was archived
    Archived,

    /// A note was restored from the archive
    Unarchived,

    /// A note was deleted
    Deleted,
}

impl NoteEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "note-created",
            Self::Status => "note-status",
            Self::Processed => "note-processed",
            Self::Archived => "note-archived",
            Self::Unarchived => "note-unarchived",
            Self::Deleted => "note-deleted",
        }
    }
}

/// Payload of a `note-status` event
pub fn status_payload(note_id: NoteId, status: ProcessingStatus) -> String {
    json!({ "note_id": note_id, "status": status.as_str() }).to_string()
}

/// A single frame delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFrame {
    /// Connection confirmation, carries no event
    KeepAlive,

    /// A named event with a string payload
    Event { name: String, data: String },
}

impl EventFrame {
    pub fn event(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Event {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Event name, `None` for keep-alives
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::KeepAlive => None,
            Self::Event { name, .. } => Some(name),
        }
    }

    /// Event payload, `None` for keep-alives
    pub fn data(&self) -> Option<&str> {
        match self {
            Self::KeepAlive => None,
            Self::Event { data, .. } => Some(data),
        }
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::KeepAlive)
    }

    /// Render as SSE text; each payload line gets its own `data:` field
    pub fn to_sse(&self) -> String {
        match self {
            Self::KeepAlive => KEEPALIVE_FRAME.to_string(),
            Self::Event { name, data } => {
                let mut out = format!("event: {}\n", name);
                if data.is_empty() {
                    out.push_str("data: \n");
                }
                for line in data.lines() {
                    out.push_str("data: ");
                    out.push_str(line);
                    out.push('\n');
                }
                out.push('\n');
                out
            }
        }
    }
}

impl fmt::Display for EventFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sse())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_frame() {
        assert_eq!(EventFrame::KeepAlive.to_sse(), ": ping\n\n");
        assert!(EventFrame::KeepAlive.name().is_none());
    }

    #[test]
    fn test_event_frame_layout() {
        let frame = EventFrame::event(NoteEvent::Processed.name(), "42");
        assert_eq!(frame.to_sse(), "event: note-processed\ndata: 42\n\n");
    }

    #[test]
    fn test_multiline_payload_gets_data_per_line() {
        let frame = EventFrame::event("note-status", "a\nb");
        assert_eq!(frame.to_sse(), "event: note-status\ndata: a\ndata: b\n\n");
    }

    #[test]
    fn test_status_payload() {
        let payload = status_payload(7, ProcessingStatus::Transcribing);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["note_id"], 7);
        assert_eq!(value["status"], "transcribing");
    }
}
