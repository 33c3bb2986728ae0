//! Reminder delivery for scheduled notes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::scheduler::{ScheduledJob, SchedulingError};
use super::store::NoteStore;
use crate::adapters::{Notification, Notifier};
use crate::core::db::StoreError;
use crate::domain::{Note, NoteId};

const PREVIEW_CHARS: usize = 200;

/// Turns a fired job into a push notification for the note's owner
pub struct NotificationDispatcher {
    notes: NoteStore,
    notifier: Arc<dyn Notifier>,
    base_url: String,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        notes: NoteStore,
        notifier: Arc<dyn Notifier>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            notes,
            notifier,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Build the reminder for a note
    pub fn compose(&self, note: &Note) -> Notification {
        let title = match &note.tag {
            Some(tag) => format!("Scribe: {}", tag),
            None => "Scribe Note Reminder".to_string(),
        };

        let message = match note.summary.as_deref().map(str::trim) {
            Some(summary) if !summary.is_empty() => summary.to_string(),
            _ => preview(&note.raw_transcript),
        };

        Notification {
            title,
            message,
            url: Some(format!("{}/web/notes/{}", self.base_url, note.id)),
        }
    }
}

fn preview(transcript: &str) -> String {
    let transcript = transcript.trim();
    if transcript.is_empty() {
        return "New note reminder".to_string();
    }

    match transcript.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &transcript[..idx]),
        None => transcript.to_string(),
    }
}

#[async_trait]
impl ScheduledJob for NotificationDispatcher {
    async fn fire(&self, note_id: NoteId) -> Result<(), SchedulingError> {
        let note = match self.notes.get(note_id) {
            Ok(note) => note,
            Err(StoreError::NotFound(_)) => {
                info!(note_id, "Note is gone; reminder skipped");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let notification = self.compose(&note);
        match tokio::time::timeout(self.timeout, self.notifier.notify(note.owner_id, &notification))
            .await
        {
            Ok(Ok(())) => {
                info!(note_id, notifier = self.notifier.name(), "Reminder delivered");
                Ok(())
            }
            Ok(Err(e)) => Err(SchedulingError::Dispatch(format!("{:#}", e))),
            Err(_) => Err(SchedulingError::Dispatch(format!(
                "{} timed out after {:?}",
                self.notifier.name(),
                self.timeout
            ))),
        }
    }
}
