//! SQLite database shared by the note store, vector store and job store.
//!
//! One connection behind a mutex. Callers hold the lock for a statement or
//! a transaction, never across an external call.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::domain::{NoteId, ProcessingStatus};

/// Errors that can occur with durable storage
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Note not found: {0}")]
    NotFound(NoteId),

    #[error("Cannot {action} note {id} while it is {from}")]
    InvalidTransition {
        id: NoteId,
        from: ProcessingStatus,
        action: &'static str,
    },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database lock poisoned")]
    Poisoned,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id       INTEGER NOT NULL,
    raw_transcript TEXT    NOT NULL DEFAULT '',
    summary        TEXT,
    tag            TEXT,
    audio_path     TEXT,
    status         TEXT    NOT NULL DEFAULT 'pending',
    error_message  TEXT,
    notify_at      TEXT,
    archived       INTEGER NOT NULL DEFAULT 0,
    generation     INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT    NOT NULL,
    updated_at     TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_notes_owner_status  ON notes(owner_id, status);
CREATE INDEX IF NOT EXISTS ix_notes_owner_created ON notes(owner_id, created_at);

CREATE TABLE IF NOT EXISTS note_vectors (
    note_id   INTEGER PRIMARY KEY REFERENCES notes(id) ON DELETE CASCADE,
    owner_id  INTEGER NOT NULL,
    dim       INTEGER NOT NULL,
    embedding BLOB    NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_note_vectors_owner_dim ON note_vectors(owner_id, dim);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    note_id    INTEGER PRIMARY KEY,
    fire_at    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS owner_tags (
    owner_id INTEGER PRIMARY KEY,
    tags     TEXT NOT NULL
);
"#;

/// Shared handle to the scribe database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for a statement or transaction
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Timestamp encoding used in every table (sortable as text)
pub(crate) fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}
