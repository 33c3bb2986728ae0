//! Durable note rows.
//!
//! Pipeline writes are compare-and-set on the generation a run started
//! with; they return `false` when an owner action superseded the run.
//! Owner actions bump the generation and take effect immediately.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::db::{decode_time, encode_time, Database, StoreError};
use super::scheduler::{delete_job, persist_job};
use super::vector::VectorStore;
use crate::domain::{
    ArchiveFilter, CompletedNote, Embedding, NewNote, Note, NoteId, NotePage, OwnerId,
    ProcessingStatus,
};

const SELECT_NOTE: &str = "SELECT n.id, n.owner_id, n.raw_transcript, n.summary, n.tag, \
     n.audio_path, n.status, n.error_message, n.notify_at, n.archived, n.generation, \
     n.created_at, n.updated_at, v.embedding \
     FROM notes n LEFT JOIN note_vectors v ON v.note_id = n.id";

/// Note persistence
#[derive(Clone)]
pub struct NoteStore {
    db: Database,
}

impl NoteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new pending note
    pub fn insert(&self, new: &NewNote) -> Result<Note, StoreError> {
        let now = encode_time(Utc::now());
        let id = {
            let conn = self.db.lock()?;
            conn.execute(
                "INSERT INTO notes (owner_id, raw_transcript, audio_path, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    new.owner_id,
                    new.raw_transcript,
                    new.audio_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    ProcessingStatus::Pending.as_str(),
                    now,
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get(id)
    }

    /// Fetch a note regardless of owner
    pub fn get(&self, id: NoteId) -> Result<Note, StoreError> {
        let conn = self.db.lock()?;
        fetch(&conn, id)?.ok_or(StoreError::NotFound(id))
    }

    /// Fetch a note that must belong to `owner`; foreign notes are not found
    pub fn get_owned(&self, id: NoteId, owner: OwnerId) -> Result<Note, StoreError> {
        let conn = self.db.lock()?;
        fetch_owned(&conn, id, owner)
    }

    /// One page of an owner's notes, newest first
    pub fn list(
        &self,
        owner: OwnerId,
        filter: ArchiveFilter,
        offset: usize,
        limit: usize,
    ) -> Result<NotePage, StoreError> {
        let archived_clause = match filter {
            ArchiveFilter::Active => " AND n.archived = 0",
            ArchiveFilter::Archived => " AND n.archived = 1",
            ArchiveFilter::All => "",
        };

        let conn = self.db.lock()?;
        let total: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM notes n WHERE n.owner_id = ?1{}",
                archived_clause
            ),
            params![owner],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE n.owner_id = ?1{} ORDER BY n.created_at DESC, n.id DESC LIMIT ?2 OFFSET ?3",
            SELECT_NOTE, archived_clause
        ))?;
        let notes = stmt
            .query_map(params![owner, limit as i64, offset as i64], note_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NotePage {
            notes,
            total: total as usize,
        })
    }

    /// Move a run to `to`, clearing any previous error
    pub fn transition(
        &self,
        id: NoteId,
        generation: u64,
        to: ProcessingStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE notes SET status = ?1, error_message = NULL, updated_at = ?2
             WHERE id = ?3 AND generation = ?4",
            params![to.as_str(), encode_time(Utc::now()), id, generation as i64],
        )?;
        Ok(changed == 1)
    }

    /// Write the transcript and move to `processing` in one update
    pub fn record_transcript(
        &self,
        id: NoteId,
        generation: u64,
        transcript: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE notes SET raw_transcript = ?1, status = ?2, error_message = NULL, updated_at = ?3
             WHERE id = ?4 AND generation = ?5",
            params![
                transcript,
                ProcessingStatus::Processing.as_str(),
                encode_time(Utc::now()),
                id,
                generation as i64
            ],
        )?;
        Ok(changed == 1)
    }

    /// Write every derived field, the vector and the reminder job atomically
    pub fn complete(
        &self,
        id: NoteId,
        generation: u64,
        result: &CompletedNote,
    ) -> Result<bool, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE notes SET summary = ?1, tag = ?2, notify_at = ?3, status = ?4,
                 error_message = NULL, updated_at = ?5
             WHERE id = ?6 AND generation = ?7",
            params![
                result.summary,
                result.tag,
                result.notify_at.map(encode_time),
                ProcessingStatus::Completed.as_str(),
                encode_time(Utc::now()),
                id,
                generation as i64
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        let owner: OwnerId =
            tx.query_row("SELECT owner_id FROM notes WHERE id = ?1", params![id], |row| {
                row.get(0)
            })?;
        VectorStore::store_with(&tx, id, owner, &result.embedding)?;
        match result.notify_at {
            Some(at) => persist_job(&tx, id, at)?,
            None => delete_job(&tx, id)?,
        };

        tx.commit()?;
        Ok(true)
    }

    /// Mark a run failed with a message
    pub fn fail(&self, id: NoteId, generation: u64, message: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE notes SET status = ?1, error_message = ?2, updated_at = ?3
             WHERE id = ?4 AND generation = ?5",
            params![
                ProcessingStatus::Failed.as_str(),
                message,
                encode_time(Utc::now()),
                id,
                generation as i64
            ],
        )?;
        Ok(changed == 1)
    }

    /// Replace the transcript and reset the note to `pending`.
    ///
    /// Bumps the generation, clears the error and reminder time and drops
    /// the vector and reminder job. Summary and tag stay until the next run
    /// overwrites them.
    pub fn invalidate(
        &self,
        id: NoteId,
        owner: OwnerId,
        transcript: &str,
    ) -> Result<Note, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        fetch_owned(&tx, id, owner)?;

        tx.execute(
            "UPDATE notes SET raw_transcript = ?1, status = ?2, error_message = NULL,
                 notify_at = NULL, generation = generation + 1, updated_at = ?3
             WHERE id = ?4",
            params![
                transcript,
                ProcessingStatus::Pending.as_str(),
                encode_time(Utc::now()),
                id
            ],
        )?;
        tx.execute("DELETE FROM note_vectors WHERE note_id = ?1", params![id])?;
        delete_job(&tx, id)?;

        let note = fetch_owned(&tx, id, owner)?;
        tx.commit()?;
        Ok(note)
    }

    /// Requeue a failed note as `pending`; any other state is rejected.
    ///
    /// The transcript is kept, so a note that was transcribed before it
    /// failed goes straight to `processing` on its next run.
    pub fn begin_retry(&self, id: NoteId, owner: OwnerId) -> Result<Note, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let note = fetch_owned(&tx, id, owner)?;

        if note.status != ProcessingStatus::Failed {
            return Err(StoreError::InvalidTransition {
                id,
                from: note.status,
                action: "retry",
            });
        }

        tx.execute(
            "UPDATE notes SET status = ?1, error_message = NULL, generation = generation + 1,
                 updated_at = ?2
             WHERE id = ?3",
            params![ProcessingStatus::Pending.as_str(), encode_time(Utc::now()), id],
        )?;
        let note = fetch_owned(&tx, id, owner)?;
        tx.commit()?;
        Ok(note)
    }

    pub fn set_tag(
        &self,
        id: NoteId,
        owner: OwnerId,
        tag: Option<&str>,
    ) -> Result<Note, StoreError> {
        self.update_owned(
            id,
            owner,
            "UPDATE notes SET tag = ?1, updated_at = ?2 WHERE id = ?3",
            params![tag, encode_time(Utc::now()), id],
        )
    }

    pub fn set_archived(
        &self,
        id: NoteId,
        owner: OwnerId,
        archived: bool,
    ) -> Result<Note, StoreError> {
        self.update_owned(
            id,
            owner,
            "UPDATE notes SET archived = ?1, updated_at = ?2 WHERE id = ?3",
            params![archived, encode_time(Utc::now()), id],
        )
    }

    /// Delete a note and its vector, returning the removed row
    pub fn delete(&self, id: NoteId, owner: OwnerId) -> Result<Note, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let note = fetch_owned(&tx, id, owner)?;

        tx.execute("DELETE FROM note_vectors WHERE note_id = ?1", params![id])?;
        delete_job(&tx, id)?;
        tx.execute("DELETE FROM notes WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(note)
    }

    /// Notes in `transcribing`/`processing` not updated since `before`
    pub fn stale_in_progress(&self, before: DateTime<Utc>) -> Result<Vec<Note>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE n.status IN ('transcribing', 'processing') AND n.updated_at <= ?1
             ORDER BY n.id",
            SELECT_NOTE
        ))?;
        let notes = stmt
            .query_map(params![encode_time(before)], note_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// Ids of every pending note, oldest first
    pub fn pending_ids(&self) -> Result<Vec<NoteId>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt =
            conn.prepare("SELECT id FROM notes WHERE status = 'pending' ORDER BY created_at, id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// The owner's stored tag set, if one was saved
    pub fn tags_for(&self, owner: OwnerId) -> Result<Option<Vec<String>>, StoreError> {
        let conn = self.db.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT tags FROM owner_tags WHERE owner_id = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    pub fn set_tags(&self, owner: OwnerId, tags: &[String]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(tags)?;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO owner_tags (owner_id, tags) VALUES (?1, ?2)
             ON CONFLICT(owner_id) DO UPDATE SET tags = excluded.tags",
            params![owner, raw],
        )?;
        Ok(())
    }

    fn update_owned(
        &self,
        id: NoteId,
        owner: OwnerId,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Note, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        fetch_owned(&tx, id, owner)?;
        tx.execute(sql, params)?;
        let note = fetch_owned(&tx, id, owner)?;
        tx.commit()?;
        Ok(note)
    }
}

fn fetch(conn: &Connection, id: NoteId) -> Result<Option<Note>, StoreError> {
    let note = conn
        .query_row(
            &format!("{} WHERE n.id = ?1", SELECT_NOTE),
            params![id],
            note_from_row,
        )
        .optional()?;
    Ok(note)
}

fn fetch_owned(conn: &Connection, id: NoteId, owner: OwnerId) -> Result<Note, StoreError> {
    match fetch(conn, id)? {
        Some(note) if note.owner_id == owner => Ok(note),
        _ => Err(StoreError::NotFound(id)),
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_time(&raw).map_err(|e| conversion_error(idx, e))
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<ProcessingStatus>()
        .map_err(|e| conversion_error(6, e))?;

    let notify_at = match row.get::<_, Option<String>>(8)? {
        Some(raw) => Some(decode_time(&raw).map_err(|e| conversion_error(8, e))?),
        None => None,
    };

    let embedding = row
        .get::<_, Option<Vec<u8>>>(13)?
        .and_then(|bytes| Embedding::from_bytes(&bytes));

    Ok(Note {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        raw_transcript: row.get(2)?,
        summary: row.get(3)?,
        tag: row.get(4)?,
        audio_path: row.get::<_, Option<String>>(5)?.map(Into::into),
        status,
        error_message: row.get(7)?,
        notify_at,
        archived: row.get(9)?,
        generation: row.get::<_, i64>(10)? as u64,
        created_at: time_column(row, 11)?,
        updated_at: time_column(row, 12)?,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> NoteStore {
        NoteStore::new(Database::open_in_memory().unwrap())
    }

    fn text_note(owner: OwnerId, text: &str) -> NewNote {
        NewNote {
            owner_id: owner,
            raw_transcript: text.to_string(),
            audio_path: None,
        }
    }

    fn completion() -> CompletedNote {
        CompletedNote {
            summary: "Buy milk".to_string(),
            tag: Some("Todo".to_string()),
            embedding: Embedding::new(vec![1.0, 0.0, 0.0]),
            notify_at: None,
        }
    }

    #[test]
    fn test_insert_starts_pending() {
        let store = store();
        let note = store.insert(&text_note(1, "buy milk")).unwrap();

        assert_eq!(note.status, ProcessingStatus::Pending);
        assert_eq!(note.generation, 0);
        assert!(note.error_message.is_none());
        assert!(!note.has_embedding());
    }

    #[test]
    fn test_foreign_note_is_not_found() {
        let store = store();
        let note = store.insert(&text_note(1, "mine")).unwrap();

        assert!(matches!(
            store.get_owned(note.id, 2),
            Err(StoreError::NotFound(id)) if id == note.id
        ));
        assert!(store.delete(note.id, 2).is_err());
        assert!(store.get(note.id).is_ok());
    }

    #[test]
    fn test_stale_generation_write_is_rejected() {
        let store = store();
        let note = store.insert(&text_note(1, "first")).unwrap();

        let edited = store.invalidate(note.id, 1, "second").unwrap();
        assert_eq!(edited.generation, note.generation + 1);

        assert!(!store
            .transition(note.id, note.generation, ProcessingStatus::Processing)
            .unwrap());
        assert!(!store.complete(note.id, note.generation, &completion()).unwrap());

        let current = store.get(note.id).unwrap();
        assert_eq!(current.status, ProcessingStatus::Pending);
        assert!(!current.has_embedding());
    }

    #[test]
    fn test_complete_then_invalidate_drops_vector() {
        let store = store();
        let note = store.insert(&text_note(1, "buy milk")).unwrap();

        assert!(store.complete(note.id, 0, &completion()).unwrap());
        let done = store.get(note.id).unwrap();
        assert_eq!(done.status, ProcessingStatus::Completed);
        assert!(done.has_embedding());

        let edited = store.invalidate(note.id, 1, "buy oat milk").unwrap();
        assert_eq!(edited.status, ProcessingStatus::Pending);
        assert!(!edited.has_embedding());
        assert_eq!(edited.summary.as_deref(), Some("Buy milk"));
    }

    #[test]
    fn test_fail_sets_message_and_transition_clears_it() {
        let store = store();
        let note = store.insert(&text_note(1, "x")).unwrap();

        assert!(store.fail(note.id, 0, "boom").unwrap());
        let failed = store.get(note.id).unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        assert!(store
            .transition(note.id, 0, ProcessingStatus::Processing)
            .unwrap());
        assert!(store.get(note.id).unwrap().error_message.is_none());
    }

    #[test]
    fn test_retry_only_from_failed() {
        let store = store();
        let note = store.insert(&text_note(1, "x")).unwrap();

        assert!(matches!(
            store.begin_retry(note.id, 1),
            Err(StoreError::InvalidTransition { action: "retry", .. })
        ));

        store.fail(note.id, 0, "boom").unwrap();
        let retried = store.begin_retry(note.id, 1).unwrap();
        assert_eq!(retried.generation, 1);
        assert_eq!(retried.status, ProcessingStatus::Pending);
        assert!(retried.error_message.is_none());
        assert_eq!(store.pending_ids().unwrap(), vec![note.id]);

        // A second retry finds nothing to retry
        assert!(matches!(
            store.begin_retry(note.id, 1),
            Err(StoreError::InvalidTransition { from: ProcessingStatus::Pending, .. })
        ));
    }

    fn job_count(store: &NoteStore, id: NoteId) -> i64 {
        let conn = store.db.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM scheduled_jobs WHERE note_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_reminder_job_follows_note_writes() {
        let store = store();
        let note = store.insert(&text_note(1, "call mum tomorrow")).unwrap();

        let mut with_reminder = completion();
        with_reminder.notify_at = Some(Utc::now() + chrono::Duration::hours(1));
        assert!(store.complete(note.id, 0, &with_reminder).unwrap());
        assert_eq!(job_count(&store, note.id), 1);

        // An edit after completion drops the job with the reminder time
        let edited = store.invalidate(note.id, 1, "call dad").unwrap();
        assert!(edited.notify_at.is_none());
        assert_eq!(job_count(&store, note.id), 0);

        // A superseded completion writes no job
        assert!(!store.complete(note.id, 0, &with_reminder).unwrap());
        assert_eq!(job_count(&store, note.id), 0);

        assert!(store.complete(note.id, 1, &with_reminder).unwrap());
        store.delete(note.id, 1).unwrap();
        assert_eq!(job_count(&store, note.id), 0);
    }

    #[test]
    fn test_list_pages_newest_first() {
        let store = store();
        for i in 0..5 {
            store.insert(&text_note(1, &format!("note {}", i))).unwrap();
        }
        store.insert(&text_note(2, "other owner")).unwrap();
        let archived = store.insert(&text_note(1, "old")).unwrap();
        store.set_archived(archived.id, 1, true).unwrap();

        let page = store.list(1, ArchiveFilter::Active, 0, 2).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.notes.len(), 2);
        assert_eq!(page.notes[0].raw_transcript, "note 4");

        let archived_page = store.list(1, ArchiveFilter::Archived, 0, 10).unwrap();
        assert_eq!(archived_page.total, 1);
        assert_eq!(store.list(1, ArchiveFilter::All, 0, 10).unwrap().total, 6);
    }

    #[test]
    fn test_delete_cascades_vector() {
        let store = store();
        let note = store.insert(&text_note(1, "x")).unwrap();
        store.complete(note.id, 0, &completion()).unwrap();

        store.delete(note.id, 1).unwrap();
        assert!(matches!(store.get(note.id), Err(StoreError::NotFound(_))));

        let conn = store.db.lock().unwrap();
        let vectors: i64 = conn
            .query_row("SELECT COUNT(*) FROM note_vectors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vectors, 0);
    }

    #[test]
    fn test_tags_round_trip() {
        let store = store();
        assert_eq!(store.tags_for(1).unwrap(), None);

        let tags = vec!["Idea".to_string(), "Errand".to_string()];
        store.set_tags(1, &tags).unwrap();
        assert_eq!(store.tags_for(1).unwrap(), Some(tags));
    }
}
