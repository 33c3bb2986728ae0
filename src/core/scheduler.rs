//! Durable one-shot jobs keyed by note id.
//!
//! A note has at most one pending job. Scheduling again replaces it. Jobs
//! are written to `scheduled_jobs` and armed as tokio timers; `restore()`
//! re-arms them after a restart and `sync()` picks up rows written by other
//! processes. The row is the source of truth: a timer fires only if it can
//! still claim its row. The work itself is an injected [`ScheduledJob`]
//! handler.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::db::{decode_time, encode_time, Database, StoreError};
use crate::domain::NoteId;

/// Errors raised while scheduling or firing a job
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Notification dispatch failed: {0}")]
    Dispatch(String),

    #[error("Scheduler is shut down")]
    ShutDown,
}

impl From<rusqlite::Error> for SchedulingError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(err))
    }
}

/// Work performed when a job fires
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn fire(&self, note_id: NoteId) -> Result<(), SchedulingError>;
}

/// Result of [`Scheduler::schedule_at`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A job is armed for this time
    Scheduled(DateTime<Utc>),

    /// The time was not in the future; no job exists for the note
    Skipped,
}

/// What `restore()`/`sync()` did with the persisted jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Future jobs armed
    pub rearmed: usize,

    /// Missed jobs within the grace period, fired immediately
    pub fired: usize,

    /// Missed jobs older than the grace period
    pub dropped: usize,
}

struct Armed {
    token: u64,
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct Inner {
    db: Database,
    handler: Arc<dyn ScheduledJob>,
    misfire_grace: Duration,
    armed: Mutex<HashMap<NoteId, Armed>>,
    next_token: AtomicU64,
    shut_down: AtomicBool,
}

impl Inner {
    fn armed(&self) -> MutexGuard<'_, HashMap<NoteId, Armed>> {
        self.armed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deferred job scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(db: Database, handler: Arc<dyn ScheduledJob>, misfire_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                handler,
                misfire_grace,
                armed: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Schedule `note_id` to fire at `at`, replacing any existing job.
    ///
    /// A time at or before now schedules nothing and cancels the existing
    /// job. Must be called from within a tokio runtime.
    pub fn schedule_at(
        &self,
        note_id: NoteId,
        at: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulingError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulingError::ShutDown);
        }

        if at <= Utc::now() {
            self.cancel(note_id)?;
            debug!(note_id, %at, "Reminder time not in the future; nothing scheduled");
            return Ok(ScheduleOutcome::Skipped);
        }

        {
            let conn = self.inner.db.lock()?;
            persist_job(&conn, note_id, at)?;
        }

        arm(&self.inner, note_id, at);
        info!(note_id, %at, "Reminder scheduled");
        Ok(ScheduleOutcome::Scheduled(at))
    }

    /// Cancel the job for `note_id`; `true` if one existed
    pub fn cancel(&self, note_id: NoteId) -> Result<bool, SchedulingError> {
        let disarmed = self.inner.armed().remove(&note_id).map(|armed| {
            armed.handle.abort();
        });

        let deleted = {
            let conn = self.inner.db.lock()?;
            delete_job(&conn, note_id)?
        };

        let existed = disarmed.is_some() || deleted > 0;
        if existed {
            debug!(note_id, "Reminder cancelled");
        }
        Ok(existed)
    }

    /// When the armed job for `note_id` fires, if there is one
    pub fn scheduled_at(&self, note_id: NoteId) -> Option<DateTime<Utc>> {
        self.inner.armed().get(&note_id).map(|armed| armed.fire_at)
    }

    /// Number of armed jobs
    pub fn armed_count(&self) -> usize {
        self.inner.armed().len()
    }

    /// Arm the timer for the note's persisted job, or disarm it if the
    /// row is gone. Used after the job row was written in another
    /// transaction.
    pub fn refresh(&self, note_id: NoteId) -> Result<Option<DateTime<Utc>>, SchedulingError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulingError::ShutDown);
        }

        let raw: Option<String> = {
            let conn = self.inner.db.lock()?;
            conn.query_row(
                "SELECT fire_at FROM scheduled_jobs WHERE note_id = ?1",
                params![note_id],
                |row| row.get(0),
            )
            .optional()?
        };

        let fire_at = match raw.as_deref().map(decode_time) {
            Some(Ok(at)) => at,
            Some(Err(e)) => {
                warn!(note_id, error = %e, "Dropping job with unreadable fire time");
                if let Some(raw) = &raw {
                    remove_job(&self.inner.db, note_id, raw)?;
                }
                self.disarm(note_id);
                return Ok(None);
            }
            None => {
                self.disarm(note_id);
                return Ok(None);
            }
        };

        if !self.holds(note_id, &encode_time(fire_at)) {
            arm(&self.inner, note_id, fire_at);
            info!(note_id, %fire_at, "Reminder scheduled");
        }
        Ok(Some(fire_at))
    }

    /// Re-arm persisted jobs after a restart
    pub fn restore(&self) -> Result<RestoreSummary, SchedulingError> {
        let summary = self.sync()?;
        info!(
            rearmed = summary.rearmed,
            fired = summary.fired,
            dropped = summary.dropped,
            "Scheduled jobs restored"
        );
        Ok(summary)
    }

    /// Bring the armed timers in line with `scheduled_jobs`.
    ///
    /// Rows this scheduler does not hold are armed, or fired or dropped if
    /// already due, as in `restore()`. Timers whose row was removed or
    /// moved elsewhere are disarmed.
    pub fn sync(&self) -> Result<RestoreSummary, SchedulingError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulingError::ShutDown);
        }

        let rows: Vec<(NoteId, String)> = {
            let conn = self.inner.db.lock()?;
            let mut stmt = conn.prepare("SELECT note_id, fire_at FROM scheduled_jobs")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let persisted: HashSet<NoteId> = rows.iter().map(|(id, _)| *id).collect();
        let orphaned: Vec<NoteId> = self
            .inner
            .armed()
            .keys()
            .filter(|id| !persisted.contains(*id))
            .copied()
            .collect();
        for note_id in orphaned {
            self.disarm(note_id);
        }

        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.inner.misfire_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut summary = RestoreSummary::default();

        for (note_id, raw) in rows {
            let fire_at = match decode_time(&raw) {
                Ok(at) => at,
                Err(e) => {
                    warn!(note_id, error = %e, "Dropping job with unreadable fire time");
                    remove_job(&self.inner.db, note_id, &raw)?;
                    summary.dropped += 1;
                    continue;
                }
            };

            if self.holds(note_id, &raw) {
                continue;
            }

            if fire_at > now {
                summary.rearmed += 1;
            } else if now - fire_at <= grace {
                summary.fired += 1;
            } else {
                warn!(note_id, %fire_at, "Missed reminder is past the grace period; dropping");
                remove_job(&self.inner.db, note_id, &raw)?;
                clear_notify_at(&self.inner.db, note_id, &raw)?;
                summary.dropped += 1;
                continue;
            }
            arm(&self.inner, note_id, fire_at);
        }

        if summary != RestoreSummary::default() {
            debug!(
                rearmed = summary.rearmed,
                fired = summary.fired,
                dropped = summary.dropped,
                "Scheduled jobs synced"
            );
        }
        Ok(summary)
    }

    /// Whether the local timer is armed for this stored fire time
    fn holds(&self, note_id: NoteId, fire_at: &str) -> bool {
        self.inner
            .armed()
            .get(&note_id)
            .is_some_and(|armed| encode_time(armed.fire_at) == fire_at)
    }

    /// Stop the local timer only; the job row is left alone
    fn disarm(&self, note_id: NoteId) {
        if let Some(armed) = self.inner.armed().remove(&note_id) {
            armed.handle.abort();
            debug!(note_id, "Job row gone; timer disarmed");
        }
    }

    /// Stop every timer; persisted jobs are kept for the next `restore()`
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        for (_, armed) in self.inner.armed().drain() {
            armed.handle.abort();
        }
    }
}

/// Start (or replace) the timer task for a note
fn arm(inner: &Arc<Inner>, note_id: NoteId, fire_at: DateTime<Utc>) {
    let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
    let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();

    let mut armed = inner.armed();
    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        run_job(task_inner, note_id, fire_at, token).await;
    });

    if let Some(previous) = armed.insert(
        note_id,
        Armed {
            token,
            fire_at,
            handle,
        },
    ) {
        previous.handle.abort();
    }
}

async fn run_job(inner: Arc<Inner>, note_id: NoteId, fire_at: DateTime<Utc>, token: u64) {
    // A replaced or cancelled job no longer owns the slot
    {
        let mut armed = inner.armed();
        match armed.get(&note_id) {
            Some(current) if current.token == token => {
                armed.remove(&note_id);
            }
            _ => return,
        }
    }

    // Claim the row; whoever deletes it owns the firing
    let raw = encode_time(fire_at);
    match remove_job(&inner.db, note_id, &raw) {
        Ok(true) => {}
        Ok(false) => {
            debug!(note_id, %fire_at, "Job was cancelled or moved; not firing");
            return;
        }
        Err(e) => {
            warn!(note_id, error = %e, "Failed to claim job");
            return;
        }
    }

    info!(note_id, %fire_at, "Firing reminder");
    if let Err(e) = inner.handler.fire(note_id).await {
        error!(note_id, error = %e, "Reminder job failed");
    }

    if let Err(e) = clear_notify_at(&inner.db, note_id, &raw) {
        warn!(note_id, error = %e, "Failed to clear reminder time");
    }
}

/// Upsert the job row for a note
pub(crate) fn persist_job(
    conn: &Connection,
    note_id: NoteId,
    at: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO scheduled_jobs (note_id, fire_at, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(note_id) DO UPDATE SET
             fire_at = excluded.fire_at,
             created_at = excluded.created_at",
        params![note_id, encode_time(at), encode_time(Utc::now())],
    )
}

pub(crate) fn delete_job(conn: &Connection, note_id: NoteId) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM scheduled_jobs WHERE note_id = ?1",
        params![note_id],
    )
}

/// Delete the job row if it still holds this fire time; `true` if it did
fn remove_job(db: &Database, note_id: NoteId, fire_at: &str) -> Result<bool, SchedulingError> {
    let conn = db.lock()?;
    let deleted = conn.execute(
        "DELETE FROM scheduled_jobs WHERE note_id = ?1 AND fire_at = ?2",
        params![note_id, fire_at],
    )?;
    Ok(deleted == 1)
}

/// Clear the note's reminder time if it was not moved since
fn clear_notify_at(db: &Database, note_id: NoteId, fire_at: &str) -> Result<(), SchedulingError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE notes SET notify_at = NULL, updated_at = ?1 WHERE id = ?2 AND notify_at = ?3",
        params![encode_time(Utc::now()), note_id, fire_at],
    )?;
    Ok(())
}
