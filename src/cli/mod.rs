//! Command-line interface for scribe.
//!
//! Provides commands for adding notes, editing and retrying them, searching
//! by meaning, and running the worker pool and reminder scheduler.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::adapters::{
    EnrichmentAdapter, HomeAssistantNotifier, LogNotifier, Notifier, OllamaClient,
    TranscriptionAdapter, WhisperTranscriber,
};
use crate::config::{self, paths, ResolvedConfig};
use crate::core::{
    BulkAction, BulkReport, Database, NoteService, NoteStore, NotificationDispatcher,
    ServiceError, SimilarNote, SimilarTo, Subscription,
};
use crate::domain::{ArchiveFilter, Note, NoteId, OwnerId};

/// scribe - Voice and text notes with summaries, tags and semantic search
#[derive(Parser, Debug)]
#[command(name = "scribe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Owner whose notes to work on
    #[arg(long, env = "SCRIBE_OWNER", default_value = "1", global = true)]
    pub owner: OwnerId,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a note and wait for it to be processed
    Add {
        /// Note text
        #[arg(short, long, conflicts_with = "audio")]
        text: Option<String>,

        /// Audio recording to transcribe (copied into the audio directory)
        #[arg(short, long)]
        audio: Option<PathBuf>,

        /// Leave the note pending for `scribe run`
        #[arg(long)]
        no_wait: bool,
    },

    /// Retry a failed note
    Retry {
        /// Note ID
        id: NoteId,
    },

    /// Replace a note's transcript and reprocess it
    Edit {
        /// Note ID
        id: NoteId,

        /// New transcript
        text: String,
    },

    /// Set or clear a note's tag
    Tag {
        /// Note ID
        id: NoteId,

        /// Tag from the owner's tag set (omit to clear)
        tag: Option<String>,
    },

    /// Archive notes
    Archive {
        /// Note IDs
        #[arg(required = true)]
        ids: Vec<NoteId>,
    },

    /// Restore archived notes
    Unarchive {
        /// Note IDs
        #[arg(required = true)]
        ids: Vec<NoteId>,
    },

    /// Delete notes, their vectors, reminders and audio
    Delete {
        /// Note IDs
        #[arg(required = true)]
        ids: Vec<NoteId>,
    },

    /// Show a note
    Show {
        /// Note ID
        id: NoteId,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List notes, newest first
    List {
        /// Only archived notes
        #[arg(long, conflicts_with = "all")]
        archived: bool,

        /// Archived and active notes
        #[arg(long)]
        all: bool,

        /// Maximum number of notes to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Notes to skip
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Find notes similar in meaning to some text
    Search {
        /// Search text
        query: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Find notes similar to an existing note
    Similar {
        /// Note ID
        id: NoteId,

        /// Maximum number of results
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// Show or replace the owner's tag set
    Tags {
        /// New tag set (comma-separated)
        #[arg(long)]
        set: Option<String>,
    },

    /// Recover, then process notes and fire reminders until Ctrl-C
    Run {
        /// Print every event for the owner
        #[arg(short, long)]
        follow: bool,
    },

    /// Show resolved configuration (debug)
    Config,

    /// Check that whisper and Ollama are reachable
    Health,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let owner = self.owner;
        match self.command {
            Commands::Add {
                text,
                audio,
                no_wait,
            } => add_note(owner, text, audio, no_wait).await,
            Commands::Retry { id } => {
                let service = open_service()?;
                follow_while(&service, owner, async {
                    service.retry(owner, id).await.map(|_| ())
                })
                .await?;
                print_note(&service.get(owner, id)?);
                Ok(())
            }
            Commands::Edit { id, text } => {
                let service = open_service()?;
                follow_while(&service, owner, async {
                    service.edit_transcript(owner, id, &text).await.map(|_| ())
                })
                .await?;
                print_note(&service.get(owner, id)?);
                Ok(())
            }
            Commands::Tag { id, tag } => {
                let service = open_service()?;
                let note = service.set_tag(owner, id, tag.as_deref())?;
                print_note(&note);
                Ok(())
            }
            Commands::Archive { ids } => bulk(owner, &ids, BulkAction::Archive).await,
            Commands::Unarchive { ids } => bulk(owner, &ids, BulkAction::Unarchive).await,
            Commands::Delete { ids } => bulk(owner, &ids, BulkAction::Delete).await,
            Commands::Show { id, json } => {
                let service = open_service()?;
                let note = service.get(owner, id)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&note)?);
                } else {
                    print_note(&note);
                }
                Ok(())
            }
            Commands::List {
                archived,
                all,
                limit,
                offset,
            } => {
                let filter = if all {
                    ArchiveFilter::All
                } else if archived {
                    ArchiveFilter::Archived
                } else {
                    ArchiveFilter::Active
                };
                list_notes(owner, filter, offset, limit)
            }
            Commands::Search { query, limit } => {
                search(owner, SimilarTo::Text(query), limit).await
            }
            Commands::Similar { id, limit } => search(owner, SimilarTo::Note(id), limit).await,
            Commands::Tags { set } => tags(owner, set),
            Commands::Run { follow } => run(owner, follow).await,
            Commands::Config => show_config(),
            Commands::Health => health().await,
        }
    }
}

/// Build the production adapters from configuration
fn adapters(
    cfg: &ResolvedConfig,
) -> (
    Arc<dyn TranscriptionAdapter>,
    Arc<dyn EnrichmentAdapter>,
    Arc<dyn Notifier>,
) {
    let transcriber = WhisperTranscriber::new(
        cfg.whisper.binary.clone(),
        cfg.whisper.model.clone(),
        cfg.whisper.language.clone(),
    );
    let enricher = OllamaClient::new(
        cfg.ollama.url.clone(),
        cfg.ollama.model.clone(),
        cfg.ollama.embedding_model.clone(),
        cfg.ollama.api_key.clone(),
    );
    let notifier: Arc<dyn Notifier> = match &cfg.notifications.homeassistant {
        Some(ha) => Arc::new(HomeAssistantNotifier::new(ha.clone())),
        None => Arc::new(LogNotifier),
    };
    (Arc::new(transcriber), Arc::new(enricher), notifier)
}

/// Open the database and wire a service around it
fn open_service() -> Result<NoteService> {
    let cfg = config::config()?;
    let db = Database::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;

    let (transcriber, enricher, notifier) = adapters(cfg);
    let dispatcher = NotificationDispatcher::new(
        NoteStore::new(db.clone()),
        notifier,
        cfg.notifications.base_url.clone(),
        cfg.notify_timeout(),
    );

    Ok(NoteService::new(
        db,
        transcriber,
        enricher,
        Arc::new(dispatcher),
        cfg.service_settings(),
    ))
}

/// Start workers, run `action`, print the owner's events until idle
async fn follow_while<Fut>(service: &NoteService, owner: OwnerId, action: Fut) -> Result<()>
where
    Fut: Future<Output = Result<(), ServiceError>>,
{
    let pool = service.start()?;
    let mut events = service.subscribe_events(owner);

    let outcome = action.await;
    if outcome.is_ok() {
        print_until_idle(service, &mut events).await;
    }

    pool.shutdown().await;
    service.scheduler().shutdown();
    Ok(outcome?)
}

async fn print_until_idle(service: &NoteService, events: &mut Subscription) {
    let idle = service.pipeline().wait_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => break,
            Some(frame) = events.recv() => {
                if !frame.is_keepalive() {
                    eprint!("{}", frame);
                }
            }
        }
    }
    while let Some(frame) = events.try_recv() {
        if !frame.is_keepalive() {
            eprint!("{}", frame);
        }
    }
}

/// Add a note from text or audio
async fn add_note(
    owner: OwnerId,
    text: Option<String>,
    audio: Option<PathBuf>,
    no_wait: bool,
) -> Result<()> {
    if text.as_deref().map_or(true, |t| t.trim().is_empty()) && audio.is_none() {
        anyhow::bail!("No input provided. Use --text <text> or --audio <file>");
    }

    let audio = match audio {
        Some(source) => Some(import_audio(&source).await?),
        None => None,
    };

    let service = open_service()?;
    if no_wait {
        let note = service.create_note(owner, text, audio).await?;
        println!("Note {} created (pending)", note.id);
        return Ok(());
    }

    let mut created = None;
    follow_while(&service, owner, async {
        created = Some(service.create_note(owner, text, audio).await?.id);
        Ok::<(), ServiceError>(())
    })
    .await?;

    if let Some(id) = created {
        print_note(&service.get(owner, id)?);
    }
    Ok(())
}

/// Copy a recording into the audio directory so deleting the note is safe
async fn import_audio(source: &std::path::Path) -> Result<PathBuf> {
    if !source.exists() {
        anyhow::bail!("Audio file not found: {}", source.display());
    }

    let dir = paths::audio_dir()?;
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let destination = paths::audio_destination(&dir, source, chrono::Utc::now());
    tokio::fs::copy(source, &destination)
        .await
        .with_context(|| format!("Failed to copy {}", source.display()))?;
    Ok(destination)
}

async fn bulk(owner: OwnerId, ids: &[NoteId], action: BulkAction) -> Result<()> {
    let service = open_service()?;
    let report: BulkReport = service.bulk(owner, ids, action).await;

    for id in &report.succeeded {
        println!("{:?} {}: ok", action, id);
    }
    for (id, error) in &report.failed {
        eprintln!("{:?} {}: {}", action, id, error);
    }

    if !report.failed.is_empty() {
        anyhow::bail!("{} of {} notes failed", report.failed.len(), ids.len());
    }
    Ok(())
}

fn list_notes(owner: OwnerId, filter: ArchiveFilter, offset: usize, limit: usize) -> Result<()> {
    let service = open_service()?;
    let page = service.list(owner, filter, offset, limit)?;

    if page.notes.is_empty() {
        println!("No notes found. Use 'scribe add --text <text>' to add one.");
        return Ok(());
    }

    print_table_header();
    for note in &page.notes {
        print_table_row(note, None);
    }
    println!(
        "\nShowing {}-{} of {} notes",
        offset + 1,
        offset + page.notes.len(),
        page.total
    );
    Ok(())
}

async fn search(owner: OwnerId, target: SimilarTo, limit: usize) -> Result<()> {
    let service = open_service()?;
    let results: Vec<SimilarNote> = service.search_similar(owner, target, limit).await?;

    if results.is_empty() {
        println!("No similar notes found");
        return Ok(());
    }

    print_table_header();
    for result in &results {
        print_table_row(&result.note, Some(result.distance));
    }
    Ok(())
}

fn tags(owner: OwnerId, set: Option<String>) -> Result<()> {
    let service = open_service()?;
    let tags = match set {
        Some(list) => {
            let requested: Vec<String> = list.split(',').map(|s| s.trim().to_string()).collect();
            service.set_tags(owner, &requested)?
        }
        None => service.tags(owner)?,
    };
    println!("{}", tags.join(", "));
    Ok(())
}

/// Long-running mode: workers, reminders and periodic reconciliation
async fn run(owner: OwnerId, follow: bool) -> Result<()> {
    let cfg = config::config()?;
    let service = open_service()?;
    let pool = service.start()?;
    let mut events = follow.then(|| service.subscribe_events(owner));

    let report = service.recover().await?;
    eprintln!(
        "Recovered: {} interrupted, {} resubmitted, reminders {} re-armed / {} fired / {} dropped",
        report.interrupted,
        report.resubmitted,
        report.reminders.rearmed,
        report.reminders.fired,
        report.reminders.dropped
    );
    eprintln!("Running with {} workers. Press Ctrl-C to stop.", pool.size());

    let mut sweep =
        tokio::time::interval(cfg.stale_after().max(std::time::Duration::from_secs(1)));
    sweep.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = sweep.tick() => {
                if let Err(e) = service.sweep(cfg.stale_after()).await {
                    warn!(error = %e, "Reconciliation sweep failed");
                }
            }
            Some(frame) = next_frame(&mut events) => {
                if !frame.is_keepalive() {
                    print!("{}", frame);
                }
            }
        }
    }

    eprintln!("Shutting down...");
    service.scheduler().shutdown();
    pool.shutdown().await;
    Ok(())
}

/// Next frame from an optional subscription; pends forever without one
async fn next_frame(events: &mut Option<Subscription>) -> Option<crate::domain::EventFrame> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;
    match &cfg.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none - using defaults)"),
    }
    println!();
    print!("{}", serde_yaml::to_string(&cfg.redacted())?);
    Ok(())
}

async fn health() -> Result<()> {
    let cfg = config::config()?;
    let (transcriber, enricher, notifier) = adapters(cfg);

    let mut healthy = true;
    for (name, result) in [
        (transcriber.name().to_string(), transcriber.health_check().await),
        (enricher.name().to_string(), enricher.health_check().await),
    ] {
        match result {
            Ok(()) => println!("{:<10} ok", name),
            Err(e) => {
                healthy = false;
                println!("{:<10} FAILED: {:#}", name, e);
            }
        }
    }
    println!("{:<10} {}", "notifier", notifier.name());

    if !healthy {
        anyhow::bail!("Health check failed");
    }
    Ok(())
}

fn print_note(note: &Note) {
    println!("Note {}", note.id);
    println!("  Status:  {}", note.status);
    if let Some(error) = &note.error_message {
        println!("  Error:   {}", error);
    }
    println!("  Summary: {}", note.summary.as_deref().unwrap_or("-"));
    println!("  Tag:     {}", note.tag.as_deref().unwrap_or("-"));
    if let Some(at) = note.notify_at {
        println!("  Remind:  {}", at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"));
    }
    if let Some(audio) = &note.audio_path {
        println!("  Audio:   {}", audio.display());
    }
    if note.archived {
        println!("  Archived");
    }
    println!("  Created: {}", note.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"));
    println!();
    println!("{}", note.raw_transcript);
}

fn print_table_header() {
    println!("{:<6} {:<12} {:<10} {:<8} {:<40}", "ID", "STATUS", "TAG", "DIST", "SUMMARY");
    println!("{}", "-".repeat(80));
}

fn print_table_row(note: &Note, distance: Option<f32>) {
    let summary = note
        .summary
        .clone()
        .unwrap_or_else(|| note.raw_transcript.clone());
    let summary = match summary.char_indices().nth(37) {
        Some((idx, _)) => format!("{}...", &summary[..idx]),
        None => summary,
    };
    println!(
        "{:<6} {:<12} {:<10} {:<8} {:<40}",
        note.id,
        note.status.as_str(),
        note.tag.as_deref().unwrap_or("-"),
        distance.map(|d| format!("{:.3}", d)).unwrap_or_else(|| "-".to_string()),
        summary
    );
}
