//! Configuration for scribe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SCRIBE_HOME, SCRIBE_DB, OLLAMA_URL, ...)
//! 2. Config file (.scribe/config.yaml)
//! 3. Defaults (~/.scribe)
//!
//! Config file discovery:
//! - Searches current directory and parents for .scribe/config.yaml
//! - `paths.home` is relative to the .scribe directory, other paths to the
//!   project root (the parent of .scribe)

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::HomeAssistantConfig;
use crate::core::{PipelineSettings, ServiceSettings, DEFAULT_TAGS};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub whisper: WhisperConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .scribe/)
    pub home: Option<String>,
    /// Database file (relative to the project root)
    pub database: Option<String>,
    /// Stored audio directory (relative to the project root)
    pub audio: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OllamaConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub embedding_model: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhisperConfig {
    pub binary: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub transcription_timeout_seconds: Option<u64>,
    pub enrichment_timeout_seconds: Option<u64>,
    pub stale_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationsConfig {
    pub base_url: Option<String>,
    pub misfire_grace_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub homeassistant: HomeAssistantFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HomeAssistantFileConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsConfig {
    pub subscriber_buffer: Option<usize>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// Where recorded audio is kept
    pub audio_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub ollama: OllamaSettings,
    pub whisper: WhisperSettings,
    pub pipeline: PipelineLimits,
    pub notifications: NotificationSettings,
    pub subscriber_buffer: usize,
    /// Tag set for owners who never saved their own
    pub default_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OllamaSettings {
    pub url: String,
    pub model: String,
    pub embedding_model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhisperSettings {
    pub binary: String,
    pub model: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineLimits {
    pub workers: usize,
    pub queue_capacity: usize,
    pub transcription_timeout_seconds: u64,
    pub enrichment_timeout_seconds: u64,
    pub stale_after_seconds: u64,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            transcription_timeout_seconds: 300,
            enrichment_timeout_seconds: 120,
            stale_after_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationSettings {
    /// Base of the links put in reminders
    pub base_url: String,
    pub misfire_grace_seconds: u64,
    pub timeout_seconds: u64,
    /// Set only when url, token and device are all known
    pub homeassistant: Option<HomeAssistantConfig>,
}

impl ResolvedConfig {
    /// Settings for [`crate::core::NoteService`]
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            pipeline: PipelineSettings {
                workers: self.pipeline.workers,
                queue_capacity: self.pipeline.queue_capacity,
                transcription_timeout: Duration::from_secs(
                    self.pipeline.transcription_timeout_seconds,
                ),
                enrichment_timeout: Duration::from_secs(self.pipeline.enrichment_timeout_seconds),
                default_tags: self.default_tags.clone(),
            },
            subscriber_buffer: self.subscriber_buffer,
            misfire_grace: Duration::from_secs(self.notifications.misfire_grace_seconds),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.pipeline.stale_after_seconds)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notifications.timeout_seconds)
    }

    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.ollama.api_key.is_some() {
            copy.ollama.api_key = Some("***".to_string());
        }
        if let Some(ha) = copy.notifications.homeassistant.as_mut() {
            ha.token = "***".to_string();
        }
        copy
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".scribe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file values, environment and defaults
fn resolve(
    config_path: Option<&Path>,
    file: ConfigFile,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> ResolvedConfig {
    // .scribe/ and the project root above it
    let scribe_dir = config_path.and_then(Path::parent);
    let base_dir = scribe_dir.and_then(Path::parent).unwrap_or(Path::new("."));

    let home = match (env("SCRIBE_HOME"), &file.paths.home, scribe_dir) {
        (Some(home), _, _) => PathBuf::from(home),
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home,
    };

    let database = match (env("SCRIBE_DB"), &file.paths.database) {
        (Some(db), _) => PathBuf::from(db),
        (None, Some(db)) => resolve_path(base_dir, db),
        (None, None) => home.join("scribe.db"),
    };

    let audio_dir = match &file.paths.audio {
        Some(audio) => resolve_path(base_dir, audio),
        None => home.join("audio"),
    };

    let ollama = OllamaSettings {
        url: env("OLLAMA_URL")
            .or(file.ollama.url)
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
        model: env("OLLAMA_MODEL")
            .or(file.ollama.model)
            .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
        embedding_model: env("OLLAMA_EMBEDDING_MODEL")
            .or(file.ollama.embedding_model)
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
        api_key: env("OLLAMA_API_KEY").or(file.ollama.api_key),
    };

    let whisper = WhisperSettings {
        binary: env("WHISPER_PATH")
            .or(file.whisper.binary)
            .unwrap_or_else(|| "whisper".to_string()),
        model: file.whisper.model.unwrap_or_else(|| "base".to_string()),
        language: file.whisper.language,
    };

    let defaults = PipelineLimits::default();
    let pipeline = PipelineLimits {
        workers: file.pipeline.workers.unwrap_or(defaults.workers),
        queue_capacity: file
            .pipeline
            .queue_capacity
            .unwrap_or(defaults.queue_capacity),
        transcription_timeout_seconds: file
            .pipeline
            .transcription_timeout_seconds
            .unwrap_or(defaults.transcription_timeout_seconds),
        enrichment_timeout_seconds: file
            .pipeline
            .enrichment_timeout_seconds
            .unwrap_or(defaults.enrichment_timeout_seconds),
        stale_after_seconds: file
            .pipeline
            .stale_after_seconds
            .unwrap_or(defaults.stale_after_seconds),
    };

    let ha = file.notifications.homeassistant;
    let homeassistant = match (
        env("HASS_URL").or(ha.url),
        env("HASS_TOKEN").or(ha.token),
        env("HASS_DEVICE").or(ha.device),
    ) {
        (Some(url), Some(token), Some(device)) => Some(HomeAssistantConfig { url, token, device }),
        _ => None,
    };

    let notifications = NotificationSettings {
        base_url: env("SCRIBE_BASE_URL")
            .or(file.notifications.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        misfire_grace_seconds: file.notifications.misfire_grace_seconds.unwrap_or(3600),
        timeout_seconds: file.notifications.timeout_seconds.unwrap_or(10),
        homeassistant,
    };

    let default_tags = file
        .tags
        .filter(|tags| !tags.is_empty())
        .unwrap_or_else(|| DEFAULT_TAGS.iter().map(|t| t.to_string()).collect());

    ResolvedConfig {
        home,
        database,
        audio_dir,
        config_file: config_path.map(Path::to_path_buf),
        ollama,
        whisper,
        pipeline,
        notifications,
        subscriber_buffer: file.events.subscriber_buffer.unwrap_or(64),
        default_tags,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".scribe");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(
        config_file.as_deref(),
        file,
        |key| std::env::var(key).ok().filter(|v| !v.is_empty()),
        default_home,
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, ConfigFile::default(), no_env, PathBuf::from("/u/.scribe"));

        assert_eq!(config.database, PathBuf::from("/u/.scribe/scribe.db"));
        assert_eq!(config.audio_dir, PathBuf::from("/u/.scribe/audio"));
        assert_eq!(config.ollama.url, DEFAULT_OLLAMA_URL);
        assert_eq!(config.default_tags.len(), 5);
        assert!(config.notifications.homeassistant.is_none());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let scribe_dir = temp.path().join(".scribe");
        std::fs::create_dir_all(&scribe_dir).unwrap();

        let config_path = scribe_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./
  database: data/notes.db
ollama:
  model: mistral
pipeline:
  workers: 4
notifications:
  base_url: https://notes.example.com
  homeassistant:
    url: http://ha.local:8123
    token: secret
    device: pixel
tags: [Errand, Idea]
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1.0"));
        assert_eq!(parsed.pipeline.workers, Some(4));

        let config = resolve(Some(&config_path), parsed, no_env, PathBuf::from("/unused"));
        assert_eq!(config.database, temp.path().join("data/notes.db"));
        assert_eq!(config.ollama.model, "mistral");
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.queue_capacity, 64);
        assert_eq!(config.default_tags, vec!["Errand", "Idea"]);
        assert_eq!(
            config.notifications.homeassistant.as_ref().map(|ha| ha.device.as_str()),
            Some("pixel")
        );
        assert_eq!(config.redacted().notifications.homeassistant.unwrap().token, "***");
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("SCRIBE_DB", "/tmp/override.db"),
            ("OLLAMA_URL", "http://gpu:11434"),
            ("HASS_URL", "http://ha"),
            ("HASS_TOKEN", "t"),
        ]
        .into_iter()
        .collect();

        let mut file = ConfigFile::default();
        file.ollama.url = Some("http://file:11434".to_string());
        file.notifications.homeassistant.device = Some("phone".to_string());

        let config = resolve(
            None,
            file,
            |key| env.get(key).map(|v| v.to_string()),
            PathBuf::from("/u/.scribe"),
        );
        assert_eq!(config.database, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.ollama.url, "http://gpu:11434");
        assert!(config.notifications.homeassistant.is_some());
    }

    #[test]
    fn test_service_settings_carry_limits() {
        let config = resolve(None, ConfigFile::default(), no_env, PathBuf::from("/u"));
        let settings = config.service_settings();
        assert_eq!(settings.pipeline.workers, 2);
        assert_eq!(settings.misfire_grace, Duration::from_secs(3600));
        assert_eq!(settings.pipeline.default_tags, config.default_tags);
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
