//! Canonical paths for scribe state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scribe::config::paths;
//!
//! let audio = paths::audio_dir()?;
//! let stored = paths::audio_destination(&audio, source, chrono::Utc::now());
//! ```

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Get the stored audio directory (~/.scribe/audio/)
pub fn audio_dir() -> Result<PathBuf> {
    Ok(crate::config::config()?.audio_dir.clone())
}

/// Where an imported recording is kept: `<dir>/<YYYYmmdd-HHMMSS>-<name>`
pub fn audio_destination(dir: &Path, source: &Path, now: DateTime<Utc>) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    dir.join(format!("{}-{}", now.format("%Y%m%d-%H%M%S"), name))
}
