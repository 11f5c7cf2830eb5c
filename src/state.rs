//! Persisted JSON state — atomic replace and corruption recovery.
//!
//! Every state file the daemon owns is rewritten in full on each
//! mutation:
//!
//!   1. serialize to `<name>.tmp`
//!   2. fsync() the temp file
//!   3. rename `<name>.tmp` → `<name>` (atomic on POSIX)
//!
//! A reader therefore sees either the previous version or the new one,
//! never a torn write. A file that fails to parse is moved aside to a
//! timestamped backup and the owner starts again from a safe default.
//! A file that cannot be read at all is left alone and the load fails.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Paths of every file under the state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub poll_state: PathBuf,
    pub usage_state: PathBuf,
    pub deferred_queue: PathBuf,
    pub cache: PathBuf,
    pub health: PathBuf,
    pub lock: PathBuf,
    pub quota_db: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            poll_state: dir.join("poll_state.json"),
            usage_state: dir.join("usage_state.json"),
            deferred_queue: dir.join("deferred_queue.json"),
            cache: dir.join("flow_cache.json"),
            health: dir.join("daemon_health_state.json"),
            lock: dir.join("flowd.lock"),
            quota_db: dir.join("quota_log.db"),
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {}", self.dir.display()))
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    let tmp_path = tmp_path_for(path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(&bytes)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Atomic rename to {} failed", path.display()))?;
    Ok(())
}

/// Read-only load: `Ok(None)` if the file does not exist.
///
/// Observers (the sentinel, downstream readers) use this; it never
/// touches a corrupt file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = serde_json::from_slice(&raw)
        .with_context(|| format!("Malformed JSON in {}", path.display()))?;
    Ok(Some(value))
}

/// Owner load: missing → default, corrupt → backed up and default.
///
/// Only malformed content is recovered from. An I/O error is returned
/// untouched so the caller never overwrites state it could not read.
pub fn load_or_recover<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No state file yet — starting empty");
            return Ok(T::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("State file {} is unreadable", path.display()));
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(value) => Ok(value),
        Err(parse_err) => {
            let backup = backup_path_for(path);
            match fs::rename(path, &backup) {
                Ok(()) => warn!(
                    event = "state_corrupt",
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %parse_err,
                    "Corrupt state file moved aside — reinitialized to default"
                ),
                Err(rename_err) => warn!(
                    event = "state_corrupt",
                    path = %path.display(),
                    error = %parse_err,
                    rename_error = %rename_err,
                    "Corrupt state file could not be moved aside — reinitialized to default"
                ),
            }
            Ok(T::default())
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
    path.with_file_name(name)
}
