//! Single-slot status record shared by an upscale run and whoever supervises it.
//!
//! Both implementations are "last write wins": a write replaces the record, a
//! read returns whatever was written most recently. Readers may see the same
//! value twice or miss intermediate values.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::STATUS_FILE_NAME;

pub const STATUS_LOADING: &str = "Loading...";
pub const STATUS_COMPLETED: &str = "All files completed";
pub const STATUS_ERROR: &str = "Error while upscaling";
pub const STATUS_STOPPED: &str = "Stopped upscaling";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Progress,
    Completed,
    Error,
    Stopped,
}

impl StatusKind {
    /// Terminal phrases are matched as prefixes. Suffixes such as the elapsed
    /// time or an error detail are ignored, and a file name quoted inside a
    /// progress line never reads as a terminal state.
    pub fn classify(status: &str) -> Self {
        let status = status.trim_start();
        if status.starts_with(STATUS_ERROR) {
            Self::Error
        } else if status.starts_with(STATUS_STOPPED) {
            Self::Stopped
        } else if status.starts_with(STATUS_COMPLETED) {
            Self::Completed
        } else {
            Self::Progress
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Progress)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Progress => write!(f, "progress"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

pub fn error_status(detail: &str) -> String {
    format!("{STATUS_ERROR}: {detail}")
}

pub fn completed_status(elapsed_secs: u64) -> String {
    format!("{STATUS_COMPLETED} [{elapsed_secs} sec.]")
}

/// The record holds exactly one line.
pub fn single_line(status: &str) -> String {
    status
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub trait ProgressChannel: Send + Sync {
    fn write(&self, status: &str) -> Result<()>;
    fn read(&self) -> Result<Option<String>>;
}

/// In-process channel backed by a `watch` slot.
#[derive(Debug)]
pub struct StatusCell {
    slot: watch::Sender<Option<String>>,
}

impl StatusCell {
    pub fn new() -> Self {
        let (slot, _initial_rx) = watch::channel(None);
        Self { slot }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.slot.subscribe()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel for StatusCell {
    fn write(&self, status: &str) -> Result<()> {
        self.slot.send_replace(Some(single_line(status)));
        Ok(())
    }

    fn read(&self) -> Result<Option<String>> {
        Ok(self.slot.borrow().clone())
    }
}

/// Cross-process channel: one text file holding the latest status line.
///
/// Writes go to a sibling temp file that is renamed over the record, so a
/// reader in another process never observes a half-written line.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STATUS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes a record left over from a previous run.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error)
                .with_context(|| format!("failed to remove status file: {}", self.path.display())),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ProgressChannel for StatusFile {
    fn write(&self, status: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create status directory: {}", parent.display())
            })?;
        }

        let tmp_path = self.temp_path();
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create status file: {}", tmp_path.display()))?;
        file.write_all(single_line(status).as_bytes())
            .with_context(|| format!("failed to write status file: {}", tmp_path.display()))?;
        file.flush()?;
        drop(file);

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move status file into place: {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })
    }

    fn read(&self) -> Result<Option<String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to read status file: {}", self.path.display())
                })
            }
        };

        Ok(raw
            .lines()
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string))
    }
}
