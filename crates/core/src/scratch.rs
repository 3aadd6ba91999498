//! Per-video scratch directory for extracted, resized and upscaled frames.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Run-owned scratch directory, wiped on creation and removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn recreate(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        remove_scratch_dir(&path)?;
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create scratch directory: {}", path.display()))?;
        debug!(path = %path.display(), "Created scratch directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(error) = remove_scratch_dir(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %format!("{error:#}"),
                "Failed to remove scratch directory"
            );
        }
    }
}

/// Removes `path` recursively. A missing directory is not an error.
pub fn remove_scratch_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed scratch directory");
            Ok(())
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error)
            .with_context(|| format!("failed to remove scratch directory: {}", path.display())),
    }
}
