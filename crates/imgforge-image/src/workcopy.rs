//! Temporary working copies of converted containers.

use std::path::{Path, PathBuf};

use imgforge_common::constants::WORKING_COPY_EXTENSION;
use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::HandleId;

/// A converted container file that is deleted when dropped, unless kept.
#[derive(Debug)]
pub struct WorkingCopy {
    path: PathBuf,
    keep: bool,
}

impl WorkingCopy {
    /// Reserves `<work_dir>/<handle>.wim` for the first mount of a handle
    /// and `<work_dir>/<handle>-<mount>.wim` for later ones, creating
    /// `work_dir` if needed.
    ///
    /// Copies kept by earlier mounts therefore never share a path with a new
    /// one. Any stale file at the reserved path is removed first, since the
    /// export tool appends to an existing destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the stale file
    /// cannot be removed.
    pub fn reserve(work_dir: &Path, handle: &HandleId, mount: u32) -> Result<Self> {
        std::fs::create_dir_all(work_dir).map_err(|e| ForgeError::io(work_dir, e))?;
        let name = match mount {
            0 => format!("{handle}.{WORKING_COPY_EXTENSION}"),
            n => format!("{handle}-{n}.{WORKING_COPY_EXTENSION}"),
        };
        let path = work_dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| ForgeError::io(&path, e))?;
        }
        Ok(Self { path, keep: false })
    }

    /// Returns the working copy path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leaves the file on disk when this value is dropped.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        if self.keep || !self.path.exists() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "working copy deleted"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to delete working copy"
            ),
        }
    }
}
