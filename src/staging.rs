//! Per-task staging directories.
//!
//! A [`StagingDir`] backs one task's source files on the host. It is created
//! fresh for every task, mounted read-only into exactly one sandbox, and
//! deleted when the task finishes, whichever way it finishes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

const STAGING_PREFIX: &str = "codebox-";

/// A uniquely named temporary directory owned by one task.
///
/// Removed by [`StagingDir::close`], or on drop if it was never closed.
#[derive(Debug)]
pub(crate) struct StagingDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagingDir {
    /// Create an empty staging directory under the system temp dir.
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir()?;
        let path = dir.path().to_path_buf();
        debug!("Created staging directory {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    /// Create a staging directory holding a single file.
    pub fn with_file(file_name: &str, contents: &str) -> io::Result<Self> {
        let staging = Self::new()?;
        fs::write(staging.path().join(file_name), contents)?;
        Ok(staging)
    }

    /// Host path of the directory.
    ///
    /// Still returns the old path after `close`, when it no longer exists.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `close` has already run.
    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }

    /// Delete the directory. Calling it again is a no-op.
    pub fn close(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if let Err(e) = dir.close() {
            warn!(
                "Failed to remove staging directory {}: {}",
                self.path.display(),
                e
            );
        } else {
            debug!("Removed staging directory {}", self.path.display());
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!("Staging directory {} dropped without close", self.path.display());
            self.close();
        }
    }
}
