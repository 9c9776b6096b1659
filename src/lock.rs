//! Workspace file lock for the apply+CI window.
//!
//! The governed apply path owns the workspace exclusively while a patch is
//! applied and validated. Multi-run parallelism is supported only with
//! isolated workspaces; within one workspace the advisory lock serializes
//! runs. Lock-acquisition failure maps to process exit code 5, shared
//! across the workspace-locking tool family.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Exit code for lock-acquisition failure.
pub const EXIT_LOCK_FAILURE: i32 = 5;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Workspace is locked by another process: {path}")]
    Busy { path: String },

    #[error("Failed to open lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// An exclusive advisory lock over the workspace, released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
}

impl WorkspaceLock {
    /// Try to take the lock without blocking.
    pub fn acquire(lock_path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LockError::Io {
                path: lock_path.display().to_string(),
                source: e,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| LockError::Io {
                path: lock_path.display().to_string(),
                source: e,
            })?;

        file.try_lock_exclusive().map_err(|_| LockError::Busy {
            path: lock_path.display().to_string(),
        })?;

        debug!(path = %lock_path.display(), "workspace lock acquired");
        Ok(Self { file })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
