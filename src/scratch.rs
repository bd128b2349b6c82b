//! Scratch directory ownership guard.
//!
//! Every temporary directory in the service is held by exactly one
//! `ScratchDir` value. Whoever owns the guard is responsible for the
//! directory; moving the guard (session -> job -> result stream) moves
//! that responsibility. Dropping it releases the directory best-effort.

use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh uuid-named directory under the system temp dir.
    pub fn create(prefix: &str) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        // Cleanup failures are logged, never surfaced: a leaked temp dir
        // must not fail the response that triggered the drop.
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove scratch dir {}: {}", self.path.display(), e);
            }
        }
    }
}
