// Advisory refresh lock shared between processes
//
// The lock is a marker file created with O_EXCL semantics. Whoever creates
// it owns the refresh; everybody else backs off. A holder that crashes leaves
// the marker behind, so any process may delete markers older than the stale
// threshold.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::types::TokenError;

/// Markers older than this are presumed abandoned
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(300);

/// Marker-file lock at a fixed path
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    path: PathBuf,
}

impl AdvisoryLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock path conventionally placed next to the guarded file
    pub fn for_file(file: &Path) -> Self {
        let mut name = file.as_os_str().to_owned();
        name.push(".lock");
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the marker if absent
    ///
    /// Returns `Ok(None)` when another holder already owns it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, TokenError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TokenError::io(parent, e))?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(TokenError::io(&self.path, e)),
        };

        // Holder PID is informational only; the marker's existence is the lock
        let guard = LockGuard {
            path: self.path.clone(),
        };
        if let Err(e) = writeln!(file, "{}", std::process::id()) {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to record lock holder");
        }

        tracing::debug!(path = %self.path.display(), "Acquired refresh lock");
        Ok(Some(guard))
    }

    /// Age of the current marker, if one exists
    pub fn age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Delete the marker if it is older than `max_age`
    pub fn reap_stale(&self, max_age: Duration) -> Result<bool, TokenError> {
        match self.age() {
            Some(age) if age > max_age => {}
            _ => return Ok(false),
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::warn!(
                    path = %self.path.display(),
                    max_age_secs = max_age.as_secs(),
                    "Removed stale refresh lock"
                );
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TokenError::io(&self.path, e)),
        }
    }
}

/// Held refresh lock; the marker is removed on drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Released refresh lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "Refresh lock vanished before release");
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to release refresh lock");
            }
        }
    }
}
