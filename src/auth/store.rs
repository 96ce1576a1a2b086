// Persisted access token shared between processes

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::lock::{AdvisoryLock, LockGuard};
use super::types::{AccessToken, TokenError};

/// Shared token record plus the lock that arbitrates refreshing it
///
/// The refresh engine only talks to this trait, so the file-based
/// implementation can be replaced by a real lock service.
pub trait TokenStore: Send + Sync {
    /// Read and validate the current record
    fn read(&self) -> Result<AccessToken, TokenError>;

    /// Replace the record atomically
    fn write(&self, token: &AccessToken) -> Result<(), TokenError>;

    /// Last modification time of the record, if it exists
    fn modified(&self) -> Option<SystemTime>;

    /// Try to take the refresh lock without waiting
    fn try_lock(&self) -> Result<Option<LockGuard>, TokenError>;

    /// Remove the refresh lock if its holder looks dead
    fn reap_stale_lock(&self, max_age: Duration) -> Result<bool, TokenError>;
}

/// JSON token file with a sibling `.lock` marker
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    lock: AdvisoryLock,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = AdvisoryLock::for_file(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    fn origin(&self) -> String {
        self.path.display().to_string()
    }
}

impl TokenStore for FileTokenStore {
    fn read(&self) -> Result<AccessToken, TokenError> {
        let data = std::fs::read(&self.path).map_err(|e| TokenError::io(&self.path, e))?;
        let token: AccessToken =
            serde_json::from_slice(&data).map_err(|e| TokenError::Parse {
                origin: self.origin(),
                detail: e.to_string(),
            })?;
        token.validate(self.origin())
    }

    fn write(&self, token: &AccessToken) -> Result<(), TokenError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| TokenError::io(dir, e))?;

        let data = serde_json::to_vec(token).map_err(|e| TokenError::Parse {
            origin: self.origin(),
            detail: e.to_string(),
        })?;

        // Temp file lives in the same directory so the rename stays atomic
        let mut tmp = tempfile::Builder::new()
            .prefix(".token.json.")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| TokenError::io(dir, e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| TokenError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| TokenError::io(&self.path, e.error))?;

        tracing::debug!(path = %self.path.display(), "Persisted access token");
        Ok(())
    }

    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
    }

    fn try_lock(&self) -> Result<Option<LockGuard>, TokenError> {
        self.lock.try_acquire()
    }

    fn reap_stale_lock(&self, max_age: Duration) -> Result<bool, TokenError> {
        self.lock.reap_stale(max_age)
    }
}
