/// Cross-process locking for token refresh coordination
use crate::error::{OAuthError, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manager for cross-process refresh locks
///
/// Several processes sharing one persistent token store (for example a CLI
/// invoked concurrently) use a lock file per store key so that only one of
/// them talks to the token endpoint at a time.
#[derive(Debug, Clone)]
pub struct RefreshLockManager {
    lock_dir: PathBuf,
}

impl RefreshLockManager {
    /// Create a lock manager with a custom lock directory
    pub fn new(lock_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    /// Create a lock manager for a specific application
    ///
    /// Uses `$XDG_RUNTIME_DIR` when set, the temp directory otherwise.
    pub fn for_app(app_name: &str) -> Result<Self> {
        let mut lock_dir = Self::default_lock_dir();
        lock_dir.push(app_name);
        Self::new(lock_dir)
    }

    fn default_lock_dir() -> PathBuf {
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            return PathBuf::from(runtime_dir).join("einlass-locks");
        }

        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        std::env::temp_dir().join(format!("einlass-locks-{}", user))
    }

    /// Acquire an exclusive lock for a key, blocking the current thread
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire_lock(&self, key: &str) -> Result<RefreshLock> {
        let (file, path) = self.open(key)?;
        file.lock_exclusive()?;
        debug!(path = %path.display(), "Acquired refresh lock");

        Ok(RefreshLock {
            file: Some(file),
            path,
        })
    }

    /// Acquire an exclusive lock without blocking the async runtime
    pub async fn acquire_lock_async(&self, key: &str) -> Result<RefreshLock> {
        let manager = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || manager.acquire_lock(&key))
            .await
            .map_err(|e| OAuthError::technical("Refresh lock task failed", e))?
    }

    /// Try to acquire an exclusive lock without blocking
    ///
    /// Returns `None` if the lock is already held.
    pub fn try_acquire_lock(&self, key: &str) -> Result<Option<RefreshLock>> {
        let (file, path) = self.open(key)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RefreshLock {
                file: Some(file),
                path,
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open(&self, key: &str) -> Result<(File, PathBuf)> {
        let lock_path = self.lock_path(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        Ok((file, lock_path))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.lock_dir.join(format!("{}.lock", safe_key))
    }
}

/// RAII guard for a refresh lock
#[derive(Debug)]
pub struct RefreshLock {
    file: Option<File>,
    path: PathBuf,
}

impl RefreshLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RefreshLock {
    fn drop(&mut self) {
        // The lock file stays in place so waiters and newcomers lock the same inode
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}
