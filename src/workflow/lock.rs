//! Scoped advisory file locking.
//!
//! The lock lives on a sidecar `<file>.lock` next to the guarded file, so it
//! survives the guarded file being replaced by rename. The platform
//! primitive (`flock` or `LockFileEx`) is hidden behind [`FileLock`].

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until an exclusive lock on `target` is held.
    pub fn acquire(target: &Path) -> io::Result<Self> {
        let path = lock_path(target);
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
        fs2::FileExt::lock_exclusive(&file)?;
        Ok(Self { file, path })
    }

    /// Acquire a lock, logging and returning `None` if locking is not
    /// possible. Also returns how long the attempt took.
    pub fn acquire_or_warn(target: &Path) -> (Option<Self>, Duration) {
        let start = Instant::now();
        match Self::acquire(target) {
            Ok(lock) => (Some(lock), start.elapsed()),
            Err(e) => {
                tracing::warn!(path = ?target, error = %e, "File lock unavailable, continuing without it");
                (None, start.elapsed())
            }
        }
    }

    /// Path of the sidecar lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = ?self.path, error = %e, "Failed to release file lock");
        }
    }
}

/// Sidecar lock path for `target`, e.g. `topic.json` -> `topic.json.lock`.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_lock_path() {
        assert_eq!(lock_path(Path::new("/tmp/a/topic.json")), PathBuf::from("/tmp/a/topic.json.lock"));
    }

    #[test]
    fn test_acquire_creates_sidecar() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("topic.json");

        let lock = FileLock::acquire(&target).unwrap();
        assert!(lock.path().exists());
        assert!(!target.exists());
    }

    #[test]
    fn test_lock_is_exclusive_across_threads() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("topic.json");

        let first = FileLock::acquire(&target).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let target = target.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _second = FileLock::acquire(&target).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_acquire_or_warn_in_missing_directory() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("missing").join("topic.json");

        let (lock, _) = FileLock::acquire_or_warn(&target);
        assert!(lock.is_none());
    }
}
