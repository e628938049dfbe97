//! Atomic, lock-guarded persistence for workflow documents.
//!
//! Every write goes to a temporary sibling file, is flushed and re-parsed,
//! and only then renamed over the real document. Read-modify-write cycles
//! hold an advisory lock for their whole duration so cooperating processes
//! never interleave.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use super::documents::WorkflowDocument;
use super::error::{WorkflowError, WorkflowResult};
use super::lock::FileLock;
use crate::core::{PerformanceMonitor, WorkflowCache};

/// Callback run with the document path after every successful write.
pub type InvalidationHook = Arc<dyn Fn(&Path) + Send + Sync>;

/// What an [`StateStore::update`] closure wants done with the document.
#[derive(Debug)]
pub enum Update<T> {
    /// Write the mutated document back.
    Save(T),
    /// Leave the file untouched.
    Discard(T),
}

/// File-backed store for workflow documents.
pub struct StateStore {
    cache: Option<Arc<WorkflowCache>>,
    monitor: Arc<PerformanceMonitor>,
    hooks: RwLock<Vec<InvalidationHook>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("cached", &self.cache.is_some())
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(Arc::new(PerformanceMonitor::new()))
    }
}

impl StateStore {
    /// Create a store without a cache.
    pub fn new(monitor: Arc<PerformanceMonitor>) -> Self {
        Self { cache: None, monitor, hooks: RwLock::new(Vec::new()) }
    }

    /// Serve read-only loads from `cache` and evict on every write.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<WorkflowCache>) -> Self {
        let evict = Arc::clone(&cache);
        self.on_write(Arc::new(move |path| evict.invalidate(&cache_key(path))));
        self.cache = Some(cache);
        self
    }

    /// Register a callback run after every successful write.
    pub fn on_write(&self, hook: InvalidationHook) {
        self.hooks.write().push(hook);
    }

    /// Load a document for reading.
    pub fn load(&self, path: &Path) -> WorkflowResult<WorkflowDocument> {
        let key = cache_key(path);
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(&key, Some(path))) {
            match serde_json::from_value(cached) {
                Ok(doc) => return Ok(doc),
                Err(e) => tracing::debug!(path = ?path, error = %e, "Discarding unreadable cache entry"),
            }
        }

        let doc = {
            let _lock = self.lock(path);
            self.read(path)?
        };

        if let Some(cache) = &self.cache {
            match serde_json::to_value(&doc) {
                Ok(value) => cache.set(key, value, Some(path)),
                Err(e) => tracing::debug!(path = ?path, error = %e, "Could not cache document"),
            }
        }

        Ok(doc)
    }

    /// Replace the document at `path` atomically.
    pub fn save(&self, path: &Path, doc: &WorkflowDocument) -> WorkflowResult<()> {
        let start = Instant::now();
        let temp = write_temp(path, doc)?;
        let lock = self.lock(path);
        persist(temp, path)?;
        self.monitor.record_file_write(start.elapsed());
        drop(lock);

        self.notify(path);
        Ok(())
    }

    /// Load, mutate, and write back under one lock.
    ///
    /// Nothing is written if `f` fails or returns [`Update::Discard`].
    pub fn update<T, F>(&self, path: &Path, f: F) -> WorkflowResult<T>
    where
        F: FnOnce(&mut WorkflowDocument) -> WorkflowResult<Update<T>>,
    {
        let lock = self.lock(path);
        let mut doc = self.read(path)?;

        let value = match f(&mut doc)? {
            Update::Discard(value) => return Ok(value),
            Update::Save(value) => value,
        };

        let start = Instant::now();
        let temp = write_temp(path, &doc)?;
        persist(temp, path)?;
        self.monitor.record_file_write(start.elapsed());
        drop(lock);

        self.notify(path);
        Ok(value)
    }

    fn lock(&self, path: &Path) -> Option<FileLock> {
        let (lock, waited) = FileLock::acquire_or_warn(path);
        if lock.is_some() {
            self.monitor.record_lock_wait(waited);
        }
        lock
    }

    fn read(&self, path: &Path) -> WorkflowResult<WorkflowDocument> {
        let start = Instant::now();
        let bytes = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkflowError::NotFound { kind: "Workflow document", id: path.display().to_string() }
            } else {
                WorkflowError::Io(e)
            }
        })?;
        let doc = serde_json::from_slice(&bytes)
            .map_err(|source| WorkflowError::CorruptDocument { path: path.to_path_buf(), source })?;
        self.monitor.record_file_read(start.elapsed());
        Ok(doc)
    }

    fn notify(&self, path: &Path) {
        for hook in self.hooks.read().iter() {
            hook(path);
        }
    }
}

fn cache_key(path: &Path) -> String {
    format!("topic_state:{}", path.display())
}

/// Serialize into a flushed temp file next to `path`, then re-parse it.
fn write_temp(path: &Path, doc: &WorkflowDocument) -> WorkflowResult<NamedTempFile> {
    let dir = parent_dir(path);
    let mut temp = NamedTempFile::new_in(&dir)?;

    let content = serde_json::to_vec_pretty(doc)?;
    temp.write_all(&content)?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    let written = std::fs::read(temp.path())?;
    serde_json::from_slice::<serde_json::Value>(&written)
        .map_err(|source| WorkflowError::CorruptDocument { path: temp.path().to_path_buf(), source })?;

    Ok(temp)
}

fn persist(temp: NamedTempFile, path: &Path) -> WorkflowResult<()> {
    temp.persist(path).map_err(|e| WorkflowError::Io(e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::workflow::documents::{Phase, PhaseStatus, Step};

    fn doc() -> WorkflowDocument {
        WorkflowDocument {
            current_phase: Some("p1".to_string()),
            current_step: Some("s1".to_string()),
            phases: vec![Phase {
                id: "p1".to_string(),
                name: None,
                order: 1,
                status: PhaseStatus::InProgress,
                started_at: None,
                completed_at: None,
                depends_on: Vec::new(),
                steps: vec![Step::new("s1")],
            }],
            ..WorkflowDocument::default()
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        let store = StateStore::default();

        store.save(&path, &doc()).unwrap();
        assert_eq!(store.load(&path).unwrap(), doc());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "topic.json" && name != "topic.json.lock")
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = StateStore::default().load(&dir.path().join("topic.json")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_load_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = StateStore::default().load(&path).unwrap_err();
        assert!(matches!(err, WorkflowError::CorruptDocument { .. }));
    }

    #[test]
    fn test_update_writes_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        let monitor = Arc::new(PerformanceMonitor::new());
        let store = StateStore::new(Arc::clone(&monitor));
        store.save(&path, &doc()).unwrap();

        let returned = store
            .update(&path, |d| {
                d.current_step = None;
                Ok(Update::Save(42))
            })
            .unwrap();

        assert_eq!(returned, 42);
        assert_eq!(store.load(&path).unwrap().current_step, None);
        assert_eq!(monitor.report().file_writes, 2);
    }

    #[test]
    fn test_update_discard_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        let store = StateStore::default();
        store.save(&path, &doc()).unwrap();
        let before = std::fs::read(&path).unwrap();

        store
            .update(&path, |d| {
                d.current_step = None;
                Ok(Update::Discard(()))
            })
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_update_error_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        let store = StateStore::default();
        store.save(&path, &doc()).unwrap();
        let before = std::fs::read(&path).unwrap();

        let result: WorkflowResult<()> = store.update(&path, |d| {
            d.phases.clear();
            Err(WorkflowError::step_not_found("ghost"))
        });

        assert!(result.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_write_notifies_hooks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        let store = StateStore::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        store.on_write(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        store.save(&path, &doc()).unwrap();
        store.update(&path, |_| Ok(Update::Save(()))).unwrap();
        store.update(&path, |_| Ok(Update::Discard(()))).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_is_invalidated_on_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        let cache = Arc::new(WorkflowCache::default());
        let store = StateStore::default().with_cache(Arc::clone(&cache));

        store.save(&path, &doc()).unwrap();
        store.load(&path).unwrap();
        store.load(&path).unwrap();
        assert_eq!(cache.stats().hits, 1);

        store
            .update(&path, |d| {
                d.current_phase = None;
                Ok(Update::Save(()))
            })
            .unwrap();

        assert_eq!(cache.stats().entries, 0);
        assert_eq!(store.load(&path).unwrap().current_phase, None);
    }

    #[test]
    fn test_writes_proceed_when_lock_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topic.json");
        std::fs::create_dir(crate::workflow::lock::lock_path(&path)).unwrap();

        let monitor = Arc::new(PerformanceMonitor::new());
        let store = StateStore::new(Arc::clone(&monitor));
        store.save(&path, &doc()).unwrap();

        let value = store
            .update(&path, |doc| {
                doc.current_step = Some("s2".to_string());
                Ok(Update::Save(7))
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(store.load(&path).unwrap().current_step.as_deref(), Some("s2"));

        let report = monitor.report();
        assert_eq!(report.file_writes, 2);
        assert_eq!(report.lock_acquisitions, 0);
    }
}
