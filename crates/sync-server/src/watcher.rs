//! File watcher with debouncing for pack source changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection.

use anyhow::Result;
use compendium_sync_core::materialize::DELETED_DIR;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Settle time before a change is reported.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path relative to the project root, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// File watcher that monitors the data directory.
pub struct FileWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Track last seen mtime to filter spurious events (Docker volume bug workaround)
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

impl FileWatcher {
    /// Watch `root/<watch_dir>` recursively, reporting paths relative to `root`.
    ///
    /// The watched directory must exist.
    pub fn new(root: PathBuf, watch_dir: &str) -> Result<Self> {
        // Canonicalize to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let root = root.canonicalize().unwrap_or(root);
        let watch_path = root.join(watch_dir);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();

        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        let mtime_cache_clone = Arc::clone(&mtime_cache);

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) =
                            Self::process_event(&event, &root_clone, &mtime_cache_clone)
                        {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&watch_path, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Project-relative, `/`-separated form of `path`.
    fn relative_path(path: &Path, root: &Path) -> Option<String> {
        let relative = path.strip_prefix(root).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => segments.push(segment.to_str()?),
                _ => return None,
            }
        }
        Some(segments.join("/"))
    }

    fn process_event(
        event: &DebouncedEvent,
        root: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;
        let relative = Self::relative_path(path, root)?;

        if !relative.ends_with(".json") {
            return None;
        }

        // Soft-deleted files and hidden files are not pack sources
        if relative
            .split('/')
            .any(|segment| segment == DELETED_DIR || segment.starts_with('.'))
        {
            return None;
        }

        let kind = if path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };

        // Uses the relative path as key so the cache is bounded by the data directory
        let key = PathBuf::from(&relative);
        let mut cache = match mtime_cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        match kind {
            FileEventKind::Modified => {
                if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
                    if cache.get(&key) == Some(&mtime) {
                        // Mtime unchanged - spurious event, skip it
                        return None;
                    }
                    cache.insert(key, mtime);
                }
            }
            FileEventKind::Deleted => {
                cache.remove(&key);
            }
        }

        debug!("File event: {:?} - {}", kind, relative);

        Some(FileEvent {
            path: relative,
            kind,
        })
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/project");
        let path = Path::new("/project").join("data").join("monsters").join("Goblin_abc.json");
        assert_eq!(
            FileWatcher::relative_path(&path, root).as_deref(),
            Some("data/monsters/Goblin_abc.json")
        );
        assert_eq!(FileWatcher::relative_path(Path::new("/elsewhere/x.json"), root), None);
    }
}
