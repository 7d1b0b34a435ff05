//! Workspace file watcher
//!
//! Uses the notify crate to watch the workspace recursively and turns raw
//! notifications into `Added` / `Changed` / `Deleted` events:
//! - events keep the order the OS reports them in (no debouncing)
//! - only files are reported; the root and directories never are
//! - atomic-write temp files and configured ignore names are skipped

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::WatchSection;
use crate::server::file_store::is_temp_file;
use crate::server::path_guard::relative_display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Deleted,
}

/// A normalized filesystem change, `path` relative to the workspace root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Path does not exist: {0}")]
    MissingRoot(String),
    #[error("Failed to watch path: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Path segment names whose subtrees are never reported
    pub ignore: Vec<String>,
}

impl From<&WatchSection> for WatchOptions {
    fn from(section: &WatchSection) -> Self {
        Self {
            ignore: section.ignore.clone(),
        }
    }
}

/// Watches the workspace root for the lifetime of the value.
/// Dropping it closes the OS watch and ends the event thread.
pub struct DirectoryWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl DirectoryWatcher {
    /// Start watching `root` (expected canonical), sending events to `event_tx`
    pub fn start(
        root: PathBuf,
        options: WatchOptions,
        event_tx: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::MissingRoot(root.display().to_string()));
        }

        info!(root = %root.display(), "Starting workspace watcher");

        // Seed before subscribing so pre-existing files report as Changed.
        let tracker = ChangeTracker::new(root.clone(), options.ignore);

        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        std::thread::Builder::new()
            .name("workspace-watcher".to_string())
            .spawn(move || Self::event_loop(rx, event_tx, tracker))
            .map_err(|e| WatchError::Notify(notify::Error::io(e)))?;

        Ok(Self {
            root,
            watcher: Some(watcher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn event_loop(
        rx: std::sync::mpsc::Receiver<notify::Result<Event>>,
        event_tx: mpsc::Sender<ChangeEvent>,
        mut tracker: ChangeTracker,
    ) {
        loop {
            match rx.recv() {
                Ok(Ok(event)) => {
                    for change in tracker.process(&event) {
                        debug!(kind = ?change.kind, path = %change.path, "Workspace change");
                        if event_tx.blocking_send(change).is_err() {
                            debug!("Change receiver dropped, exiting watch loop");
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("Watch error: {}", e);
                }
                Err(_) => {
                    debug!("Watch channel closed, exiting event loop");
                    break;
                }
            }
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        if self.watcher.take().is_some() {
            info!(root = %self.root.display(), "Stopping workspace watcher");
        }
    }
}

/// Classifies notified paths against the set of files seen so far
struct ChangeTracker {
    root: PathBuf,
    ignore: Vec<String>,
    known: HashSet<PathBuf>,
}

impl ChangeTracker {
    fn new(root: PathBuf, ignore: Vec<String>) -> Self {
        let mut tracker = Self {
            root,
            ignore,
            known: HashSet::new(),
        };
        let root = tracker.root.clone();
        tracker.known = tracker.scan_files(&root);
        tracker
    }

    fn process(&mut self, event: &Event) -> Vec<ChangeEvent> {
        if event.need_rescan() {
            let root = self.root.clone();
            return self.reconcile_dir(&root);
        }
        if matches!(event.kind, EventKind::Access(_)) {
            return Vec::new();
        }
        let mut changes = Vec::new();
        for path in &event.paths {
            changes.extend(self.classify(path));
        }
        changes
    }

    fn classify(&mut self, path: &Path) -> Vec<ChangeEvent> {
        if path == self.root || is_temp_file(path) || self.should_ignore(path) {
            return Vec::new();
        }
        let Some(rel) = relative_display(&self.root, path) else {
            return Vec::new();
        };

        match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => self.reconcile_dir(path),
            Ok(_) => {
                let kind = if self.known.insert(path.to_path_buf()) {
                    ChangeKind::Added
                } else {
                    ChangeKind::Changed
                };
                vec![ChangeEvent { kind, path: rel }]
            }
            Err(_) => {
                if self.known.remove(path) {
                    vec![ChangeEvent {
                        kind: ChangeKind::Deleted,
                        path: rel,
                    }]
                } else {
                    // A directory that went away takes its files with it.
                    self.forget_under(path, &HashSet::new())
                }
            }
        }
    }

    /// Bring the known set for `dir` in line with the disk, e.g. after a
    /// whole directory was moved in or out
    fn reconcile_dir(&mut self, dir: &Path) -> Vec<ChangeEvent> {
        let present = self.scan_files(dir);
        let mut changes = self.forget_under(dir, &present);

        let mut added: Vec<&PathBuf> = present.iter().filter(|p| !self.known.contains(*p)).collect();
        added.sort();
        for path in &added {
            if let Some(rel) = relative_display(&self.root, path) {
                changes.push(ChangeEvent {
                    kind: ChangeKind::Added,
                    path: rel,
                });
            }
        }
        let added: Vec<PathBuf> = added.into_iter().cloned().collect();
        self.known.extend(added);
        changes
    }

    /// Drop known files under `dir` that are not in `keep`, reporting each
    fn forget_under(&mut self, dir: &Path, keep: &HashSet<PathBuf>) -> Vec<ChangeEvent> {
        let mut gone: Vec<PathBuf> = self
            .known
            .iter()
            .filter(|p| p.starts_with(dir) && !keep.contains(*p))
            .cloned()
            .collect();
        gone.sort();

        gone.into_iter()
            .filter_map(|path| {
                self.known.remove(&path);
                relative_display(&self.root, &path).map(|rel| ChangeEvent {
                    kind: ChangeKind::Deleted,
                    path: rel,
                })
            })
            .collect()
    }

    fn scan_files(&self, dir: &Path) -> HashSet<PathBuf> {
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.should_ignore(e.path()))
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir() && !is_temp_file(e.path()))
            .map(|e| e.into_path())
            .collect()
    }

    /// True when any segment below the root is an ignored name
    fn should_ignore(&self, path: &Path) -> bool {
        let rel_path = match path.strip_prefix(&self.root) {
            Ok(p) => p,
            Err(_) => return false,
        };

        rel_path.components().any(|component| match component {
            std::path::Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.ignore.iter().any(|ignored| *ignored == name)
            }
            _ => false,
        })
    }
}
