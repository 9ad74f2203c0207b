// src/watcher.rs
use crate::error::WatchError;
use crate::event::{WatchEvent, WatchKind};
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// How often the watcher thread checks for a stop request while idle.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the channel between the watcher thread and the async side.
const EVENT_CHANNEL_CAPACITY: usize = 256;

type NotifyDebouncer = Debouncer<RecommendedWatcher, FileIdMap>;

/// Decides which paths are worth reporting.
#[derive(Debug, Clone)]
pub struct PathFilter {
    roots: Vec<PathBuf>,
    patterns: Vec<String>,
}

impl PathFilter {
    pub fn new(roots: Vec<PathBuf>, patterns: Vec<String>) -> Self {
        Self { roots, patterns }
    }

    /// True for paths outside every root, inside an ignored directory, matching a
    /// `*.ext` pattern, or with a hidden component (editor swap and lock files).
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Some(relative) = self
            .roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
        else {
            return true;
        };

        for component in relative.components() {
            let Some(name) = component.as_os_str().to_str() else {
                continue;
            };
            if name.starts_with('.') || self.patterns.iter().any(|p| p == name) {
                return true;
            }
        }

        let path_str = relative.to_string_lossy();
        self.patterns
            .iter()
            .filter_map(|p| p.strip_prefix('*'))
            .any(|suffix| path_str.ends_with(suffix))
    }

    fn is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| root == path)
    }
}

/// Recursive, debounced file system watcher.
///
/// The notify debouncer lives on a dedicated thread; events reach the async side
/// through the receiver returned by [`FileWatcher::start`]. The receiver yields
/// `None` once the watcher has stopped.
pub struct FileWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Starts watching `roots`.
    ///
    /// Each root is watched non-recursively at its top level, and each of its
    /// non-ignored subdirectories recursively. A subtree that cannot be watched is
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the OS watcher itself cannot be created.
    pub fn start(
        roots: &[PathBuf],
        ignore_patterns: &[String],
        debounce: Duration,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>), WatchError> {
        let filter = PathFilter::new(roots.to_vec(), ignore_patterns.to_vec());
        let (debouncer_tx, debouncer_rx) = std::sync::mpsc::channel::<DebounceEventResult>();

        let mut debouncer = new_debouncer(debounce, None, debouncer_tx).map_err(|source| WatchError {
            path: roots.first().cloned().unwrap_or_default(),
            source,
        })?;
        let mut subtrees = Subtrees::default();
        for root in roots {
            subtrees.watch_tree(&mut debouncer, root, &filter);
        }
        info!("File watcher started for {:?} (debounce {:?})", roots, debounce);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("hotserve-watcher".to_string())
            .spawn(move || {
                run_watcher_thread(debouncer, subtrees, debouncer_rx, filter, event_tx, thread_stop)
            })
            .map_err(|e| WatchError {
                path: roots.first().cloned().unwrap_or_default(),
                source: notify::Error::io(e),
            })?;

        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            event_rx,
        ))
    }

    /// Releases every OS watch handle and waits for the watcher thread to exit.
    pub async fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => info!("File watcher stopped."),
                Ok(Err(_)) => error!("File watcher thread panicked."),
                Err(e) => error!("Failed to join file watcher thread: {}", e),
            }
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn run_watcher_thread(
    mut debouncer: NotifyDebouncer,
    mut subtrees: Subtrees,
    debouncer_rx: std::sync::mpsc::Receiver<DebounceEventResult>,
    filter: PathFilter,
    event_tx: mpsc::Sender<WatchEvent>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        match debouncer_rx.recv_timeout(STOP_POLL_INTERVAL) {
            Ok(Ok(events)) => {
                subtrees.sync(&mut debouncer, &events, &filter);
                for event in collapse(&events, &filter) {
                    debug!("[WatcherThread] Produced event: {:?}", event);
                    if event_tx.blocking_send(event).is_err() {
                        debug!("[WatcherThread] Event receiver dropped. Watcher thread exiting.");
                        return;
                    }
                }
            }
            Ok(Err(errors)) => {
                for error in errors {
                    error!("[WatcherThread] Debouncer reported error: {:?}", error);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("[WatcherThread] Debouncer channel disconnected. Watcher thread exiting.");
                return;
            }
        }
    }
    debug!("[WatcherThread] Stop requested.");
    // Dropping the debouncer here removes all OS watches.
}

/// The top-level directories that currently hold their own recursive watch.
///
/// Roots are only watched one level deep, so a directory that appears directly under
/// a root (created, renamed or moved in) needs a new watch, and one that disappears
/// gives its watch up.
#[derive(Debug, Default)]
struct Subtrees {
    watched: HashSet<PathBuf>,
}

impl Subtrees {
    /// Watches `root` non-recursively and each of its non-ignored subdirectories
    /// recursively.
    ///
    /// # Arguments
    /// - `debouncer`: The debouncer whose watcher receives the new watches.
    /// - `root`: Directory to watch.
    /// - `filter`: Decides which subdirectories are skipped.
    fn watch_tree(&mut self, debouncer: &mut NotifyDebouncer, root: &Path, filter: &PathFilter) {
        if !add_watch(debouncer, root, RecursiveMode::NonRecursive) {
            return;
        }

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}; only its top level is watched", root.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && !filter.is_ignored(&path) && add_watch(debouncer, &path, RecursiveMode::Recursive) {
                self.watched.insert(path);
            }
        }
    }

    /// Brings the set of subtree watches in line with a batch of events.
    ///
    /// Any event kind counts: what matters is whether a top-level path is a directory
    /// now. Runs before the batch is collapsed, so the walk in [`collapse`] happens
    /// after the new watch is in place and nothing written in between is lost.
    fn sync(&mut self, debouncer: &mut NotifyDebouncer, events: &[DebouncedEvent], filter: &PathFilter) {
        for path in events.iter().flat_map(|event| event.paths.iter()) {
            let top_level = path.parent().is_some_and(|parent| filter.is_root(parent));
            if !top_level || filter.is_ignored(path) {
                continue;
            }
            if path.is_dir() {
                if !self.watched.contains(path) && add_watch(debouncer, path, RecursiveMode::Recursive) {
                    self.watched.insert(path.clone());
                }
            } else if !path.exists() && self.watched.remove(path) {
                debouncer.cache().remove_root(path);
                debug!("Subtree {} is gone", path.display());
            }
        }
    }
}

/// Adds one OS watch. A failure is logged as a [`WatchError`] and reported as `false`.
fn add_watch(debouncer: &mut NotifyDebouncer, path: &Path, mode: RecursiveMode) -> bool {
    match debouncer.watcher().watch(path, mode) {
        Ok(()) => {
            debouncer.cache().add_root(path, mode);
            debug!("Watching {} ({:?})", path.display(), mode);
            true
        }
        Err(source) => {
            let err = WatchError {
                path: path.to_path_buf(),
                source,
            };
            warn!("{}; continuing without it", err);
            false
        }
    }
}

/// The raw kind a notify event implies for the path at `index` in its path list.
fn raw_kind(kind: &EventKind, index: usize) -> Option<WatchKind> {
    match kind {
        EventKind::Create(_) => Some(WatchKind::Added),
        EventKind::Remove(RemoveKind::Folder) => None,
        EventKind::Remove(_) => Some(WatchKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(WatchKind::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(WatchKind::Added),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Some(if index == 0 {
            WatchKind::Removed
        } else {
            WatchKind::Added
        }),
        EventKind::Modify(_) => Some(WatchKind::Changed),
        _ => None,
    }
}

/// Whether the path at `index` of an event has just appeared at its location.
fn appeared(kind: &EventKind, index: usize) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => index == 1,
        _ => false,
    }
}

/// Non-ignored files below `dir`.
fn files_under(dir: &Path, filter: &PathFilter) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !filter.is_ignored(entry.path()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// Collapses one debounced batch into at most one event per file.
///
/// The latest raw kind wins, then the result is checked against the disk: a path
/// that is gone is `Removed`, and a path reported removed that exists again (atomic
/// saves) is `Changed`. Directories are dropped, but a directory that was created or
/// moved in contributes an `Added` event for every file already inside it, since
/// those files may predate any watch on the directory.
pub fn collapse(events: &[DebouncedEvent], filter: &PathFilter) -> Vec<WatchEvent> {
    let mut order: Vec<PathBuf> = Vec::new();
    let mut latest: HashMap<PathBuf, WatchKind> = HashMap::new();
    let mut new_dirs: Vec<PathBuf> = Vec::new();

    for event in events {
        for (index, path) in event.paths.iter().enumerate() {
            if filter.is_ignored(path) {
                continue;
            }
            if appeared(&event.kind, index) && path.is_dir() && !new_dirs.contains(path) {
                new_dirs.push(path.clone());
            }
            let Some(kind) = raw_kind(&event.kind, index) else {
                continue;
            };
            if latest.insert(path.clone(), kind).is_none() {
                order.push(path.clone());
            }
        }
    }

    for dir in &new_dirs {
        for file in files_under(dir, filter) {
            if !latest.contains_key(&file) {
                latest.insert(file.clone(), WatchKind::Added);
                order.push(file);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|path| {
            let raw = latest.remove(&path)?;
            let kind = match std::fs::metadata(&path) {
                Ok(metadata) if metadata.is_dir() => return None,
                Ok(_) if raw == WatchKind::Removed => WatchKind::Changed,
                Ok(_) => raw,
                Err(_) => WatchKind::Removed,
            };
            Some(WatchEvent::new(path, kind))
        })
        .collect()
}
