// src/event.rs
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What happened to a watched file.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Added,
    Changed,
    Removed,
}

/// A debounced file system change, produced by the watcher and consumed right away
/// by the dev server.
///
/// # Fields
/// - `path`: Absolute path of the affected file.
/// - `kind`: The latest state observed for that path within the debounce window.
/// - `timestamp`: Milliseconds since the Unix epoch when the event was emitted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
    pub timestamp: u64,
}

impl WatchEvent {
    pub fn new(path: PathBuf, kind: WatchKind) -> Self {
        Self {
            path,
            kind,
            timestamp: now_ms(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
