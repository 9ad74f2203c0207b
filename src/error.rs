// src/error.rs

//! Error types shared across the dev server.
//!
//! Only [`ConfigError`] is fatal. Everything else is contained at the request,
//! connection or subtree where it happened.

use std::path::PathBuf;
use thiserror::Error;

/// Startup failures. Reported once, then the process exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("project root {} is not a readable directory: {reason}", path.display())]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("public directory {} is not a readable directory: {reason}", path.display())]
    InvalidPublicDir { path: PathBuf, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// A transform failure on one file. Cloned to every caller awaiting the same compile.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to compile {}: {message}", path.display())]
pub struct CompileError {
    /// Absolute path of the file that failed.
    pub path: PathBuf,
    /// Human-readable diagnostic.
    pub message: String,
}

/// Why the transform cache could not produce a module.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("module not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl ResolveError {
    pub(crate) fn from_io(path: PathBuf, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ResolveError::NotFound(path)
        } else {
            ResolveError::Read {
                path,
                message: err.to_string(),
            }
        }
    }
}

/// A subtree that could not be watched.
#[derive(Debug, Error)]
#[error("cannot watch {}: {source}", path.display())]
pub struct WatchError {
    pub path: PathBuf,
    #[source]
    pub source: notify::Error,
}

/// A client socket that could not be written to.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(u64),

    #[error("websocket send failed: {0}")]
    Send(#[from] axum::Error),

    #[error("failed to serialize HMR message: {0}")]
    Encode(#[from] serde_json::Error),
}
