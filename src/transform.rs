// src/transform.rs

//! On-demand module compilation with a fingerprinted, coalescing cache.
//!
//! A request for a path stats the file and compares the result against the cached
//! [`Fingerprint`]. A match is served from memory. A miss reads the file and runs
//! the transform selected by its [`SourceKind`]. Concurrent misses on the same path
//! share one compile.

use crate::error::{CompileError, ResolveError};
use axum::body::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use oxc_allocator::Allocator;
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Content type of every transformed module.
pub const JAVASCRIPT: &str = "application/javascript; charset=utf-8";

/// The closed set of source languages the cache knows how to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// `.ts`, `.mts`, `.cts`
    TypeScript,
    /// `.tsx`
    Tsx,
    /// `.jsx`
    Jsx,
    /// Served byte for byte.
    Passthrough,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()).unwrap_or("") {
            "ts" | "mts" | "cts" => SourceKind::TypeScript,
            "tsx" => SourceKind::Tsx,
            "jsx" => SourceKind::Jsx,
            _ => SourceKind::Passthrough,
        }
    }

    pub fn needs_transform(self) -> bool {
        self != SourceKind::Passthrough
    }

    /// Produces the served bytes for `source`.
    fn transform(self, path: &Path, source: Vec<u8>) -> Result<Bytes, CompileError> {
        let source_type = match self {
            SourceKind::TypeScript => SourceType::ts(),
            SourceKind::Tsx => SourceType::tsx(),
            SourceKind::Jsx => SourceType::jsx(),
            SourceKind::Passthrough => return Ok(Bytes::from(source)),
        };
        strip_types(path, source, source_type).map(Bytes::from)
    }

    fn content_type(self, path: &Path) -> &'static str {
        match self {
            SourceKind::Passthrough => crate::web::content_type_for(path),
            _ => JAVASCRIPT,
        }
    }
}

/// Parses TypeScript/JSX and prints it back as plain JavaScript.
fn strip_types(path: &Path, source: Vec<u8>, source_type: SourceType) -> Result<String, CompileError> {
    let source_text = String::from_utf8(source).map_err(|e| CompileError {
        path: path.to_path_buf(),
        message: format!("source is not valid UTF-8: {}", e),
    })?;

    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, &source_text, source_type).parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        return Err(CompileError {
            path: path.to_path_buf(),
            message: join_diagnostics(&parsed.errors, "parser gave up"),
        });
    }

    let mut program = parsed.program;
    let scoping = SemanticBuilder::new()
        .build(&program)
        .semantic
        .into_scoping();
    // Automatic JSX runtime: JSX output imports `react/jsx-runtime`, which the page
    // maps to a real URL with an import map.
    let options = TransformOptions::default();
    let transformed =
        Transformer::new(&allocator, path, &options).build_with_scoping(scoping, &mut program);
    if !transformed.errors.is_empty() {
        return Err(CompileError {
            path: path.to_path_buf(),
            message: join_diagnostics(&transformed.errors, "transform failed"),
        });
    }

    Ok(Codegen::new().build(&program).code)
}

fn join_diagnostics<D: std::fmt::Display>(diagnostics: &[D], fallback: &str) -> String {
    if diagnostics.is_empty() {
        return fallback.to_string();
    }
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cheap staleness check: modification time plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

/// A served module.
#[derive(Debug)]
pub struct CompiledModule {
    pub code: Bytes,
    pub content_type: &'static str,
    pub kind: SourceKind,
    /// Fingerprint of the file as it was before it was read.
    pub fingerprint: Fingerprint,
}

type CompileFuture = Shared<BoxFuture<'static, Result<Arc<CompiledModule>, ResolveError>>>;

struct InFlight {
    ticket: u64,
    fingerprint: Fingerprint,
    future: CompileFuture,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, Arc<CompiledModule>>,
    in_flight: HashMap<PathBuf, InFlight>,
    next_ticket: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<CacheState>,
    compiles: AtomicUsize,
}

/// Memoizing module compiler keyed by absolute path. Cheap to clone.
#[derive(Clone, Default)]
pub struct TransformCache {
    inner: Arc<Inner>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled form of the file at `path`, compiling it if the cached
    /// copy is missing or stale.
    pub async fn resolve(&self, path: &Path) -> Result<Arc<CompiledModule>, ResolveError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(ResolveError::NotFound(path.to_path_buf())),
            Err(e) => {
                let err = ResolveError::from_io(path.to_path_buf(), e);
                if matches!(err, ResolveError::NotFound(_)) {
                    self.invalidate(path);
                }
                return Err(err);
            }
        };
        let fingerprint = Fingerprint::of(&metadata);

        let future = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.entries.get(path) {
                if entry.fingerprint == fingerprint {
                    return Ok(Arc::clone(entry));
                }
                debug!(path = %path.display(), "Cached module is stale");
                state.entries.remove(path);
            }

            match state.in_flight.get(path) {
                Some(in_flight) if in_flight.fingerprint == fingerprint => {
                    debug!(path = %path.display(), "Joining in-flight compile");
                    in_flight.future.clone()
                }
                _ => {
                    state.next_ticket += 1;
                    let ticket = state.next_ticket;
                    let future = self.spawn_compile(path.to_path_buf(), fingerprint, ticket);
                    state.in_flight.insert(
                        path.to_path_buf(),
                        InFlight {
                            ticket,
                            fingerprint,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    /// Starts a compile that runs to completion even if every caller goes away.
    fn spawn_compile(&self, path: PathBuf, fingerprint: Fingerprint, ticket: u64) -> CompileFuture {
        let inner = Arc::clone(&self.inner);
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            let result = compile(&inner, &task_path, fingerprint).await;

            let mut state = inner.state.lock();
            let still_current = state
                .in_flight
                .get(&task_path)
                .is_some_and(|in_flight| in_flight.ticket == ticket);
            if still_current {
                state.in_flight.remove(&task_path);
                if let Ok(module) = &result {
                    state.entries.insert(task_path.clone(), Arc::clone(module));
                }
            } else {
                debug!(path = %task_path.display(), "Compile finished after invalidation; result not cached");
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ResolveError::Compile(CompileError {
                    path,
                    message: format!("transform task failed: {}", e),
                })),
            }
        }
        .boxed()
        .shared()
    }

    /// Drops the entry for `path` and detaches any compile in flight for it.
    /// Returns whether anything was dropped.
    pub fn invalidate(&self, path: &Path) -> bool {
        let mut state = self.inner.state.lock();
        let had_entry = state.entries.remove(path).is_some();
        let had_in_flight = state.in_flight.remove(path).is_some();
        had_entry || had_in_flight
    }

    /// Evicts everything.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.in_flight.clear();
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.state.lock().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many transforms have actually run, cache hits and joined compiles excluded.
    pub fn compile_count(&self) -> usize {
        self.inner.compiles.load(Ordering::SeqCst)
    }
}

async fn compile(
    inner: &Inner,
    path: &Path,
    fingerprint: Fingerprint,
) -> Result<Arc<CompiledModule>, ResolveError> {
    let source = tokio::fs::read(path)
        .await
        .map_err(|e| ResolveError::from_io(path.to_path_buf(), e))?;
    let kind = SourceKind::from_path(path);
    inner.compiles.fetch_add(1, Ordering::SeqCst);

    let code = if kind.needs_transform() {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || kind.transform(&owned, source))
            .await
            .map_err(|e| CompileError {
                path: path.to_path_buf(),
                message: format!("transform task failed: {}", e),
            })?
    } else {
        kind.transform(path, source)
    };

    let code = code.map_err(|e| {
        warn!("{}", e);
        e
    })?;
    debug!(path = %path.display(), ?kind, bytes = code.len(), "Compiled module");

    Ok(Arc::new(CompiledModule {
        code,
        content_type: kind.content_type(path),
        kind,
        fingerprint,
    }))
}
