// src/server.rs

//! The dev server: one listener, one HMR channel, one watcher subscription.
//!
//! File events are handled one at a time by a single event loop. For each event the
//! cache entry is invalidated before anything is broadcast, so a client that reacts to
//! an `update` always fetches the new content.

use crate::config::ServerConfig;
use crate::error::{ConfigError, ResolveError};
use crate::event::{WatchEvent, WatchKind};
use crate::hmr::{ErrorData, HmrChannel, HmrMessage};
use crate::transform::TransformCache;
use crate::watcher::FileWatcher;
use crate::web::{self, AppState, Middleware};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for open HTTP connections to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const MODULE_EXTENSIONS: &[&str] = &["ts", "tsx", "jsx", "mts", "cts", "js", "mjs", "css"];

/// Collects middlewares before the server starts.
pub struct DevServerBuilder {
    config: ServerConfig,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl DevServerBuilder {
    /// Adds a middleware. Middlewares run in registration order.
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Binds the listener, starts the watcher and spawns the event loop.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Bind`] if the address is unavailable. A watcher that
    /// fails to start is logged and the server runs without live reload.
    pub async fn start(self) -> Result<DevServer, ConfigError> {
        let config = Arc::new(self.config);
        let addr = config.addr();

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ConfigError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ConfigError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let cache = TransformCache::new();
        let hmr = HmrChannel::new();
        let app = web::router(AppState {
            config: Arc::clone(&config),
            cache: cache.clone(),
            hmr: hmr.clone(),
            middlewares: self.middlewares.into(),
        });

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.changed().await.ok();
                    info!("HTTP listener shutting down gracefully.");
                })
                .await;
            if let Err(e) = result {
                error!("HTTP server exited with error: {}", e);
            }
        });
        info!("Dev server listening on http://{}", local_addr);

        let (watcher, event_loop) =
            match FileWatcher::start(&config.watch_roots(), &config.ignore, config.debounce) {
                Ok((watcher, events)) => {
                    let event_loop = tokio::spawn(run_event_loop(
                        Arc::clone(&config),
                        cache.clone(),
                        hmr.clone(),
                        events,
                    ));
                    (Some(watcher), Some(event_loop))
                }
                Err(e) => {
                    warn!("{}; serving without live reload", e);
                    (None, None)
                }
            };

        Ok(DevServer {
            config,
            local_addr,
            cache,
            hmr,
            watcher,
            event_loop,
            shutdown_tx,
            server_task,
        })
    }
}

/// A running dev server. Call [`DevServer::stop`] to shut it down.
pub struct DevServer {
    config: Arc<ServerConfig>,
    local_addr: SocketAddr,
    cache: TransformCache,
    hmr: HmrChannel,
    watcher: Option<FileWatcher>,
    event_loop: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<()>,
}

impl DevServer {
    pub fn builder(config: ServerConfig) -> DevServerBuilder {
        DevServerBuilder {
            config,
            middlewares: Vec::new(),
        }
    }

    /// Starts a server with no middlewares.
    pub async fn start(config: ServerConfig) -> Result<Self, ConfigError> {
        Self::builder(config).start().await
    }

    /// The address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cache(&self) -> &TransformCache {
        &self.cache
    }

    pub fn hmr(&self) -> &HmrChannel {
        &self.hmr
    }

    /// Shuts down in dependency order: watcher, event loop, HMR connections, cache,
    /// then the HTTP listener.
    pub async fn stop(mut self) {
        info!("Dev server stopping...");
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        if let Some(event_loop) = self.event_loop.take() {
            if let Err(e) = event_loop.await {
                error!("Event loop task failed: {}", e);
            }
        }

        self.hmr.close_all();
        self.cache.clear();

        if self.shutdown_tx.send(true).is_err() {
            debug!("HTTP server already gone");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("HTTP server task failed: {}", e),
            Err(_) => {
                warn!("HTTP connections still open after {:?}; aborting", SHUTDOWN_GRACE);
                self.server_task.abort();
            }
        }
        info!("Dev server stopped.");
    }
}

/// Handles watch events one at a time until the watcher's stream ends.
///
/// Sequential handling keeps the invalidation of a file ahead of the broadcast
/// describing it.
///
/// # Arguments
/// - `config`: Used to classify events.
/// - `cache`: Invalidated and recompiled per event.
/// - `hmr`: Receives the resulting messages.
/// - `events`: The watcher's receiver; `None` from it ends the loop.
async fn run_event_loop(
    config: Arc<ServerConfig>,
    cache: TransformCache,
    hmr: HmrChannel,
    mut events: mpsc::Receiver<WatchEvent>,
) {
    while let Some(event) = events.recv().await {
        let message = handle_watch_event(&config, &cache, &hmr, event).await;
        debug!("Broadcast {} message", message.kind());
    }
    debug!("Watch event stream closed. Event loop exiting.");
}

/// Invalidates, classifies and broadcasts one file event. Returns the message sent.
pub async fn handle_watch_event(
    config: &ServerConfig,
    cache: &TransformCache,
    hmr: &HmrChannel,
    event: WatchEvent,
) -> HmrMessage {
    cache.invalidate(&event.path);
    let message = classify(config, cache, &event).await;
    let delivered = hmr.broadcast(&message);
    info!(
        path = %event.path.display(),
        kind = ?event.kind,
        message = message.kind(),
        clients = delivered,
        "File change handled"
    );
    message
}

/// Decides how clients should react to `event`.
///
/// Removals, HTML, assets that are not modules and entry points reload the page.
/// Anything else is recompiled right away: success is an `update`, failure an `error`.
pub async fn classify(config: &ServerConfig, cache: &TransformCache, event: &WatchEvent) -> HmrMessage {
    let timestamp = event.timestamp;
    let (url_path, in_public) = match url_path_for(config, &event.path) {
        Some(found) => found,
        None => {
            return HmrMessage::Reload {
                timestamp,
                path: None,
            }
        }
    };
    let reload = |path: String| HmrMessage::Reload {
        timestamp,
        path: Some(path),
    };

    if !config.hmr || event.kind == WatchKind::Removed || !is_module(&event.path) {
        return reload(url_path);
    }
    if !in_public && event.path.strip_prefix(&config.root).is_ok_and(|rel| config.is_entry(rel)) {
        return reload(url_path);
    }
    if in_public {
        // Served raw, so there is nothing to compile.
        return HmrMessage::Update {
            path: url_path,
            timestamp,
        };
    }

    match cache.resolve(&event.path).await {
        Ok(_) => HmrMessage::Update {
            path: url_path,
            timestamp,
        },
        Err(ResolveError::NotFound(_)) => reload(url_path),
        Err(e) => {
            let message = match e {
                ResolveError::Compile(compile) => compile.message,
                other => other.to_string(),
            };
            warn!("Compile failed for {}: {}", url_path, message);
            HmrMessage::Error {
                data: ErrorData {
                    path: url_path,
                    message,
                },
            }
        }
    }
}

/// Maps a file on disk to the path a browser requests for it.
///
/// The public directory is checked first, since it is served ahead of the root.
///
/// # Arguments
/// - `config`: Supplies the root and public directory.
/// - `file`: Absolute path from a watch event.
///
/// # Returns
/// The `/`-separated URL path without its leading slash, and whether the file is
/// served from the public directory. `None` for files outside both.
fn url_path_for(config: &ServerConfig, file: &Path) -> Option<(String, bool)> {
    let (relative, in_public) = match file.strip_prefix(&config.public_dir) {
        Ok(relative) => (relative, true),
        Err(_) => (file.strip_prefix(&config.root).ok()?, false),
    };
    let segments: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some((segments.join("/"), in_public))
}

/// Whether the client runtime can swap `path` in place.
fn is_module(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MODULE_EXTENSIONS.contains(&ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use std::fs;
    use tempfile::TempDir;

    fn project() -> (TempDir, ServerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("public")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("public/index.html"), "<html></html>").unwrap();
        fs::write(root.join("public/site.css"), "body {}").unwrap();
        fs::write(root.join("src/main.ts"), "import './app';").unwrap();
        fs::write(root.join("src/app.ts"), "export const n: number = 1;").unwrap();
        fs::write(root.join("src/style.css"), "h1 {}").unwrap();
        fs::write(root.join("src/broken.ts"), "export const = ;").unwrap();
        fs::write(root.join("src/logo.svg"), "<svg/>").unwrap();
        let config = ServerConfig::new(root).unwrap();
        (dir, config)
    }

    fn event(config: &ServerConfig, relative: &str, kind: WatchKind) -> WatchEvent {
        WatchEvent::new(config.root.join(relative), kind)
    }

    #[tokio::test]
    async fn test_leaf_module_change_is_an_update() {
        let (_dir, config) = project();
        let cache = TransformCache::new();

        let message = classify(&config, &cache, &event(&config, "src/app.ts", WatchKind::Changed)).await;
        match message {
            HmrMessage::Update { path, .. } => assert_eq!(path, "src/app.ts"),
            other => panic!("expected update, got {:?}", other),
        }
        // Eagerly compiled, so the next request is a cache hit.
        assert!(cache.contains(&config.root.join("src/app.ts")));
    }

    #[tokio::test]
    async fn test_css_change_is_an_update() {
        let (_dir, config) = project();
        let cache = TransformCache::new();

        let root_css = classify(&config, &cache, &event(&config, "src/style.css", WatchKind::Changed)).await;
        assert_eq!(root_css.kind(), "update");

        let public_css = classify(&config, &cache, &event(&config, "public/site.css", WatchKind::Changed)).await;
        match public_css {
            HmrMessage::Update { path, .. } => assert_eq!(path, "site.css"),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reload_cases() {
        let (_dir, config) = project();
        let cache = TransformCache::new();

        for (relative, kind) in [
            ("public/index.html", WatchKind::Changed),
            ("src/main.ts", WatchKind::Changed),
            ("src/logo.svg", WatchKind::Changed),
            ("src/app.ts", WatchKind::Removed),
        ] {
            let message = classify(&config, &cache, &event(&config, relative, kind)).await;
            assert_eq!(message.kind(), "reload", "{} should reload", relative);
        }
    }

    #[tokio::test]
    async fn test_removed_reload_carries_path() {
        let (_dir, config) = project();
        let message = classify(
            &config,
            &TransformCache::new(),
            &event(&config, "src/app.ts", WatchKind::Removed),
        )
        .await;
        match message {
            HmrMessage::Reload { path, .. } => assert_eq!(path.as_deref(), Some("src/app.ts")),
            other => panic!("expected reload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hmr_disabled_always_reloads() {
        let (dir, _) = project();
        let config = ServerConfig::resolve(FileConfig {
            root: Some(dir.path().to_path_buf()),
            hmr: Some(false),
            ..FileConfig::defaults()
        })
        .unwrap();

        let message = classify(
            &config,
            &TransformCache::new(),
            &event(&config, "src/app.ts", WatchKind::Changed),
        )
        .await;
        assert_eq!(message.kind(), "reload");
    }

    #[tokio::test]
    async fn test_explicit_entries_replace_default_stems() {
        let (dir, _) = project();
        let config = ServerConfig::resolve(FileConfig {
            root: Some(dir.path().to_path_buf()),
            entries: Some(vec!["src/app.ts".to_string()]),
            ..FileConfig::defaults()
        })
        .unwrap();
        let cache = TransformCache::new();

        let app = classify(&config, &cache, &event(&config, "src/app.ts", WatchKind::Changed)).await;
        assert_eq!(app.kind(), "reload");
        let main = classify(&config, &cache, &event(&config, "src/main.ts", WatchKind::Changed)).await;
        assert_eq!(main.kind(), "update");
    }

    #[tokio::test]
    async fn test_compile_failure_is_an_error_with_path() {
        let (_dir, config) = project();
        let cache = TransformCache::new();

        let message = classify(&config, &cache, &event(&config, "src/broken.ts", WatchKind::Changed)).await;
        match message {
            HmrMessage::Error { data } => {
                assert_eq!(data.path, "src/broken.ts");
                assert!(!data.message.is_empty());
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_watch_event_invalidates_before_broadcast() {
        let (_dir, config) = project();
        let cache = TransformCache::new();
        let hmr = HmrChannel::new();
        let app = config.root.join("src/app.ts");

        let first = cache.resolve(&app).await.unwrap();
        fs::write(&app, "export const n: number = 2;").unwrap();

        let message = handle_watch_event(&config, &cache, &hmr, WatchEvent::new(app.clone(), WatchKind::Changed)).await;
        assert_eq!(message.kind(), "update");

        let second = cache.resolve(&app).await.unwrap();
        assert_ne!(first.code, second.code);
        assert!(String::from_utf8_lossy(&second.code).contains('2'));
    }

    #[tokio::test]
    async fn test_handle_watch_event_with_no_clients() {
        let (_dir, config) = project();
        let message = handle_watch_event(
            &config,
            &TransformCache::new(),
            &HmrChannel::new(),
            event(&config, "public/index.html", WatchKind::Changed),
        )
        .await;
        assert_eq!(message.kind(), "reload");
    }

    #[tokio::test]
    async fn test_bind_failure_is_a_config_error() {
        let (dir, _) = project();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ServerConfig::resolve(FileConfig {
            root: Some(dir.path().to_path_buf()),
            port: Some(port),
            ..FileConfig::defaults()
        })
        .unwrap();

        match DevServer::start(config).await {
            Err(ConfigError::Bind { addr, .. }) => assert!(addr.ends_with(&port.to_string())),
            Err(other) => panic!("expected bind error, got {}", other),
            Ok(_) => panic!("bind should fail on a taken port"),
        }
    }
}
