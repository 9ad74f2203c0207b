// src/web.rs
use crate::config::ServerConfig;
use crate::error::ResolveError;
use crate::hmr::{self, HmrChannel};
use crate::transform::TransformCache;
use axum::{
    body::Body,
    extract::{FromRef, Request, State},
    http::{header, request::Parts, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::future::BoxFuture;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing::{debug, warn};

/// Path of the HMR client runtime module.
pub const HMR_CLIENT_PATH: &str = "/@hmr/client.js";

const HMR_CLIENT_SCRIPT: &str = include_str!("../static/hmr-client.js");

/// A request hook that runs before the built-in resolution steps.
///
/// Returning `Some` answers the request; `None` passes it on to the next middleware
/// and finally to the static/module pipeline.
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, request: &'a Parts) -> BoxFuture<'a, Option<Response>>;
}

/// Shared application state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub cache: TransformCache,
    pub hmr: HmrChannel,
    pub middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl FromRef<AppState> for HmrChannel {
    fn from_ref(state: &AppState) -> Self {
        state.hmr.clone()
    }
}

/// Builds the full router: HMR endpoints (when enabled), the resolution fallback,
/// and the compression and CORS layers.
pub fn router(state: AppState) -> Router {
    let config = Arc::clone(&state.config);

    let mut app = Router::new();
    if config.hmr {
        app = app
            .route(hmr::HMR_PATH, get(hmr::websocket_handler))
            .route(HMR_CLIENT_PATH, get(serve_hmr_client));
    }
    let mut app = app.fallback(handle_request).with_state(state);

    if config.compress {
        app = app.layer(CompressionLayer::new());
    }
    if config.cors {
        // Fixed, permissive policy for local development.
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    app
}

/// Serves the embedded HMR client runtime.
async fn serve_hmr_client() -> Response {
    respond(StatusCode::OK, "application/javascript; charset=utf-8", HMR_CLIENT_SCRIPT)
}

/// Resolves one request.
///
/// Order: middlewares, the method check, the public directory, the transform cache,
/// then 404.
///
/// # Arguments
/// - `state`: Shared configuration, cache, HMR channel and middlewares.
/// - `request`: The incoming request. Only its head is used.
///
/// # Returns
/// The first middleware response, or the pipeline's response.
async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();

    for middleware in state.middlewares.iter() {
        if let Some(response) = middleware.handle(&parts).await {
            return response;
        }
    }

    if parts.method != Method::GET && parts.method != Method::HEAD {
        return respond(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain; charset=utf-8",
            "Method not allowed",
        );
    }

    let url_path = parts.uri.path();
    let Some(relative) = sanitize(url_path) else {
        debug!("Rejected request path {}", url_path);
        return not_found(url_path);
    };

    if let Some(file) = find_file(&state.config.public_dir, &relative).await {
        return serve_static(&state, &file).await;
    }
    if let Some(file) = find_file(&state.config.root, &relative).await {
        return serve_module(&state, &file, url_path).await;
    }
    not_found(url_path)
}

/// Serves a file from the public directory as-is.
///
/// # Arguments
/// - `state`: Used for the injection settings.
/// - `file`: Absolute path of an existing file under the public directory.
///
/// # Returns
/// 200 with the file's bytes (HTML gets the client script when injection is on),
/// 404 if the file vanished since it was found, or 500 on any other read error.
async fn serve_static(state: &AppState, file: &Path) -> Response {
    match tokio::fs::read(file).await {
        Ok(bytes) => {
            let content_type = content_type_for(file);
            let body = if state.config.hmr && state.config.inject_client && is_html(content_type) {
                inject_client_script(&bytes)
            } else {
                bytes
            };
            respond(StatusCode::OK, content_type, body)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found(&file.display().to_string()),
        Err(e) => {
            warn!("Failed to read file {}: {}", file.display(), e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                format!("Failed to read {}: {}", file.display(), e),
            )
        }
    }
}

/// Serves a file from the project root through the transform cache.
///
/// # Arguments
/// - `state`: Holds the cache.
/// - `file`: Absolute path of an existing file under the root.
/// - `url_path`: The requested path, echoed in 404 bodies.
///
/// # Returns
/// 200 with the compiled output, 404 if the file is gone, or 500 with the
/// diagnostic as a `text/plain` body.
async fn serve_module(state: &AppState, file: &Path, url_path: &str) -> Response {
    match state.cache.resolve(file).await {
        Ok(module) => {
            let body = if state.config.hmr && state.config.inject_client && is_html(module.content_type) {
                Body::from(inject_client_script(&module.code))
            } else {
                Body::from(module.code.clone())
            };
            respond(StatusCode::OK, module.content_type, body)
        }
        Err(ResolveError::NotFound(_)) => not_found(url_path),
        Err(e) => {
            // The diagnostic doubles as the response body so it shows up in devtools.
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                e.to_string(),
            )
        }
    }
}

/// Builds a response with a content type and `Cache-Control: no-cache`.
fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body.into(),
    )
        .into_response()
}

fn not_found(url_path: &str) -> Response {
    respond(
        StatusCode::NOT_FOUND,
        "text/plain; charset=utf-8",
        format!("File not found: {}", url_path),
    )
}

/// Turns a URL path into a relative filesystem path.
///
/// Rejects parent-directory segments and hidden components (`.env`, `.git/config`).
fn sanitize(url_path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in url_path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.starts_with('.') => return None,
            s if s.contains('\\') => return None,
            s => relative.push(s),
        }
    }
    // A segment like "C:" would make the path absolute on Windows.
    if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(relative)
}

/// Looks up the file `relative` names under `base`.
///
/// # Arguments
/// - `base`: The public directory or the project root.
/// - `relative`: A path already checked by [`sanitize`].
///
/// # Returns
/// The file itself, a directory's `index.html`, or `None` when neither exists.
async fn find_file(base: &Path, relative: &Path) -> Option<PathBuf> {
    let candidate = base.join(relative);
    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    if metadata.is_file() {
        return Some(candidate);
    }
    if metadata.is_dir() {
        let index = candidate.join("index.html");
        if tokio::fs::metadata(&index).await.ok()?.is_file() {
            return Some(index);
        }
    }
    None
}

fn is_html(content_type: &str) -> bool {
    content_type.starts_with("text/html")
}

/// Adds the HMR client module to an HTML page.
///
/// Goes before `</head>`, else before `</body>`, else at the end.
pub fn inject_client_script(html: &[u8]) -> Vec<u8> {
    let html = String::from_utf8_lossy(html);
    let script_tag = format!(r#"<script type="module" src="{}"></script>"#, HMR_CLIENT_PATH);

    for marker in ["</head>", "</body>"] {
        if let Some(pos) = html.find(marker) {
            let mut result = String::with_capacity(html.len() + script_tag.len() + 4);
            result.push_str(&html[..pos]);
            result.push_str("  ");
            result.push_str(&script_tag);
            result.push('\n');
            result.push_str(&html[pos..]);
            return result.into_bytes();
        }
    }

    let mut result = html.into_owned();
    result.push('\n');
    result.push_str(&script_tag);
    result.into_bytes()
}

/// Determine content type from file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");

    match extension {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" | "cjs" => "application/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        "wasm" => "application/wasm",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tower::ServiceExt;

    struct Health;

    impl Middleware for Health {
        fn handle<'a>(&'a self, request: &'a Parts) -> BoxFuture<'a, Option<Response>> {
            Box::pin(async move {
                (request.uri.path() == "/__health").then(|| "ok".into_response())
            })
        }
    }

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::create_dir(dir.path().join("public")).unwrap();
        std::fs::write(
            dir.path().join("public/index.html"),
            "<html><head></head><body>hi</body></html>",
        )
        .unwrap();
        std::fs::write(dir.path().join("app.ts"), "export const n: number = 1;\n").unwrap();
        std::fs::write(dir.path().join("broken.ts"), "export const = ;\n").unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        dir
    }

    fn state(config: ServerConfig, middlewares: Vec<Arc<dyn Middleware>>) -> AppState {
        AppState {
            config: Arc::new(config),
            cache: TransformCache::new(),
            hmr: HmrChannel::new(),
            middlewares: middlewares.into(),
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8_lossy(&body).to_string())
    }

    #[test]
    fn test_sanitize_rejects_traversal_and_hidden_files() {
        assert_eq!(sanitize("/src/app.ts"), Some(PathBuf::from("src/app.ts")));
        assert_eq!(sanitize("/"), Some(PathBuf::new()));
        assert_eq!(sanitize("/../etc/passwd"), None);
        assert_eq!(sanitize("/src/../../x"), None);
        assert_eq!(sanitize("/.env"), None);
        assert_eq!(sanitize("/.git/config"), None);
    }

    #[test]
    fn test_inject_client_script_before_head_close() {
        let result = inject_client_script(b"<html><head><title>t</title></head><body></body></html>");
        let html = String::from_utf8(result).unwrap();
        let script = html.find(HMR_CLIENT_PATH).unwrap();
        assert!(script < html.find("</head>").unwrap());
    }

    #[test]
    fn test_inject_client_script_without_markers_appends() {
        let html = String::from_utf8(inject_client_script(b"<p>bare</p>")).unwrap();
        assert!(html.starts_with("<p>bare</p>"));
        assert!(html.ends_with("</script>"));
    }

    #[test]
    fn test_content_type_for_common_assets() {
        assert_eq!(content_type_for(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("a.svg")), "image/svg+xml");
        assert_eq!(content_type_for(Path::new("a.unknown")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_public_file_is_served_raw() {
        let dir = project();
        let app = router(state(ServerConfig::new(dir.path()).unwrap(), vec![]));

        let (status, content_type, body) = get(app, "/index.html").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/html"));
        assert_eq!(body, "<html><head></head><body>hi</body></html>");
    }

    #[tokio::test]
    async fn test_root_path_serves_index_with_client_when_injection_is_on() {
        let dir = project();
        let mut config = ServerConfig::new(dir.path()).unwrap();
        config.inject_client = true;
        let app = router(state(config, vec![]));

        let (status, _, body) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(HMR_CLIENT_PATH));
        assert!(body.contains("hi"));
    }

    #[tokio::test]
    async fn test_source_module_is_compiled() {
        let dir = project();
        let app = router(state(ServerConfig::new(dir.path()).unwrap(), vec![]));

        let (status, content_type, body) = get(app, "/app.ts?t=1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.contains("javascript"));
        assert!(body.contains("export const n = 1"));
    }

    #[tokio::test]
    async fn test_compile_error_is_a_500_with_diagnostic() {
        let dir = project();
        let app = router(state(ServerConfig::new(dir.path()).unwrap(), vec![]));

        let (status, _, body) = get(app, "/broken.ts").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("broken.ts"));
    }

    #[tokio::test]
    async fn test_unknown_and_hidden_paths_are_404() {
        let dir = project();
        let app = router(state(ServerConfig::new(dir.path()).unwrap(), vec![]));

        let (status, _, _) = get(app.clone(), "/missing.ts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = get(app, "/.env").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_middleware_runs_before_pipeline() {
        let dir = project();
        let app = router(state(
            ServerConfig::new(dir.path()).unwrap(),
            vec![Arc::new(Health)],
        ));

        let (status, _, body) = get(app.clone(), "/__health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, _, _) = get(app, "/index.html").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_headers_are_present() {
        let dir = project();
        let app = router(state(ServerConfig::new(dir.path()).unwrap(), vec![]));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/index.html")
                    .header(header::ORIGIN, "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_gzip_is_negotiated() {
        let dir = project();
        std::fs::write(dir.path().join("public/big.txt"), "hello ".repeat(200)).unwrap();
        let app = router(state(ServerConfig::new(dir.path()).unwrap(), vec![]));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/big.txt")
                    .header(header::ACCEPT_ENCODING, "gzip")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get(header::CONTENT_ENCODING).unwrap(), "gzip");
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let dir = project();
        let app = router(state(ServerConfig::new(dir.path()).unwrap(), vec![]));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/index.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
