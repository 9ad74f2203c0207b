// src/lib.rs

#![doc = r#"
# Hotserve

Hotserve is a local development server. It serves a project's static assets,
compiles TypeScript and JSX modules on request, watches the project for changes and
pushes hot module replacement messages to connected browsers over a WebSocket.

## Modules

- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`error`]: Error types for startup, compiles, watching and client connections.
- [`event`]: File change events produced by the watcher.
- [`hmr`]: The HMR WebSocket channel and its wire messages.
- [`server`]: Server lifecycle and the file-change event loop.
- [`transform`]: The fingerprinted, coalescing transform cache.
- [`watcher`]: Debounced recursive file system watcher.
- [`web`]: HTTP routing and the request pipeline.
"#]

pub mod config;
pub mod error;
pub mod event;
pub mod hmr;
pub mod server;
pub mod transform;
pub mod watcher;
pub mod web;

pub use config::ServerConfig;
pub use error::{CompileError, ConfigError, ConnectionError, ResolveError, WatchError};
pub use hmr::{HmrChannel, HmrMessage};
pub use server::{DevServer, DevServerBuilder};
pub use transform::{CompiledModule, TransformCache};
pub use web::Middleware;
