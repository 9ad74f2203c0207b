// src/config.rs
use crate::error::ConfigError;
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, looked up in the working directory.
pub const CONFIG_FILE: &str = "hotserve.toml";
/// Profile (top-level table) selected from the configuration file.
pub const PROFILE: &str = "hotserve";
/// Prefix for environment overrides, e.g. `HOTSERVE_PORT=4000`.
pub const ENV_PREFIX: &str = "HOTSERVE_";

/// Directories that never produce useful change events.
pub const DEFAULT_IGNORE: &[&str] = &["node_modules", ".git", "dist", "build", "target", ".cache"];

/// File stems treated as page entry points when no explicit entries are configured.
const ENTRY_STEMS: &[&str] = &["main", "index"];

/// Command-line arguments for the application.
#[derive(Parser, Debug, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Project root to serve
    #[clap(value_parser, help = "Project root to serve (defaults to the current directory)")]
    pub root: Option<PathBuf>,

    /// Port to listen on
    #[clap(short, long, value_parser, help = "Port to listen on (default 3000)")]
    pub port: Option<u16>,

    /// Host or address to bind
    #[clap(long, value_parser, help = "Host to bind (default 127.0.0.1)")]
    pub host: Option<String>,

    /// Static asset directory, relative to the root
    #[clap(long, value_parser, help = "Static asset directory relative to the root (default \"public\")")]
    pub public_dir: Option<PathBuf>,

    #[clap(long, help = "Disable hot module replacement; every change reloads the page")]
    pub no_hmr: bool,

    #[clap(long, help = "Do not send permissive CORS headers")]
    pub no_cors: bool,

    #[clap(long, help = "Do not compress responses")]
    pub no_compress: bool,

    #[clap(long, help = "Inject the HMR client script into served HTML pages")]
    pub inject_client: bool,

    #[clap(long, value_parser, help = "Watcher debounce interval in milliseconds (default 50)")]
    pub debounce_ms: Option<u64>,

    /// Path to a configuration file (e.g., hotserve.toml)
    #[clap(short, long, value_parser, help = "Path to a configuration file")]
    pub config: Option<PathBuf>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// The subset of settings given on the command line, as a config layer.
    ///
    /// Flags only override when present, so `--no-hmr` can turn HMR off but
    /// leaving it out never turns a configured `hmr = false` back on.
    pub fn overrides(&self) -> FileConfig {
        FileConfig {
            root: self.root.clone(),
            port: self.port,
            host: self.host.clone(),
            public_dir: self.public_dir.clone(),
            hmr: self.no_hmr.then_some(false),
            cors: self.no_cors.then_some(false),
            compress: self.no_compress.then_some(false),
            inject_client: self.inject_client.then_some(true),
            debounce_ms: self.debounce_ms,
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hmr: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject_client: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    /// Extra watcher ignore patterns, added to [`DEFAULT_IGNORE`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore: Option<Vec<String>>,
    /// Entry modules (relative to the root) whose changes always reload the page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl FileConfig {
    /// The lowest-precedence layer.
    pub fn defaults() -> Self {
        FileConfig {
            root: Some(PathBuf::from(".")),
            port: Some(3000),
            host: Some("127.0.0.1".to_string()),
            public_dir: Some(PathBuf::from("public")),
            hmr: Some(true),
            cors: Some(true),
            compress: Some(true),
            inject_client: Some(false),
            debounce_ms: Some(50),
            ignore: Some(vec![]),
            entries: Some(vec![]),
            log_level: Some("info".to_string()),
        }
    }

    /// Defaults, then the config file, then `HOTSERVE_*` variables, then the command line.
    pub fn figment(cli: &CliArgs) -> Figment {
        let config_file_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

        Figment::new()
            .merge(Serialized::defaults(FileConfig::defaults()))
            .merge(Toml::file(config_file_path).nested())
            .merge(Env::prefixed(ENV_PREFIX).global())
            .merge(Serialized::globals(cli.overrides()))
    }
}

/// Final server configuration. Resolved once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Canonical absolute project root.
    pub root: PathBuf,
    /// Canonical absolute public directory.
    pub public_dir: PathBuf,
    pub hmr: bool,
    pub cors: bool,
    pub compress: bool,
    /// Add the HMR client `<script>` to served HTML. Off by default: pages are served
    /// byte for byte and load `/@hmr/client.js` themselves.
    pub inject_client: bool,
    pub debounce: Duration,
    /// Watcher ignore patterns, defaults included.
    pub ignore: Vec<String>,
    /// Explicit entry modules, relative to the root.
    pub entries: Vec<PathBuf>,
    pub log_level: String,
}

impl ServerConfig {
    /// Loads the configuration by merging CLI, file, environment, and defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(&CliArgs::parse())
    }

    pub fn from_cli(cli: &CliArgs) -> Result<Self, ConfigError> {
        let merged: FileConfig = FileConfig::figment(cli)
            .select(PROFILE)
            .extract()
            .map_err(Box::new)?;
        Self::resolve(merged)
    }

    /// Default settings for `root`, validated.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::resolve(FileConfig {
            root: Some(root.into()),
            ..FileConfig::defaults()
        })
    }

    /// Validates a merged config layer. Missing values fall back to [`FileConfig::defaults`].
    pub fn resolve(file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = FileConfig::defaults();
        let root_setting = file.root.or(defaults.root).unwrap_or_default();
        let root = readable_dir(&root_setting).map_err(|reason| ConfigError::InvalidRoot {
            path: root_setting.clone(),
            reason,
        })?;

        let public_setting = root.join(file.public_dir.or(defaults.public_dir).unwrap_or_default());
        let public_dir =
            readable_dir(&public_setting).map_err(|reason| ConfigError::InvalidPublicDir {
                path: public_setting.clone(),
                reason,
            })?;

        let mut ignore: Vec<String> = DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect();
        for pattern in file.ignore.unwrap_or_default() {
            if !ignore.contains(&pattern) {
                ignore.push(pattern);
            }
        }

        Ok(ServerConfig {
            host: file.host.or(defaults.host).unwrap_or_default(),
            port: file.port.or(defaults.port).unwrap_or_default(),
            root,
            public_dir,
            hmr: file.hmr.unwrap_or(true),
            cors: file.cors.unwrap_or(true),
            compress: file.compress.unwrap_or(true),
            inject_client: file.inject_client.unwrap_or(false),
            debounce: Duration::from_millis(file.debounce_ms.or(defaults.debounce_ms).unwrap_or(50)),
            ignore,
            entries: file
                .entries
                .unwrap_or_default()
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            log_level: file.log_level.or(defaults.log_level).unwrap_or_default(),
        })
    }

    /// `host:port`, suitable for binding.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directories handed to the file watcher. The public directory is only listed
    /// separately when it lives outside the root.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.root.clone()];
        if !self.public_dir.starts_with(&self.root) {
            roots.push(self.public_dir.clone());
        }
        roots
    }

    /// Whether a root-relative path names a page entry point.
    pub fn is_entry(&self, relative: &Path) -> bool {
        if !self.entries.is_empty() {
            return self.entries.iter().any(|entry| entry == relative);
        }
        relative
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| ENTRY_STEMS.contains(&stem))
    }
}

fn readable_dir(path: &Path) -> Result<PathBuf, String> {
    let canonical = path.canonicalize().map_err(|e| e.to_string())?;
    if !canonical.is_dir() {
        return Err("not a directory".to_string());
    }
    std::fs::read_dir(&canonical).map_err(|e| e.to_string())?;
    Ok(canonical)
}
