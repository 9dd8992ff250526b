//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use tubeshare_core::{DEFAULT_CHUNK_LENGTH, DEFAULT_MAX_CONCURRENT};

/// Daemon configuration. File: ~/.config/tubeshare/config.toml or /etc/tubeshare/config.toml.
/// Env overrides: TUBESHARE_SOCKET_DIR, TUBESHARE_CHUNK_LENGTH, TUBESHARE_MAX_DOWNLOADS, TUBESHARE_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory for tube bridge sockets (default $XDG_RUNTIME_DIR/tubeshare).
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Records per chunk (default 250).
    #[serde(default = "default_chunk_length")]
    pub chunk_length: usize,
    /// Downloads fetched at once (default 2).
    #[serde(default = "default_max_downloads")]
    pub max_downloads: usize,
    /// tracing filter directive (default "info"). RUST_LOG wins when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_socket_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("tubeshare"),
        None => PathBuf::from("/tmp/tubeshare"),
    }
}
fn default_chunk_length() -> usize {
    DEFAULT_CHUNK_LENGTH
}
fn default_max_downloads() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            chunk_length: default_chunk_length(),
            max_downloads: default_max_downloads(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Default bridge socket path for the library provider.
    pub fn library_socket(&self) -> PathBuf {
        self.socket_dir.join("library.sock")
    }

    /// Directory the provider binds one-shot file sockets in.
    pub fn file_dir(&self) -> PathBuf {
        self.socket_dir.join("files")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
/// A present but broken file is an error.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Apply overrides from `get`. Unparsable numbers are ignored.
fn apply_env(c: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(s) = get("TUBESHARE_SOCKET_DIR") {
        if !s.is_empty() {
            c.socket_dir = PathBuf::from(s);
        }
    }
    if let Some(s) = get("TUBESHARE_CHUNK_LENGTH") {
        if let Ok(n) = s.parse::<usize>() {
            c.chunk_length = n;
        }
    }
    if let Some(s) = get("TUBESHARE_MAX_DOWNLOADS") {
        if let Ok(n) = s.parse::<usize>() {
            c.max_downloads = n;
        }
    }
    if let Some(s) = get("TUBESHARE_LOG") {
        if !s.is_empty() {
            c.log_filter = s;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tubeshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/tubeshare/config.toml"));
    out
}

/// First existing config file wins.
fn load_file() -> Result<Option<Config>, ConfigError> {
    let Some(path) = config_paths().into_iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&s)
        .map(Some)
        .map_err(|source| ConfigError::Parse { path, source })
}
