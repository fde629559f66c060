//! Server configuration.
//!
//! Configuration is read once at startup from a YAML file:
//!
//! ```yaml
//! server:
//!   host: 0.0.0.0
//!   port: 8080
//!   thread_pool_size: 4
//!   directory: ./public
//! logger:
//!   level: info
//!   file: logs/sluice.log
//! ```
//!
//! Every field is optional. The `LISTEN` environment variable (`host:port`)
//! overrides the configured address.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Env var naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "SLUICE_CONFIG";
/// File read when `SLUICE_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "server_config.yaml";
/// Env var overriding `server.host` and `server.port`.
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Number of worker threads executing read/write tasks.
    pub thread_pool_size: usize,
    /// Root of the static files; no static serving when absent.
    pub directory: Option<PathBuf>,
    /// Readiness events pulled per reactor wake.
    pub max_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            thread_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            directory: None,
            max_events: 1024,
        }
    }
}

impl ServerConfig {
    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolves [`ServerConfig::listen_addr`] to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.listen_addr();
        addr.to_socket_addrs()
            .with_context(|| format!("Invalid listen address {addr}"))?
            .next()
            .with_context(|| format!("Listen address {addr} resolved to nothing"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// Log file; logs go to stderr when absent.
    pub file: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Loads the file named by `SLUICE_CONFIG` (or `server_config.yaml`).
    ///
    /// A missing file yields the defaults; a file that exists but cannot be
    /// parsed is an error. `LISTEN` is applied last.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            cfg.apply_listen(&listen)?;
        }

        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty mapping.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg = serde_yaml::from_str(text)?;
        Ok(cfg)
    }

    /// Overrides host and port from a `host:port` string.
    pub fn apply_listen(&mut self, listen: &str) -> Result<()> {
        let (host, port) = listen
            .rsplit_once(':')
            .with_context(|| format!("{LISTEN_ENV} must be host:port, got {listen}"))?;
        self.server.port = port
            .parse()
            .with_context(|| format!("Invalid port in {LISTEN_ENV}: {port}"))?;
        self.server.host = host.trim_matches(|c| c == '[' || c == ']').to_string();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.thread_pool_size == 0 {
            anyhow::bail!("server.thread_pool_size must be >= 1");
        }
        if self.server.max_events == 0 {
            anyhow::bail!("server.max_events must be >= 1");
        }
        if let Some(dir) = &self.server.directory {
            if !dir.is_dir() {
                anyhow::bail!("server.directory {} is not a directory", dir.display());
            }
        }
        Ok(())
    }
}
