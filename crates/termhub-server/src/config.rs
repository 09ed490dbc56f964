//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use termhub_core::{HubError, HubResult};
use tracing::info;

use crate::session::pty::{DEFAULT_COLS, DEFAULT_RESUME_FLAG, DEFAULT_ROWS};
use crate::session::ring_buffer::DEFAULT_RING_BUFFER_CAPACITY;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Output a viewer may fall behind by before it is disconnected.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Program for spawn requests that name none; `$SHELL` when unset.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            shell: None,
            resume_flag: default_resume_flag(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_max_pending_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_buffer_capacity() -> usize {
    DEFAULT_RING_BUFFER_CAPACITY
}
fn default_cols() -> u16 {
    DEFAULT_COLS
}
fn default_rows() -> u16 {
    DEFAULT_ROWS
}
fn default_resume_flag() -> String {
    DEFAULT_RESUME_FLAG.to_string()
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_pending_bytes: usize,
    pub buffer_capacity: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    pub shell: Option<String>,
    pub resume_flag: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let sessions = SessionsSection::default();
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: default_port(),
            max_pending_bytes: default_max_pending_bytes(),
            buffer_capacity: sessions.buffer_capacity,
            default_cols: sessions.default_cols,
            default_rows: sessions.default_rows,
            shell: sessions.shell,
            resume_flag: sessions.resume_flag,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<IpAddr>,
        cli_port: Option<u16>,
        cli_buffer_capacity: Option<usize>,
    ) -> HubResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| HubError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let bind = match cli_bind {
            Some(ip) => ip,
            None => file_config.server.bind.parse().map_err(|e| {
                HubError::Config(format!(
                    "invalid bind address {:?}: {e}",
                    file_config.server.bind
                ))
            })?,
        };

        let sessions = file_config.sessions;
        if sessions.default_cols == 0 || sessions.default_rows == 0 {
            return Err(HubError::Config(
                "default_cols and default_rows must be non-zero".into(),
            ));
        }

        // A full replay must fit in a viewer's send budget, or attaching
        // would always end in a lag disconnect.
        let buffer_capacity = cli_buffer_capacity.unwrap_or(sessions.buffer_capacity);
        let max_pending_bytes = file_config.server.max_pending_bytes;
        if buffer_capacity > max_pending_bytes {
            return Err(HubError::Config(format!(
                "buffer_capacity ({buffer_capacity}) exceeds max_pending_bytes ({max_pending_bytes})"
            )));
        }

        Ok(Self {
            bind,
            port: cli_port.unwrap_or(file_config.server.port),
            max_pending_bytes,
            buffer_capacity,
            default_cols: sessions.default_cols,
            default_rows: sessions.default_rows,
            shell: sessions.shell,
            resume_flag: sessions.resume_flag,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
