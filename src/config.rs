//! Configuration loading for dorsh.
//!
//! Layered: embedded defaults, then the user config at
//! `~/.config/dorsh/config.toml`, then a project-local `.dorsh/config.toml`.
//! Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Default configuration embedded at compile time
pub const DEFAULT_CONFIG: &str = include_str!("../default_config.toml");

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Frontend connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Frontend host
    #[serde(default = "default_host")]
    pub host: String,

    /// MySQL-protocol port of the frontend
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Default database selected at connect time
    #[serde(default)]
    pub database: Option<String>,

    /// HTTP status port; discovered via the frontends table when unset
    #[serde(default)]
    pub http_port: Option<u16>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: None,
            http_port: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    9030
}

fn default_user() -> String {
    "root".to_string()
}

/// Progress tracking settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressConfig {
    /// Use synthetic progress data instead of the frontend REST endpoint
    #[serde(default)]
    pub mock: bool,

    /// Seed for the synthetic progress source
    #[serde(default)]
    pub mock_seed: Option<u64>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: pretty, compact, json
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    #[serde(default)]
    pub file_line: bool,

    /// Write logs to a file instead of stderr, keeping the terminal free
    /// for the progress line
    #[serde(default = "default_true")]
    pub file_output: bool,

    /// Log directory; `~/.dorsh/logs` when unset
    #[serde(default)]
    pub file_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            file_line: false,
            file_output: true,
            file_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration: embedded defaults, then user config, then
    /// project-local config. Missing files are skipped silently; malformed
    /// files are skipped with a warning.
    pub fn load() -> Self {
        let mut config: AppConfig = toml::from_str(DEFAULT_CONFIG).unwrap_or_default();

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                match Self::load_from_file(&user_path) {
                    Ok(user_config) => {
                        tracing::info!(path = %user_path.display(), "loaded user config");
                        config = user_config;
                    }
                    Err(e) => {
                        tracing::warn!(path = %user_path.display(), error = %e, "ignoring user config");
                    }
                }
            }
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            match Self::load_from_file(&project_path) {
                Ok(project_config) => {
                    tracing::info!(path = %project_path.display(), "loaded project config");
                    config = project_config;
                }
                Err(e) => {
                    tracing::warn!(path = %project_path.display(), error = %e, "ignoring project config");
                }
            }
        }

        config
    }

    /// Load configuration from a specific TOML file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save the configuration to a TOML file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFailed {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// `~/.config/dorsh/config.toml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dorsh").join("config.toml"))
    }

    /// `./.dorsh/config.toml`
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".dorsh").join("config.toml")
    }

    /// `~/.dorsh/history`
    pub fn history_file_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".dorsh").join("history"))
    }

    /// Resolved log directory
    pub fn log_dir(&self) -> PathBuf {
        match &self.logging.file_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".dorsh")
                .join("logs"),
        }
    }
}
