//! TOML settings for Notegraph.
//!
//! Reads `config.toml` from the config directory and resolves where the MCP
//! server file lives, with precedence:
//! CLI flags > env vars > settings file > defaults

use notegraph_mcp::{ClientOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the config directory.
pub const CONFIG_DIR_ENV: &str = "NOTEGRAPH_CONFIG_DIR";

/// Environment variable that points at the MCP server file.
pub const MCP_CONFIG_ENV: &str = "NOTEGRAPH_MCP_CONFIG";

/// The MCP server file looked up in the config directory by default.
pub const DEFAULT_MCP_FILE: &str = "mcp.json";

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_READY_FALLBACK_MS: u64 = 2_000;
pub const DEFAULT_INITIALIZE_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIALIZE_BACKOFF_MS: u64 = 1_000;

/// The default log filter when neither `--verbose` nor `[log] level` is set.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolved configuration for a Notegraph process.
#[derive(Debug, Clone)]
pub struct NotegraphConfig {
    pub config_dir: PathBuf,
    /// Where the MCP server file is expected. It may not exist.
    pub mcp_config_path: PathBuf,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
    pub ready_fallback: Duration,
    pub initialize_attempts: u32,
    pub initialize_backoff: Duration,
    pub log_level: String,
    /// Problems found while loading that did not stop it. Collected rather
    /// than logged, since logging is configured from this struct.
    pub warnings: Vec<String>,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpSettings {
    pub config_file: Option<PathBuf>,
    pub request_timeout_ms: Option<u64>,
    pub startup_timeout_ms: Option<u64>,
    pub ready_fallback_ms: Option<u64>,
    pub initialize_attempts: Option<u32>,
    pub initialize_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: Option<String>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub mcp_config: Option<PathBuf>,
    pub verbose: bool,
}

impl NotegraphConfig {
    /// Load configuration from the config directory and the environment.
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let env_mcp_config = std::env::var_os(MCP_CONFIG_ENV).map(PathBuf::from);
        Self::load_from(config_dir(), overrides, env_mcp_config)
    }

    /// Load configuration rooted at `config_dir`.
    ///
    /// Precedence for the MCP server file (highest to lowest):
    /// 1. `--mcp-config`
    /// 2. `NOTEGRAPH_MCP_CONFIG`
    /// 3. `[mcp] config_file` in `config.toml`
    /// 4. `<config_dir>/mcp.json`
    pub fn load_from(
        config_dir: PathBuf,
        overrides: CliOverrides,
        env_mcp_config: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let (settings, warning) = load_settings_file(&config_dir.join("config.toml"));
        let mcp = settings.mcp;

        let mcp_config_path = overrides
            .mcp_config
            .or(env_mcp_config)
            .or(mcp.config_file)
            .map(|path| resolve_relative(&config_dir, path))
            .unwrap_or_else(|| config_dir.join(DEFAULT_MCP_FILE));

        let request_timeout = positive_ms(
            "mcp.request_timeout_ms",
            mcp.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        )?;
        let startup_timeout = positive_ms(
            "mcp.startup_timeout_ms",
            mcp.startup_timeout_ms.unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
        )?;
        let ready_fallback = positive_ms(
            "mcp.ready_fallback_ms",
            mcp.ready_fallback_ms.unwrap_or(DEFAULT_READY_FALLBACK_MS),
        )?;

        let initialize_attempts = mcp
            .initialize_attempts
            .unwrap_or(DEFAULT_INITIALIZE_ATTEMPTS);
        if initialize_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "mcp.initialize_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        let initialize_backoff = Duration::from_millis(
            mcp.initialize_backoff_ms
                .unwrap_or(DEFAULT_INITIALIZE_BACKOFF_MS),
        );

        let log_level = if overrides.verbose {
            "debug".to_string()
        } else {
            settings
                .log
                .level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
        };

        Ok(NotegraphConfig {
            config_dir,
            mcp_config_path,
            request_timeout,
            startup_timeout,
            ready_fallback,
            initialize_attempts,
            initialize_backoff,
            log_level,
            warnings: warning.into_iter().collect(),
        })
    }

    /// Timeouts and retry settings for every MCP connection.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: self.request_timeout,
            startup_timeout: self.startup_timeout,
            ready_fallback: self.ready_fallback,
            initialize_retry: RetryPolicy::linear(
                self.initialize_attempts,
                self.initialize_backoff,
            ),
            ..ClientOptions::default()
        }
    }

    /// Read the MCP server file. A missing file is `Ok(None)`.
    pub fn read_mcp_config(&self) -> Result<Option<String>, ConfigError> {
        match std::fs::read_to_string(&self.mcp_config_path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::Read {
                path: self.mcp_config_path.clone(),
                source,
            }),
        }
    }
}

/// Get the Notegraph config directory path (~/.notegraph/).
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".notegraph")
}

fn resolve_relative(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn positive_ms(key: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_millis(ms))
}

/// Load and parse a TOML settings file, returning defaults on any error.
/// A file that exists but does not parse comes back with a warning.
fn load_settings_file(path: &Path) -> (SettingsFile, Option<String>) {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                tracing::debug!("Read settings from {}", path.display());
                (settings, None)
            }
            Err(e) => (
                SettingsFile::default(),
                Some(format!("Failed to parse {}: {}", path.display(), e)),
            ),
        },
        Err(_) => (SettingsFile::default(), None),
    }
}
