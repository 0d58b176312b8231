use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::handler::ConnectionSettings;
use super::listener::ListenerSettings;

const DEFAULT_CONFIG_FILE: &str = "server_ccd.conf";
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[command(about = "CCD fingerprint ingestion server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(short = 'i', long, env = "CCD_HOST", help = "Host address to listen on.")]
    pub hostname: Option<String>,

    #[arg(short = 'p', long, env = "CCD_PORT", help = "TCP port to listen on.")]
    pub port: Option<u16>,

    #[arg(short = 'd', long, env = "CCD_DATABASE", help = "Path of the SQLite database file.")]
    pub database: Option<PathBuf>,

    #[arg(short = 't', long, env = "CCD_TEMPLATES", help = "Directory of template_<SECTION>.json5 grammar files. Built-in templates are used when unset.")]
    pub templates: Option<PathBuf>,

    #[arg(long = "config", env = "CCD_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "CCD_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "CCD_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "CCD_READ_TIMEOUT_SECS", help = "Seconds a connection may stay idle before it is dropped.")]
    pub read_timeout_secs: Option<u64>,

    #[arg(long, env = "CCD_MAX_MESSAGE_BYTES", help = "Largest accepted message in bytes.")]
    pub max_message_bytes: Option<usize>,

    #[arg(long, env = "CCD_MAX_CONNECTIONS", help = "Maximum concurrent connections, 0 for no limit.")]
    pub max_connections: Option<usize>,
}

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("cannot read config file {path}: {reason}")]
    File { path: String, reason: String },
}

impl ConfigError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Missing(_) => 2,
            _ => 1,
        }
    }
}

/// Fully validated settings the server runs with.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub hostname: String,
    pub port: u16,
    pub database: PathBuf,
    pub templates: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub read_timeout: Duration,
    pub max_message_bytes: usize,
    pub max_connections: usize,
}

impl ResolvedConfig {
    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            connection: ConnectionSettings {
                read_timeout: self.read_timeout,
                max_message_bytes: self.max_message_bytes,
            },
            max_connections: self.max_connections,
        }
    }
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            hostname: other.hostname.or(self.hostname),
            port: other.port.or(self.port),
            database: other.database.or(self.database),
            templates: other.templates.or(self.templates),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            read_timeout_secs: other.read_timeout_secs.or(self.read_timeout_secs),
            max_message_bytes: other.max_message_bytes.or(self.max_message_bytes),
            max_connections: other.max_connections.or(self.max_connections),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            read_timeout_secs: Some(DEFAULT_READ_TIMEOUT_SECS),
            max_message_bytes: Some(DEFAULT_MAX_MESSAGE_BYTES),
            max_connections: Some(0),
            ..Default::default()
        }
    }

    /// Validates the merged configuration.
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        let hostname = self
            .hostname
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::Missing("hostname"))?;
        let port = self.port.ok_or(ConfigError::Missing("port"))?;
        let database = self
            .database
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or(ConfigError::Missing("database"))?;

        let read_timeout_secs = self.read_timeout_secs.unwrap_or(DEFAULT_READ_TIMEOUT_SECS);
        if read_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "read_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        let max_message_bytes = self.max_message_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        if max_message_bytes == 0 {
            return Err(ConfigError::Invalid {
                name: "max_message_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(ResolvedConfig {
            hostname,
            port,
            database,
            templates: self.templates,
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            read_timeout: Duration::from_secs(read_timeout_secs),
            max_message_bytes,
            max_connections: self.max_connections.unwrap_or(0),
        })
    }
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(Config::parse())
}

/// Defaults, then the config file, then environment and CLI (already in `cli`).
pub fn load_config_from(cli: Config) -> Result<Config, ConfigError> {
    let explicit = cli.config_path.is_some();
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        let file_err = |reason: String| ConfigError::File {
            path: config_file_path.display().to_string(),
            reason,
        };
        let config_str = fs::read_to_string(&config_file_path).map_err(|e| file_err(e.to_string()))?;
        let file_config =
            serde_json::from_str::<Config>(&config_str).map_err(|e| file_err(e.to_string()))?;
        current_config = current_config.merge(file_config);
    } else if explicit {
        return Err(ConfigError::File {
            path: config_file_path.display().to_string(),
            reason: "file not found".to_string(),
        });
    }

    Ok(current_config.merge(cli))
}
