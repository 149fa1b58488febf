//! Daemon configuration.
//!
//! A configuration file holds one or more named profiles; the daemon is
//! started with a file and a profile name:
//!
//! ```toml
//! [casper]
//! port = 8080
//! max_clients = 10
//! log_level = "info"
//! log_path = "/var/log/casper.log"
//! pid_file = "/var/run/casper/casperd.pid"
//! work_dir = "/"
//! buffer_size = 65536
//! ```
//!
//! Every key is optional. Values are validated once at load time; the rest
//! of the daemon treats a loaded [`Config`] as trusted input.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use casper_protocol::{DEFAULT_BUFFER_CAPACITY, HEADER_LEN};

use crate::server::{ServerConfig, DEFAULT_MAX_CLIENTS, DEFAULT_PORT};

/// Verbosity accepted in a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single configuration profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP port bound on all interfaces
    pub port: u16,

    /// Maximum number of simultaneously registered clients
    pub max_clients: usize,

    pub log_level: LogLevel,

    /// Daemon log file; also the file streamed to clients
    pub log_path: Option<PathBuf>,

    pub pid_file: PathBuf,

    /// Working directory after detaching (unchanged when absent)
    pub work_dir: Option<PathBuf>,

    /// Per-connection receive buffer, header included
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            log_level: LogLevel::default(),
            log_path: None,
            pid_file: default_pid_file(),
            work_dir: None,
            buffer_size: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Returns the default PID file location.
pub fn default_pid_file() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("casper")
        .join("casperd.pid")
}

impl Config {
    /// Loads profile `name` from the TOML file at `path`.
    ///
    /// Relative paths in the profile are anchored to the current directory,
    /// so they keep pointing at the same files after the daemon changes
    /// into `work_dir`.
    pub fn load(path: &Path, name: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents, name)?;
        let cwd = std::env::current_dir().map_err(ConfigError::CurrentDir)?;
        Ok(config.anchored_to(&cwd))
    }

    /// Parses profile `name` out of a TOML document.
    pub fn from_toml_str(contents: &str, name: &str) -> Result<Self, ConfigError> {
        let mut profiles: BTreeMap<String, Config> = toml::from_str(contents)?;

        let config = match profiles.remove(name) {
            Some(config) => config,
            None => {
                let available = profiles.keys().cloned().collect::<Vec<_>>().join(", ");
                return Err(ConfigError::MissingProfile {
                    name: name.to_string(),
                    available,
                });
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that the type system does not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid {
                field: "max_clients",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.buffer_size <= HEADER_LEN {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: format!("must be larger than the {HEADER_LEN}-byte frame header"),
            });
        }

        if u32::try_from(self.buffer_size - HEADER_LEN).is_err() {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "payload ceiling must fit in a 32-bit length".to_string(),
            });
        }

        Ok(())
    }

    /// Rewrites every relative path in the profile as `base.join(path)`.
    pub fn anchored_to(mut self, base: &Path) -> Self {
        let anchor = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        };

        self.log_path = self.log_path.map(anchor);
        self.pid_file = anchor(self.pid_file);
        self.work_dir = self.work_dir.map(anchor);
        self
    }

    /// Event-loop settings derived from this profile.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            max_clients: self.max_clients,
            buffer_capacity: self.buffer_size,
            tail_path: self.log_path.clone(),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to resolve current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration '{name}' not found (available: {available})")]
    MissingProfile { name: String, available: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
