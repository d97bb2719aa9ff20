//! Configuration for jest
//!
//! Two kinds of configuration live here. [`JestConfig`] is the service's own
//! TOML file (socket, database, mirror, timeouts). [`HostConfig`] is the
//! record written to the metadata store once a managed root exists; the
//! `config` collection is an append log and the newest enabled record wins.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Collection, StoreError, StoreTx};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading or saving
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(String),
    #[error("Config file not found")]
    NotFound,
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Main configuration structure for jest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JestConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Distribution mirror
    #[serde(default)]
    pub mirror: MirrorConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Host files touched during bootstrap
    #[serde(default)]
    pub host: HostFiles,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Path to Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Base URL of the release tree
    #[serde(default = "default_mirror_url")]
    pub url: String,
    #[serde(default = "default_mirror_credential")]
    pub user: String,
    #[serde(default = "default_mirror_credential")]
    pub password: String,
    /// Check archives against the release MANIFEST
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    /// Per-file transfer timeout in seconds
    #[serde(default = "default_transfer_timeout")]
    pub timeout: u64,
}

/// API configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Timeout for jail operations in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Timeout for a whole template bootstrap in seconds
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFiles {
    #[serde(default = "default_rc_conf")]
    pub rc_conf: String,
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `tracing` filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default value functions

fn default_database_path() -> String {
    "/var/db/jest/jest.db".to_string()
}

fn default_socket_path() -> String {
    "/var/run/jest.sock".to_string()
}

fn default_mirror_url() -> String {
    "https://download.freebsd.org/releases".to_string()
}

fn default_mirror_credential() -> String {
    "anonymous".to_string()
}

fn default_true() -> bool {
    true
}

fn default_transfer_timeout() -> u64 {
    600
}

fn default_timeout() -> u64 {
    30
}

fn default_bootstrap_timeout() -> u64 {
    3600
}

fn default_rc_conf() -> String {
    "/etc/rc.conf".to_string()
}

fn default_resolv_conf() -> String {
    "/etc/resolv.conf".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

// Default implementations

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            socket_path: default_socket_path(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            url: default_mirror_url(),
            user: default_mirror_credential(),
            password: default_mirror_credential(),
            verify_checksums: default_true(),
            timeout: default_transfer_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            bootstrap_timeout: default_bootstrap_timeout(),
        }
    }
}

impl Default for HostFiles {
    fn default() -> Self {
        Self {
            rc_conf: default_rc_conf(),
            resolv_conf: default_resolv_conf(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl JestConfig {
    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound
            } else {
                ConfigError::Io(e)
            }
        })?;

        let config: JestConfig = toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Searches in the following order:
    /// 1. `/usr/local/etc/jest/config.toml`
    /// 2. `~/.config/jest/config.toml`
    ///
    /// If neither exists, returns default configuration.
    pub fn load_defaults() -> Result<Self> {
        let system_config = Path::new("/usr/local/etc/jest/config.toml");
        let user_config = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".config/jest/config.toml"))
            .unwrap_or_else(|_| PathBuf::from("~/.config/jest/config.toml"));

        if system_config.exists() {
            return Self::load(system_config);
        }

        if user_config.exists() {
            return Self::load(user_config);
        }

        Ok(Self::default())
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        fs::write(path, toml_string)?;

        Ok(())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.storage.database_path.is_empty() {
            return Err(ConfigError::InvalidValue("Database path cannot be empty".to_string()));
        }
        if self.storage.socket_path.is_empty() {
            return Err(ConfigError::InvalidValue("Socket path cannot be empty".to_string()));
        }

        if !self.mirror.url.starts_with("http://") && !self.mirror.url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(format!(
                "Mirror URL must be http(s): {}",
                self.mirror.url
            )));
        }
        if self.mirror.timeout == 0 {
            return Err(ConfigError::InvalidValue("Mirror timeout cannot be zero".to_string()));
        }

        if self.api.timeout == 0 {
            return Err(ConfigError::InvalidValue("API timeout cannot be zero".to_string()));
        }
        if self.api.timeout > 3600 {
            return Err(ConfigError::InvalidValue("API timeout cannot exceed 3600 seconds".to_string()));
        }
        if self.api.bootstrap_timeout < self.api.timeout {
            return Err(ConfigError::InvalidValue(
                "Bootstrap timeout cannot be shorter than the API timeout".to_string(),
            ));
        }

        Ok(())
    }
}

/// Host-wide managed-root settings, stored in the `config` collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Managed-root directory, e.g. `/jest`
    pub jest_dir: String,
    /// Managed-root dataset, e.g. `zroot/jest`
    pub jest_dataset: String,
    #[serde(default)]
    pub disabled: bool,
}

impl HostConfig {
    /// The most recently written record that is not disabled
    pub fn load_authoritative(tx: &StoreTx<'_>) -> std::result::Result<Option<Self>, StoreError> {
        Ok(tx
            .scan::<HostConfig>(Collection::Config)?
            .into_iter()
            .rev()
            .map(|(_, config)| config)
            .find(|config| !config.disabled))
    }

    /// Append this record to the log
    pub fn append(&self, tx: &StoreTx<'_>) -> std::result::Result<String, StoreError> {
        let key = Uuid::new_v4().to_string();
        tx.put(Collection::Config, &key, self)?;
        Ok(key)
    }
}
