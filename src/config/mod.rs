//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{MessagingConfig, ReconnectConfig};
pub use storage::{StorageConfig, StorageType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "COURIER_LOG_FORMAT";
/// Broker URL variable understood by older deployments.
pub const LEGACY_URL_ENV_VAR: &str = "RABBITMQ_URL";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub messaging: MessagingConfig,
    pub storage: StorageConfig,
}

/// Identity of the running process, used in logs and consumer tags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `RABBITMQ_URL`, only when no broker URL was configured above
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let mut config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if config.messaging.effective_url().is_none() {
            if let Ok(url) = std::env::var(LEGACY_URL_ENV_VAR) {
                if !url.trim().is_empty() {
                    config.messaging.url = Some(url);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = self.messaging.effective_url() {
            if !(url.starts_with("amqp://") || url.starts_with("amqps://")) {
                return Err(ConfigError::Invalid(
                    "messaging.url must use the amqp:// or amqps:// scheme".to_string(),
                ));
            }
        }

        if self.messaging.prefetch == 0 {
            return Err(ConfigError::Invalid(
                "messaging.prefetch must be at least 1".to_string(),
            ));
        }

        let reconnect = &self.messaging.reconnect;
        if reconnect.min_delay_ms > reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "messaging.reconnect.min_delay_ms ({}) exceeds max_delay_ms ({})",
                reconnect.min_delay_ms, reconnect.max_delay_ms
            )));
        }

        if self.storage.storage_type == StorageType::Sqlite && self.storage.path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.path is required for sqlite storage".to_string(),
            ));
        }

        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
