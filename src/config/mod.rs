//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{AmqpConfig, MessagingConfig, MessagingType};
pub use storage::StorageConfig;

use serde::Deserialize;

use crate::bus::Topology;
use crate::cache::CacheConfig;
use crate::chain::ChainConfig;
use crate::consumer::DispatchConfig;
use crate::outbox::relay::RelayConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CHAINRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CHAINRELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CHAINRELAY_LOG";

/// Errors raised while assembling configuration.
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
    /// Database configuration.
    pub storage: StorageConfig,
    /// Broker configuration.
    pub messaging: MessagingConfig,
    /// Outbox relay worker configuration.
    pub relay: RelayConfig,
    /// Contract address routing for the chain event consumer.
    pub dispatch: DispatchConfig,
    /// Guarded cache configuration.
    pub cache: CacheConfig,
    /// Chain client configuration.
    pub chain: ChainConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
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

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would only fail later, at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.batch_size == 0 {
            return Err(ConfigError::Invalid("relay.batch_size must be > 0".into()));
        }
        if self.relay.lease_secs == 0 {
            return Err(ConfigError::Invalid("relay.lease_secs must be > 0".into()));
        }
        if self.messaging.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "messaging.max_attempts must be > 0".into(),
            ));
        }
        if self.cache.prune_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.prune_interval_secs must be > 0".into(),
            ));
        }

        let topology = Topology::default();
        let routes = std::iter::once(("default_publication", &self.relay.default_publication))
            .chain(self.relay.routes.iter().map(|(name, p)| (name.as_str(), p)));
        for (source, publication) in routes {
            if topology.stream_for_publication(publication).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "relay route '{source}' targets unknown publication '{publication}'"
                )));
            }
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig::in_memory(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.messaging.messaging_type, MessagingType::Memory);
        assert_eq!(config.messaging.amqp.url, "amqp://localhost:5672");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert!(config.storage.is_in_memory());
        assert_eq!(config.storage.url(), "sqlite::memory:");
    }

    #[test]
    #[serial_test::serial]
    fn test_config_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
messaging:
  type: amqp
  max_attempts: 5
relay:
  batch_size: 25
dispatch:
  stake_contracts:
    - "0xAbC0000000000000000000000000000000000001"
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.max_attempts, 5);
        assert_eq!(config.relay.batch_size, 25);
        assert_eq!(config.dispatch.stake_contracts.len(), 1);
    }

    #[test]
    #[serial_test::serial]
    fn test_config_env_override() {
        std::env::set_var("CHAINRELAY__RELAY__BATCH_SIZE", "7");
        let config = Config::load(None);
        std::env::remove_var("CHAINRELAY__RELAY__BATCH_SIZE");

        assert_eq!(config.unwrap().relay.batch_size, 7);
    }

    #[test]
    fn test_config_rejects_route_to_unknown_publication() {
        let mut config = Config::for_test();
        config
            .relay
            .routes
            .insert("ThreadCreated".to_string(), "nowhere".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(m)) if m.contains("nowhere")));

        let mut config = Config::for_test();
        config.relay.default_publication = "elsewhere".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(m)) if m.contains("elsewhere")));
    }

    #[test]
    fn test_config_rejects_zero_batch() {
        let mut config = Config::for_test();
        config.relay.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
