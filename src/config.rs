//! Configuration management for the Ratekeeper coordinator daemon.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::cluster::DEFAULT_CHANNEL;
use crate::error::{LimiterError, Result};

/// Prefix of environment variables that override file settings, as in
/// `RATEKEEPER__COORDINATOR__CHANNEL`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Coordinator configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address workers connect to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Channel tag shared with the workers
    #[serde(default = "default_channel")]
    pub channel: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            channel: default_channel(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7950))
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Load the optional YAML file, then apply `RATEKEEPER__*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            let name = path.to_string_lossy();
            builder = builder.add_source(config::File::new(name.as_ref(), config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .ignore_empty(true),
        );

        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = RatekeeperConfig::default();
        assert_eq!(config.coordinator.listen_addr.to_string(), "127.0.0.1:7950");
        assert_eq!(config.coordinator.channel, "ratekeeper");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_partial_yaml() {
        let config = assert_ok!(RatekeeperConfig::from_yaml(
            "coordinator:\n  channel: payments\nlogging:\n  json: true\n"
        ));
        assert_eq!(config.coordinator.channel, "payments");
        assert_eq!(config.coordinator.listen_addr, default_listen_addr());
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_yaml() {
        let err = assert_err!(RatekeeperConfig::from_yaml("coordinator:\n  listen_addr: nowhere\n"));
        assert!(matches!(err, LimiterError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = assert_err!(RatekeeperConfig::from_file("/nonexistent/ratekeeper.yaml"));
        assert!(matches!(err, LimiterError::Io(_)));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("ratekeeper-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "coordinator:\n  listen_addr: 0.0.0.0:9000\n  channel: from-file\nlogging:\n  level: debug\n",
        )
        .unwrap();

        std::env::set_var("RATEKEEPER__COORDINATOR__CHANNEL", "from-env");
        let config = RatekeeperConfig::load(Some(&path));
        std::env::remove_var("RATEKEEPER__COORDINATOR__CHANNEL");
        std::fs::remove_file(&path).unwrap();

        let config = assert_ok!(config);
        assert_eq!(config.coordinator.listen_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.coordinator.channel, "from-env");
        assert_eq!(config.logging.level, "debug");
    }
}
