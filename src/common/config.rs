//! Configuration for chronocoord components

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::{Error, Result};

/// Base name looked up in the working directory by [`Config::load`] (`chronocoord.toml`)
pub const CONFIG_FILE: &str = "chronocoord";

/// Environment prefix, e.g. `CHRONOCOORD__COORDINATOR__LEASE_TTL_SECS=5`
pub const ENV_PREFIX: &str = "CHRONOCOORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub task: TaskConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            task: TaskConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Coordination settings shared by election, discovery and state managers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Root key namespace
    #[serde(default)]
    pub namespace: String,

    /// TTL of lease-backed keys (master record, live nodes)
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Back-off between failed election attempts
    #[serde(default = "default_election_backoff")]
    pub election_backoff_ms: u64,

    /// Capacity of each state manager's event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Timeout applied to individual store calls made by reconcilers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_lease_ttl() -> u64 {
    10
}
fn default_election_backoff() -> u64 {
    500
}
fn default_event_queue_capacity() -> usize {
    1024
}
fn default_request_timeout() -> u64 {
    5_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            lease_ttl_secs: default_lease_ttl(),
            election_backoff_ms: default_election_backoff(),
            event_queue_capacity: default_event_queue_capacity(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl CoordinatorConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn election_backoff(&self) -> Duration {
        Duration::from_millis(self.election_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Task coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Maximum operations in one store transaction
    #[serde(default = "default_max_txn_ops")]
    pub max_txn_ops: usize,

    /// Back-off used by processors that do not override it
    #[serde(default = "default_retry_backoff")]
    pub default_retry_backoff_ms: u64,

    /// Timeout of the controller's store calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_max_txn_ops() -> usize {
    128
}
fn default_retry_backoff() -> u64 {
    100
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_txn_ops: default_max_txn_ops(),
            default_retry_backoff_ms: default_retry_backoff(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl TaskConfig {
    pub fn default_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.default_retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load `chronocoord.toml` (optional) overlaid with `CHRONOCOORD__*` variables.
    pub fn load() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(CONFIG_FILE).required(false))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordinator.event_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_queue_capacity must be positive".into(),
            ));
        }
        if self.coordinator.lease_ttl_secs == 0 {
            return Err(Error::InvalidConfig("lease_ttl_secs must be positive".into()));
        }
        // one op for the envelope plus at least one task
        if self.task.max_txn_ops < 2 {
            return Err(Error::InvalidConfig("max_txn_ops must be at least 2".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.election_backoff(), Duration::from_millis(500));
        assert_eq!(config.task.max_txn_ops, 128);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.coordinator.event_queue_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.task.max_txn_ops = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(
                "[coordinator]\nlease_ttl_secs = 3\n",
                ::config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();
        assert_eq!(config.coordinator.lease_ttl_secs, 3);
        assert_eq!(config.coordinator.event_queue_capacity, 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_task_section() {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(
                "[task]\ndefault_retry_backoff_ms = 250\nrequest_timeout_ms = 800\n",
                ::config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();
        assert_eq!(config.task.default_retry_backoff(), Duration::from_millis(250));
        assert_eq!(config.task.request_timeout(), Duration::from_millis(800));
        assert_eq!(config.task.max_txn_ops, 128);
        assert!(config.coordinator.namespace.is_empty());
    }
}
