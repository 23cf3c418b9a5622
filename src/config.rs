//! Application configuration.
//!
//! YAML file with `${VAR}` / `${VAR:-default}` environment expansion,
//! validated eagerly: a bad configuration is fatal at startup, never at
//! runtime. Durations accept humantime strings (`500ms`, `10s`, `1m`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::subscription::MonitoringSettings;

/// Configuration error types; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the YAML document.
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value failed validation.
    #[error("config validation error: {0}")]
    Validation(String),
}

// =============================================================================
// Sections
// =============================================================================

fn default_publishing_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_sampling_interval() -> Duration {
    Duration::from_millis(500)
}

/// OPC UA source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcConfig {
    /// Select the synthetic subscription source instead of a real
    /// transport.
    pub use_simulator: bool,

    /// Subscription publish cycle.
    #[serde(with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Monitored-item sampling cycle.
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,
}

impl Default for OpcConfig {
    fn default() -> Self {
        Self {
            use_simulator: false,
            publishing_interval: default_publishing_interval(),
            sampling_interval: default_sampling_interval(),
        }
    }
}

/// Batching and flush cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker tick period, in seconds.
    pub flush_interval_seconds: u64,

    /// Buffer size that schedules an automatic flush.
    pub auto_flush_threshold: usize,

    /// Maximum rows per persistence round trip.
    pub max_chunk: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval_seconds: 10,
            auto_flush_threshold: 5000,
            max_chunk: 1000,
        }
    }
}

/// Store-and-forward resilience settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Spool directory; created if absent.
    pub store_forward_path: PathBuf,

    /// Record cap across all spooled batches.
    pub max_local_storage_records: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            store_forward_path: PathBuf::from("./store_forward"),
            max_local_storage_records: 100_000,
        }
    }
}

/// Relational store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Connection string, e.g. `sqlite:historian.db?mode=rwc`.
    pub connection_string: String,
}

/// Optional in-process event-bus fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub enabled: bool,
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_capacity: 1024,
        }
    }
}

// =============================================================================
// Top level
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub opc: OpcConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    pub storage: StorageConfig,

    #[serde(default)]
    pub event_bus: EventBusConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding environment
    /// variables and validating every value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&expand_env_vars(&content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.flush_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "batch.flush_interval_seconds must be positive".to_string(),
            ));
        }
        if self.batch.auto_flush_threshold == 0 {
            return Err(ConfigError::Validation(
                "batch.auto_flush_threshold must be positive".to_string(),
            ));
        }
        if self.batch.max_chunk == 0 {
            return Err(ConfigError::Validation(
                "batch.max_chunk must be positive".to_string(),
            ));
        }
        if self.resilience.max_local_storage_records == 0 {
            return Err(ConfigError::Validation(
                "resilience.max_local_storage_records must be positive".to_string(),
            ));
        }
        if self.storage.connection_string.trim().is_empty() {
            return Err(ConfigError::Validation(
                "storage.connection_string must not be empty".to_string(),
            ));
        }
        if self.opc.sampling_interval.is_zero() || self.opc.publishing_interval.is_zero() {
            return Err(ConfigError::Validation(
                "opc intervals must be positive".to_string(),
            ));
        }
        if self.event_bus.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "event_bus.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker tick period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.batch.flush_interval_seconds)
    }

    /// Monitoring parameters derived from the OPC section.
    pub fn monitoring_settings(&self) -> MonitoringSettings {
        MonitoringSettings {
            publishing_interval: self.opc.publishing_interval,
            sampling_interval: self.opc.sampling_interval,
            ..Default::default()
        }
    }
}

/// Expand environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "storage:\n  connection_string: \"sqlite::memory:\"\n"
    }

    #[test]
    fn test_defaults_applied() {
        let config: AppConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();

        assert!(!config.opc.use_simulator);
        assert_eq!(config.batch.flush_interval_seconds, 10);
        assert_eq!(config.batch.auto_flush_threshold, 5000);
        assert_eq!(config.batch.max_chunk, 1000);
        assert_eq!(config.resilience.max_local_storage_records, 100_000);
        assert!(!config.event_bus.enabled);
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
opc:
  use_simulator: true
  publishing_interval: 1s
  sampling_interval: 500ms
batch:
  flush_interval_seconds: 5
  auto_flush_threshold: 2000
  max_chunk: 500
resilience:
  store_forward_path: /var/spool/historian
  max_local_storage_records: 50000
storage:
  connection_string: "sqlite:historian.db?mode=rwc"
event_bus:
  enabled: true
  channel_capacity: 256
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert!(config.opc.use_simulator);
        assert_eq!(config.opc.sampling_interval, Duration::from_millis(500));
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(
            config.resilience.store_forward_path,
            PathBuf::from("/var/spool/historian")
        );
        assert!(config.event_bus.enabled);

        let settings = config.monitoring_settings();
        assert_eq!(settings.publishing_interval, Duration::from_secs(1));
        assert_eq!(settings.queue_size, 10);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let yaml = "batch:\n  max_chunk: 0\nstorage:\n  connection_string: \"sqlite::memory:\"\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_chunk"));
    }

    #[test]
    fn test_validation_rejects_empty_connection_string() {
        let yaml = "storage:\n  connection_string: \"  \"\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let result = expand_env_vars("dsn: ${NONEXISTENT_HISTORIAN_DSN:-sqlite::memory:}");
        assert_eq!(result, "dsn: sqlite::memory:");
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("plain text"), "plain text");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = AppConfig::load("/nonexistent/historian.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
