use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, RelayError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
    pub sensors: SensorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address, e.g. `127.0.0.1:5192`
    pub addr: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5192".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Broker URL, e.g. `ws://127.0.0.1:5192`
    pub url: String,
    pub poll_interval_ms: u64,
}

impl PublisherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5192".to_string(),
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub url: String,
    /// Capacity of the callback work queue
    pub dispatch_queue: usize,
    /// Re-send every `subscribe_sensor` after a reconnect
    pub replay_subscriptions: bool,
    pub retry: RetryConfig,
}

impl SubscriberConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5192".to_string(),
            dispatch_queue: 64,
            replay_subscriptions: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub refresh_interval_ms: u64,
}

impl SensorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1_000,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let content = fs::read_to_string(path).map_err(|e| {
            RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to read config file: {}", e))
        })?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RelayError> {
        toml::from_str(content).map_err(|e| {
            RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to parse TOML: {}", e))
        })
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), RelayError> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to serialize to TOML: {}", e))
        })?;

        fs::write(path, content).map_err(|e| {
            RelayError::new(ErrorCode::ConfigInvalid, format!("Failed to write config file: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [broker]
            addr = "0.0.0.0:9000"

            [subscriber.retry]
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.addr, "0.0.0.0:9000");
        assert_eq!(config.subscriber.retry.max_attempts, 2);
        assert_eq!(config.subscriber.retry.initial_backoff_ms, 100);
        assert!(config.subscriber.replay_subscriptions);
        assert_eq!(config.publisher.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.sensors.refresh_interval(), Duration::from_secs(1));
    }

    #[test]
    fn bad_toml_is_config_invalid() {
        let err = RelayConfig::from_toml_str("[broker\naddr = 1").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigInvalid));
    }

    #[test]
    fn written_file_reads_back() {
        let path = std::env::temp_dir().join(format!("sensorrelay-{}.toml", uuid::Uuid::new_v4()));
        let mut config = RelayConfig::default();
        config.subscriber.dispatch_queue = 8;
        config.to_toml_file(&path).unwrap();

        let loaded = RelayConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.subscriber.dispatch_queue, 8);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_is_config_invalid() {
        let err = RelayConfig::from_toml_file("/nonexistent/sensorrelay.toml").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ConfigInvalid));
    }
}
