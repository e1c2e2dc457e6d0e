//! Configuration management.
//!
//! Typed sections with secure defaults, overridable from the environment.
//! The binary layers CLI flags on top of `Config::from_env`.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::resolve_zone;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// SQLite file path. `None` = platform data dir.
    pub path: Option<PathBuf>,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Kafka bootstrap servers. `None` = publish to the log backend.
    pub brokers: Option<String>,
    pub topic: String,
    /// Per-publish timeout in milliseconds, inherited by every send.
    pub send_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: None,
            topic: "user-data".to_string(),
            send_timeout_ms: 30_000,
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Dispatcher-to-workers channel capacity.
    pub queue_capacity: usize,
    /// Zone applied when a request omits `time_zone`.
    pub default_zone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 25,
            default_zone: "UTC".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(port) = env::var("API_PORT") {
            config.api.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "API_PORT".to_string(),
                reason: format!("not a valid port: {port}"),
            })?;
        }
        if let Ok(host) = env::var("API_HOST") {
            config.api.host = host;
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            config.database.path = Some(PathBuf::from(path));
        }
        if let Ok(brokers) = env::var("KAFKA_BOOTSTRAP_SERVERS") {
            config.bus.brokers = Some(brokers);
        }
        if let Ok(topic) = env::var("BUS_TOPIC") {
            config.bus.topic = topic;
        }
        if let Ok(timeout) = env::var("BUS_SEND_TIMEOUT_MS") {
            config.bus.send_timeout_ms =
                timeout.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "BUS_SEND_TIMEOUT_MS".to_string(),
                    reason: format!("not a number: {timeout}"),
                })?;
        }
        if let Ok(workers) = env::var("WORKER_COUNT") {
            config.scheduler.workers =
                workers.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "WORKER_COUNT".to_string(),
                    reason: format!("not a number: {workers}"),
                })?;
        }
        if let Ok(zone) = env::var("DEFAULT_ZONE") {
            config.scheduler.default_zone = zone;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.queue_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if resolve_zone(&self.scheduler.default_zone).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.default_zone".to_string(),
                reason: format!("unknown zone: {}", self.scheduler.default_zone),
            });
        }
        if self.bus.topic.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "bus.topic".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
