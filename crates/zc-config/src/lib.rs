//! ZapCast Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,

    /// Data directory for local storage
    pub data_dir: String,

    /// Enable development mode (gateway credentials become optional)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration using the standard search paths and env overrides
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::new().load()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.lock_lease_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.lock_lease_seconds must be greater than 0".to_string(),
            ));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.max_attempts must be greater than 0".to_string(),
            ));
        }
        if !self.dev_mode && self.gateway.instance_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "gateway.instance_id is required outside dev mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration (health endpoints)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/zapcast.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Z-API gateway credentials and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub instance_id: String,
    pub token: String,
    pub client_token: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.z-api.io".to_string(),
            instance_id: String::new(),
            token: String::new(),
            client_token: String::new(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// Campaign scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Cadence of the eligibility scan
    pub tick_interval_ms: u64,
    /// Maximum campaigns picked up per tick
    pub batch_size: u32,
    /// Dispatch lock lease duration; expired leases are eligible for takeover
    pub lock_lease_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 2_000,
            batch_size: 50,
            lock_lease_seconds: 60,
        }
    }
}

/// Per-campaign dispatch policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Send attempts per recipient before it is marked failed
    pub max_attempts: u32,
    /// Delay before re-visiting recipients that reverted to pending within a run
    pub retry_backoff_ms: u64,
    /// Minimum spacing between sends across all campaigns (gateway protection)
    pub global_min_gap_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 2_000,
            global_min_gap_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_in_dev_mode() {
        let mut config = AppConfig::default();
        config.dev_mode = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_instance_id_rejected() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            dev_mode = true

            [gateway]
            base_url = "https://api.z-api.io"
            instance_id = "inst-1"
            token = "tok"
            client_token = "ctok"

            [scheduler]
            tick_interval_ms = 500
            lock_lease_seconds = 30

            [dispatcher]
            max_attempts = 5
            global_min_gap_ms = 1500
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateway.instance_id, "inst-1");
        assert_eq!(config.scheduler.tick_interval_ms, 500);
        assert_eq!(config.dispatcher.max_attempts, 5);
        assert_eq!(config.dispatcher.global_min_gap_ms, 1500);
        // Unspecified sections fall back to defaults
        assert_eq!(config.http.port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let mut config = AppConfig::default();
        config.dev_mode = true;
        config.scheduler.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
