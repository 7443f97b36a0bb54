//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "zapcast.toml",
    "./config/config.toml",
    "./config/zapcast.toml",
    "/etc/zapcast/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            let contents = std::fs::read_to_string(&path)?;
            config = toml::from_str(&contents)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check ZAPCAST_CONFIG env var
        if let Ok(path) = env::var("ZAPCAST_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("ZAPCAST_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("ZAPCAST_HTTP_HOST") {
            config.http.host = val;
        }

        // Database
        if let Ok(val) = env::var("ZAPCAST_DATABASE_PATH") {
            config.database.path = val;
        }
        if let Ok(val) = env::var("ZAPCAST_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.database.max_connections = max;
            }
        }

        // Gateway
        if let Ok(val) = env::var("ZAPCAST_GATEWAY_BASE_URL") {
            config.gateway.base_url = val;
        }
        if let Ok(val) = env::var("ZAPCAST_GATEWAY_INSTANCE_ID") {
            config.gateway.instance_id = val;
        }
        if let Ok(val) = env::var("ZAPCAST_GATEWAY_TOKEN") {
            config.gateway.token = val;
        }
        if let Ok(val) = env::var("ZAPCAST_GATEWAY_CLIENT_TOKEN") {
            config.gateway.client_token = val;
        }
        if let Ok(val) = env::var("ZAPCAST_GATEWAY_REQUEST_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.gateway.request_timeout_ms = timeout;
            }
        }

        // Scheduler
        if let Ok(val) = env::var("ZAPCAST_SCHEDULER_ENABLED") {
            config.scheduler.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("ZAPCAST_SCHEDULER_TICK_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.scheduler.tick_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("ZAPCAST_SCHEDULER_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.scheduler.batch_size = size;
            }
        }
        if let Ok(val) = env::var("ZAPCAST_SCHEDULER_LOCK_LEASE_SECONDS") {
            if let Ok(lease) = val.parse() {
                config.scheduler.lock_lease_seconds = lease;
            }
        }

        // Dispatcher
        if let Ok(val) = env::var("ZAPCAST_DISPATCHER_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse() {
                config.dispatcher.max_attempts = attempts;
            }
        }
        if let Ok(val) = env::var("ZAPCAST_DISPATCHER_RETRY_BACKOFF_MS") {
            if let Ok(backoff) = val.parse() {
                config.dispatcher.retry_backoff_ms = backoff;
            }
        }
        if let Ok(val) = env::var("ZAPCAST_DISPATCHER_GLOBAL_MIN_GAP_MS") {
            if let Ok(gap) = val.parse() {
                config.dispatcher.global_min_gap_ms = gap;
            }
        }

        // General
        if let Ok(val) = env::var("ZAPCAST_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("ZAPCAST_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
