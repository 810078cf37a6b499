//! Driver configuration
//!
//! Configuration is loaded from a TOML file, then overridden by the
//! `PRODIGY_HOST` / `PRODIGY_PORT` environment variables the IOC
//! traditionally exports, then by CLI flags in the binary.
//!
//! # Example
//! ```ignore
//! let mut config = DriverConfig::load("kreios.toml")?;
//! config.apply_env();
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Prodigy server host
    pub host: String,
    /// Prodigy server TCP port
    pub port: u16,
    /// Request-reply timeout in seconds
    pub timeout_s: f64,
    /// Acquisition status poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound on doubles requested per `GetAcquisitionData`
    pub max_values_per_read: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7010,
            timeout_s: 10.0,
            poll_interval_ms: 100,
            max_values_per_read: 1_000_000,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DriverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PRODIGY_HOST` / `PRODIGY_PORT` environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("PRODIGY_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
        if let Ok(port) = std::env::var("PRODIGY_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "PRODIGY_PORT".to_string(),
                reason: format!("not a port number: {:?}", port),
            })?;
        }
        Ok(())
    }

    /// Server address as `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Request timeout as a `Duration`
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout_s)
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_s <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout_s".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_values_per_read == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_values_per_read".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
