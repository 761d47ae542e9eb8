// Configuration File Support
//
// This module provides configuration file parsing for the faultline controller.
// Supports TOML format with environment variable overrides.
// The configuration file defaults to ./faultline.toml and can be set with --config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "faultline.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics backend configuration
    pub prometheus: PrometheusConfig,

    /// Reconciliation configuration
    pub controller: ControllerConfig,

    /// Summary HTTP server configuration
    pub server: ServerConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Prometheus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Base URL of the Prometheus server
    pub url: String,

    /// Interval between two executions of the same query, in milliseconds
    pub polling_interval_ms: u64,

    /// Timeout for a single query request, in seconds
    pub request_timeout_secs: u64,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: "http://glooshot-prometheus-server:9090".to_string(),
            polling_interval_ms: 5_000,
            request_timeout_secs: 10,
        }
    }
}

impl PrometheusConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// How often the experiment store is listed, in milliseconds
    pub refresh_interval_ms: u64,

    /// Directory holding experiments and reports
    pub state_dir: PathBuf,

    /// Namespace to watch; empty watches all namespaces
    pub default_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1_000,
            state_dir: PathBuf::from("./faultline-state"),
            default_namespace: String::new(),
        }
    }
}

impl ControllerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Namespace filter for listing experiments
    pub fn watch_namespace(&self) -> Option<&str> {
        Some(self.default_namespace.as_str()).filter(|ns| !ns.is_empty())
    }
}

/// Summary server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether to serve the summary, health and metrics endpoints
    pub enabled: bool,

    /// Listen address
    pub summary_bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            summary_bind_addr: "0.0.0.0:8085".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to register and expose Prometheus metrics
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        // Environment overrides apply to defaults as well as to file values
        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - FAULTLINE_LOG_LEVEL
    /// - FAULTLINE_LOG_FORMAT
    /// - PROMETHEUS_URL
    /// - FAULTLINE_POLLING_INTERVAL_MS
    /// - FAULTLINE_STATE_DIR
    /// - FAULTLINE_SUMMARY_BIND_ADDR
    fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("FAULTLINE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FAULTLINE_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Prometheus overrides
        if let Ok(url) = std::env::var("PROMETHEUS_URL") {
            if !url.is_empty() {
                self.prometheus.url = url;
            }
        }
        if let Ok(interval) = std::env::var("FAULTLINE_POLLING_INTERVAL_MS") {
            if let Ok(interval) = interval.parse::<u64>() {
                if interval > 0 {
                    self.prometheus.polling_interval_ms = interval;
                }
            }
        }

        // Controller overrides
        if let Ok(dir) = std::env::var("FAULTLINE_STATE_DIR") {
            self.controller.state_dir = PathBuf::from(dir);
        }

        // Server overrides
        if let Ok(addr) = std::env::var("FAULTLINE_SUMMARY_BIND_ADDR") {
            self.server.summary_bind_addr = addr;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        // Validate Prometheus configuration
        if self.prometheus.url.is_empty() {
            anyhow::bail!("Prometheus URL must not be empty");
        }
        if self.prometheus.polling_interval_ms == 0 {
            anyhow::bail!("Polling interval must be > 0");
        }
        if self.prometheus.request_timeout_secs == 0 {
            anyhow::bail!("Prometheus request timeout must be > 0");
        }

        // Validate controller configuration
        if self.controller.refresh_interval_ms == 0 {
            anyhow::bail!("Refresh interval must be > 0");
        }

        // Validate server configuration
        if self.server.enabled {
            self.summary_addr()?;
        }

        Ok(())
    }

    /// Parsed summary server address
    pub fn summary_addr(&self) -> Result<SocketAddr> {
        self.server
            .summary_bind_addr
            .parse()
            .with_context(|| format!("Invalid summary bind address: {}", self.server.summary_bind_addr))
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.prometheus.url, "http://glooshot-prometheus-server:9090");
        assert_eq!(config.prometheus.polling_interval(), Duration::from_secs(5));
        assert_eq!(config.controller.refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.controller.watch_namespace(), None);
        assert_eq!(config.server.summary_bind_addr, "0.0.0.0:8085");
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_validation_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.summary_addr().unwrap().port(), 8085);
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_intervals() {
        let mut config = Config::default();
        config.prometheus.polling_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.controller.refresh_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bind_addr() {
        let mut config = Config::default();
        config.server.summary_bind_addr = ":8085".to_string();
        assert!(config.validate().is_err());

        // only checked when the server is enabled
        config.server.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension(".nonexistent");
        let config = Config::load_from_path(&path);
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[prometheus]
polling_interval_ms = 250

[controller]
refresh_interval_ms = 500
state_dir = "/var/lib/faultline"
default_namespace = "chaos"

[server]
summary_bind_addr = "127.0.0.1:9000"
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config: Config = toml::from_str(&fs::read_to_string(temp_file.path()).unwrap()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.prometheus.polling_interval(), Duration::from_millis(250));
        // unset keys keep their defaults
        assert_eq!(config.prometheus.request_timeout_secs, 10);
        assert_eq!(config.controller.refresh_interval(), Duration::from_millis(500));
        assert_eq!(config.controller.state_dir, PathBuf::from("/var/lib/faultline"));
        assert_eq!(config.controller.watch_namespace(), Some("chaos"));
        assert_eq!(config.summary_addr().unwrap().port(), 9000);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging
level = "debug"
"#; // Invalid TOML

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path());
        assert!(config.is_err());
    }

    #[test]
    fn test_env_overrides() {
        // Every override is exercised in this one test so parallel tests
        // never observe a half-applied environment
        std::env::set_var("FAULTLINE_LOG_LEVEL", "debug");
        std::env::set_var("FAULTLINE_LOG_FORMAT", "json");
        std::env::set_var("PROMETHEUS_URL", "http://prom.monitoring:9090");
        std::env::set_var("FAULTLINE_POLLING_INTERVAL_MS", "100");
        std::env::set_var("FAULTLINE_STATE_DIR", "/tmp/faultline");
        std::env::set_var("FAULTLINE_SUMMARY_BIND_ADDR", "127.0.0.1:18085");

        let config = Config::default().apply_env_overrides();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.prometheus.url, "http://prom.monitoring:9090");
        assert_eq!(config.prometheus.polling_interval_ms, 100);
        assert_eq!(config.controller.state_dir, PathBuf::from("/tmp/faultline"));
        assert_eq!(config.server.summary_bind_addr, "127.0.0.1:18085");

        // Invalid numbers keep the previous value
        std::env::set_var("FAULTLINE_POLLING_INTERVAL_MS", "0");
        let config = Config::default().apply_env_overrides();
        assert_eq!(config.prometheus.polling_interval_ms, 5_000);

        // Clean up
        std::env::remove_var("FAULTLINE_LOG_LEVEL");
        std::env::remove_var("FAULTLINE_LOG_FORMAT");
        std::env::remove_var("PROMETHEUS_URL");
        std::env::remove_var("FAULTLINE_POLLING_INTERVAL_MS");
        std::env::remove_var("FAULTLINE_STATE_DIR");
        std::env::remove_var("FAULTLINE_SUMMARY_BIND_ADDR");
    }

    #[test]
    fn test_log_level() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::WARN);
    }
}
