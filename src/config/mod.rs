use crate::cors::CorsConfig;
use crate::error::{Result, ServiceError};
use crate::observability::default_filter;
use crate::rate_limit::RateLimitConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment variable overrides, e.g. `QRGATE__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "QRGATE";

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
    /// CORS configuration (disabled when absent)
    #[serde(default)]
    pub cors: Option<CorsConfig>,
    /// Prometheus metrics
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path of the Prometheus scrape endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ServiceError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load the optional YAML file at `path`, then apply `QRGATE__*` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Listen address in `host:port` form
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.timeout_secs == 0 {
            return Err(ServiceError::Config(
                "Server timeout must be > 0".to_string(),
            ));
        }

        let limits = &self.rate_limiting;
        if limits.max_tokens == 0 {
            return Err(ServiceError::Config(
                "Rate limit max_tokens must be > 0".to_string(),
            ));
        }
        if limits.window_ms == 0 {
            return Err(ServiceError::Config(
                "Rate limit window must be > 0".to_string(),
            ));
        }
        if !limits.protected_prefix.starts_with('/') {
            return Err(ServiceError::Config(format!(
                "Protected prefix must start with '/': {:?}",
                limits.protected_prefix
            )));
        }
        if limits.fallback_identity.trim().is_empty() {
            return Err(ServiceError::Config(
                "Fallback identity cannot be empty".to_string(),
            ));
        }
        if limits.eviction.enabled && limits.eviction.idle_windows == 0 {
            return Err(ServiceError::Config(
                "Eviction idle_windows must be > 0".to_string(),
            ));
        }

        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            return Err(ServiceError::Config(format!(
                "Metrics path must start with '/': {:?}",
                self.metrics.path
            )));
        }

        if let Some(cors) = &self.cors {
            cors.validate()?;
        }

        Ok(())
    }
}
