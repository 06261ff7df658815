//! Application configuration structures.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::CollectorOptions;
use crate::metrics::DEFAULT_ACTIVE_WINDOW;
use crate::storage::RetentionPolicy;
use crate::storage::retention::DEFAULT_BATCH_SIZE;

use super::sources::SourceConfig;
use super::validation::ConfigError;

// =============================================================================
// Constants
// =============================================================================

/// Default database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:data/meshmanager.db";

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Default SQLite busy timeout (5 seconds).
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time between retention sweeps (1 hour).
pub const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Default max age for time-series rows (30 days).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

fn default_max_age() -> Option<Duration> {
    Some(DEFAULT_MAX_AGE)
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite:data/meshmanager.db`.
    pub url: String,

    /// Connection pool size (default: 8).
    pub max_connections: u32,

    /// How long a writer waits on a locked database (default: 5s).
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

// =============================================================================
// Retention / Metrics Configuration
// =============================================================================

/// Retention sweep settings. A max age of `null` keeps that entity forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub batch_size: u32,
    #[serde(with = "humantime_serde")]
    pub messages: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub telemetry: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub traceroutes: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETENTION_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            messages: default_max_age(),
            telemetry: default_max_age(),
            traceroutes: default_max_age(),
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            messages: self.messages,
            telemetry: self.telemetry,
            traceroutes: self.traceroutes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Nodes heard within this window count as active (default: 1h).
    #[serde(with = "humantime_serde")]
    pub active_window: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            active_window: DEFAULT_ACTIVE_WINDOW,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub collectors: CollectorOptions,
    pub retention: RetentionConfig,
    pub metrics: MetricsConfig,
    /// Sources inserted on startup when absent.
    pub sources: Vec<SourceConfig>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        if self.server.port == 0 {
            return Err(ConfigError::Invalid(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database max_connections must be positive".to_string(),
            ));
        }

        self.collectors
            .backoff
            .validate()
            .map_err(ConfigError::Invalid)?;

        if self.collectors.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "collectors failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.collectors.page_size == 0 || self.collectors.max_pages == 0 {
            return Err(ConfigError::Invalid(
                "collectors page_size and max_pages must be positive".to_string(),
            ));
        }

        if self.collectors.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "collectors channel_capacity must be positive".to_string(),
            ));
        }

        if self.retention.interval.is_zero() || self.retention.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "retention interval and batch_size must be positive".to_string(),
            ));
        }

        if self.metrics.active_window.is_zero() {
            return Err(ConfigError::Invalid(
                "metrics active_window must be positive".to_string(),
            ));
        }

        let mut seen_names = HashSet::new();
        for source in &self.sources {
            source.validate(self.collectors.http_timeout)?;
            if !seen_names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name: '{}'",
                    source.name
                )));
            }
        }

        Ok(())
    }
}
