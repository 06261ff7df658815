//! Configuration module for meshmanager.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database settings (url, pool size, busy timeout)
//! - Collector options, retention and metrics windows
//! - Seed sources inserted on first start

mod app;
mod sources;
mod validation;

pub use app::{AppConfig, DatabaseConfig, MetricsConfig, RetentionConfig, ServerConfig};
pub use sources::SourceConfig;
pub use validation::{ConfigError, expand_env_vars};

pub use app::{DEFAULT_DATABASE_URL, DEFAULT_MAX_CONNECTIONS};
