//! Storage builder and handles.
//!
//! Opens the shared pool, initializes the schema and hands out the facades
//! the rest of the process writes through.

use std::path::Path;
use std::time::Duration;

use crate::metrics::IngestCounters;
use crate::storage::db::{PoolOptions, SqlitePool};
use crate::storage::retention::{RetentionPolicy, RetentionSweeper};
use crate::storage::schema::init_schema;
use crate::storage::{Persister, SourceStore, StatsReader, StorageError};

/// Default retention sweep interval.
const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    url: String,
    options: PoolOptions,
    counters: Option<IngestCounters>,
    retention: Option<(RetentionPolicy, Duration, u32)>,
}

impl StorageBuilder {
    /// Create a new storage builder for a `sqlite:` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: PoolOptions::default(),
            counters: None,
            retention: None,
        }
    }

    /// Set the maximum pool size.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.options.max_connections = max;
        self
    }

    /// Set how long a writer waits for the database lock.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.options.busy_timeout = timeout;
        self
    }

    /// Share ingest counters with the metrics registry.
    pub fn counters(mut self, counters: IngestCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Configure the retention sweeper.
    pub fn retention(mut self, policy: RetentionPolicy, interval: Duration, batch_size: u32) -> Self {
        self.retention = Some((policy, interval, batch_size));
        self
    }

    /// Build the storage layer and return handles.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        create_parent_dir(&self.url)?;

        let pool = SqlitePool::connect_with(&self.url, self.options).await?;
        init_schema(&pool).await?;

        let counters = match self.counters {
            Some(counters) => counters,
            None => IngestCounters::new()
                .map_err(|e| StorageError::Internal(format!("Failed to create counters: {e}")))?,
        };

        let (policy, interval, batch_size) = self.retention.unwrap_or((
            RetentionPolicy::default(),
            DEFAULT_RETENTION_INTERVAL,
            crate::storage::retention::DEFAULT_BATCH_SIZE,
        ));

        Ok(StorageHandles {
            sources: SourceStore::new(pool.clone()),
            persister: Persister::new(pool.clone(), counters),
            stats: StatsReader::new(pool.clone()),
            retention: Some(
                RetentionSweeper::new(pool.clone(), policy, interval).with_batch_size(batch_size),
            ),
            pool,
        })
    }
}

/// Create the database file's directory for file-backed URLs.
fn create_parent_dir(url: &str) -> Result<(), StorageError> {
    let Some(path) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }

    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };
    if !parent.as_os_str().is_empty() && !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::Internal(format!(
                "Failed to create database directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Shared connection pool.
    pub pool: SqlitePool,
    /// Source registry access.
    pub sources: SourceStore,
    /// Normalizer/persister used by every collector.
    pub persister: Persister,
    /// Read-side queries for gauges.
    pub stats: StatsReader,
    /// Retention sweeper, taken by the process to run in the background.
    pub retention: Option<RetentionSweeper>,
}

impl StorageHandles {
    /// Close the pool after in-flight queries finish.
    pub async fn shutdown(self) {
        self.pool.close().await;
        tracing::info!("Storage closed");
    }
}
