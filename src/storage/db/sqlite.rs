//! SQLite backend implementation using sqlx.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool as SqlxPool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::storage::StorageError;

/// Default maximum connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default connection acquire timeout.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a writer waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for [`SqlitePool::connect_with`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// SQLite busy timeout per connection.
    pub busy_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// SQLite connection pool wrapper.
///
/// WAL journaling lets the metrics reader and the retention sweeper run
/// alongside ingestion; `foreign_keys` is enabled so deleting a source
/// cascades to everything collected for it.
#[derive(Clone)]
pub struct SqlitePool {
    inner: SqlxPool,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool").finish_non_exhaustive()
    }
}

impl SqlitePool {
    /// Connect with default pool options.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL, e.g., `sqlite:data/meshmanager.db?mode=rwc`
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        Self::connect_with(url, PoolOptions::default()).await
    }

    /// Connect with explicit pool options.
    pub async fn connect_with(url: &str, opts: PoolOptions) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(opts.busy_timeout)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(opts.max_connections.max(1))
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        Ok(Self { inner: pool })
    }

    /// Get the underlying sqlx pool for direct query execution.
    #[inline]
    pub fn inner(&self) -> &SqlxPool {
        &self.inner
    }

    /// Round-trip a trivial query; used by the readiness check.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.inner).await?;
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_pool_connect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("pool.db").display());
        let pool = SqlitePool::connect(&url).await.unwrap();
        assert!(!pool.is_closed());

        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, 1);
        pool.ping().await.unwrap();

        pool.close().await;
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_sqlite_pool_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("pragma.db").display());
        let pool = SqlitePool::connect(&url).await.unwrap();

        let row: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, "wal");

        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, 1);

        pool.close().await;
    }
}
