//! Database access layer.
//!
//! The store is a single SQLite file shared by every collector, the retention
//! sweeper and the metrics reader through one connection pool.
//!
//! # Example
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:data/meshmanager.db?mode=rwc").await?;
//! let row = sqlx::query("SELECT 1").fetch_one(pool.inner()).await?;
//! ```

mod sqlite;

pub use sqlite::{PoolOptions, SqlitePool};
