//! Storage Layer
//!
//! SQLite storage shared by every collector, the metrics reader and the
//! retention sweeper through one `sqlx` pool.
//!
//! # Components
//!
//! - [`Persister`]: Normalized, idempotent writes for decoded packets
//! - [`SourceStore`]: Source registry reads and health write-back
//! - [`StatsReader`]: Queries backing the state gauges
//! - [`RetentionSweeper`]: Periodic pruning of aged rows
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

mod builder;
pub mod db;
mod error;
pub mod persister;
pub mod retention;
pub mod schema;
pub mod source_store;
mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use error::StorageError;
pub use persister::{ApplyOutcome, MessageRecord, NodeFields, Persister};
pub use retention::{RetainedEntity, RetentionPolicy, RetentionSweeper, SweepReport};
pub use source_store::{
    InvalidSource, SourceHealthUpdate, SourceListing, SourceRecord, SourceStore, SourceType,
};
pub use types::{ActiveNodeCount, NodeGauge, StatsReader};
