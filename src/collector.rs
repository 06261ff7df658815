//! Collector Layer
//!
//! One long-running collector per enabled source, each in its own Tokio task
//! and failing independently of the others.
//!
//! # Architecture
//!
//! - [`Collector`]: Capability set shared by both variants
//! - [`PollingCollector`]: Paginated HTTP API poller
//! - [`StreamingCollector`]: MQTT subscription with a decode/persist task
//! - [`CollectorManager`]: Reconciles sources, supervises, shuts down
//! - [`HealthRegistry`]: Per-source health, read via snapshots
//! - [`BackoffPolicy`]: Retry delays between failed cycles
//!
//! # Example
//!
//! ```rust,no_run
//! use meshmanager::collector::{CollectorManager, CollectorOptions};
//! use meshmanager::storage::{SourceRecord, StorageBuilder};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let handles = StorageBuilder::new("sqlite:data/mesh.db").build().await?;
//! handles
//!     .sources
//!     .insert(&SourceRecord::mqtt("public", "mqtt.meshtastic.org", "msh/US/#"))
//!     .await?;
//!
//! let manager = Arc::new(CollectorManager::new(
//!     handles.sources.clone(),
//!     handles.persister.clone(),
//!     CollectorOptions::default(),
//! ));
//! tokio::spawn(Arc::clone(&manager).run());
//! // ...
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod health;
mod manager;
pub mod polling;
pub mod streaming;
mod traits;

pub use backoff::BackoffPolicy;
pub use health::{CollectorHealth, CollectorState, HealthRegistry, HealthReporter};
pub use manager::{
    CollectorManager, CollectorOptions, CollectorSpec, DEFAULT_RECONCILE_INTERVAL,
    DEFAULT_SHUTDOWN_GRACE, ReconcileReport,
};
pub use polling::{PollingCollector, PollingConfig};
pub use streaming::{StreamingCollector, StreamingConfig};
pub use traits::{
    Collector, CollectorContext, CollectorError, ConnectionCheck, CycleOutcome, FailureKind,
    MIN_INTERVAL, Schedule,
};
