//! meshmanager - Mesh Network Telemetry Library
//!
//! Collects telemetry from mesh-network sources, normalizes it into one
//! store, and exposes health and metrics. It can be used as a library, or
//! run as a standalone binary with the `meshmanager` executable.
//!
//! # Architecture
//!
//! - **Decoder**: Binary protobuf and JSON packets into normalized events
//! - **Collectors**: Polled HTTP APIs and MQTT subscriptions, one task per source
//! - **Storage**: SQLite persistence, idempotent upserts, retention sweeps
//! - **Metrics**: Ingest counters and state gauges in Prometheus text format
//! - **Server**: Health, readiness and metrics endpoints

pub mod collector;
pub mod config;
pub mod decoder;
pub mod metrics;
pub mod server;
pub mod storage;

pub use collector::{
    BackoffPolicy, Collector, CollectorContext, CollectorError, CollectorHealth, CollectorManager,
    CollectorOptions, FailureKind, HealthRegistry, PollingCollector, StreamingCollector,
};
pub use decoder::{DecodeError, DecodedPacket, FormatHint, NormalizedEvent, decode};
pub use metrics::{IngestCounters, MetricsAggregator, MetricsError};
pub use storage::{
    Persister, RetentionPolicy, RetentionSweeper, SourceRecord, SourceStore, SourceType,
    StorageBuilder, StorageError, StorageHandles,
};
