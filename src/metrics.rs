//! Metrics aggregation and Prometheus exposition.
//!
//! Two families:
//! - event counters, incremented by the persister and collectors as work
//!   happens, never recomputed from table scans;
//! - state gauges, cleared and re-derived on every render from storage and
//!   from the collector manager's health snapshot.

use std::time::Duration;

use chrono::Utc;
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
    register_gauge_vec_with_registry, register_int_gauge_vec_with_registry,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::collector::HealthRegistry;
use crate::storage::{StatsReader, StorageError};

/// Default window for counting a node as active.
pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid exposition output: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("invalid active window: {0}")]
    Window(String),
}

// =============================================================================
// Event counters
// =============================================================================

/// Monotonic ingest counters, labelled by source.
#[derive(Clone)]
pub struct IngestCounters {
    messages: IntCounterVec,
    traceroutes: IntCounterVec,
    decode_errors: IntCounterVec,
}

impl std::fmt::Debug for IngestCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestCounters").finish_non_exhaustive()
    }
}

impl IngestCounters {
    /// Create unregistered counters.
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            messages: IntCounterVec::new(
                Opts::new(
                    "meshmanager_messages_received_total",
                    "Messages persisted, excluding duplicates",
                ),
                &["source_id"],
            )?,
            traceroutes: IntCounterVec::new(
                Opts::new(
                    "meshmanager_traceroutes_received_total",
                    "Traceroutes persisted",
                ),
                &["source_id"],
            )?,
            decode_errors: IntCounterVec::new(
                Opts::new(
                    "meshmanager_decode_errors_total",
                    "Packets or records dropped as undecodable",
                ),
                &["source_id"],
            )?,
        })
    }

    /// Register with `registry`. Clones share values, so a counter can be
    /// handed to storage before it is registered.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages.clone()))?;
        registry.register(Box::new(self.traceroutes.clone()))?;
        registry.register(Box::new(self.decode_errors.clone()))?;
        Ok(())
    }

    pub fn message_received(&self, source_id: &str) {
        self.messages_received(source_id, 1);
    }

    pub fn messages_received(&self, source_id: &str, count: u64) {
        if count > 0 {
            self.messages.with_label_values(&[source_id]).inc_by(count);
        }
    }

    pub fn traceroute_received(&self, source_id: &str) {
        self.traceroutes_received(source_id, 1);
    }

    pub fn traceroutes_received(&self, source_id: &str, count: u64) {
        if count > 0 {
            self.traceroutes.with_label_values(&[source_id]).inc_by(count);
        }
    }

    pub fn decode_error(&self, source_id: &str) {
        self.decode_errors.with_label_values(&[source_id]).inc();
    }

    /// Drop every series of a deleted source. Returns how many existed.
    pub fn remove_source(&self, source_id: &str) -> usize {
        [&self.messages, &self.traceroutes, &self.decode_errors]
            .into_iter()
            .filter(|family| family.remove_label_values(&[source_id]).is_ok())
            .count()
    }

    pub fn messages_total(&self, source_id: &str) -> u64 {
        self.messages.with_label_values(&[source_id]).get()
    }

    pub fn traceroutes_total(&self, source_id: &str) -> u64 {
        self.traceroutes.with_label_values(&[source_id]).get()
    }

    pub fn decode_errors_total(&self, source_id: &str) -> u64 {
        self.decode_errors.with_label_values(&[source_id]).get()
    }
}

// =============================================================================
// Aggregator
// =============================================================================

struct StateGauges {
    active_nodes: IntGaugeVec,
    battery_level: GaugeVec,
    voltage: GaugeVec,
    position_precision: IntGaugeVec,
    source_healthy: IntGaugeVec,
    consecutive_failures: IntGaugeVec,
}

impl StateGauges {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            active_nodes: register_int_gauge_vec_with_registry!(
                "meshmanager_active_nodes",
                "Nodes heard within the active window",
                &["source_id"],
                registry
            )?,
            battery_level: register_gauge_vec_with_registry!(
                "meshmanager_node_battery_level",
                "Last reported battery level in percent",
                &["source_id", "node_num"],
                registry
            )?,
            voltage: register_gauge_vec_with_registry!(
                "meshmanager_node_voltage",
                "Last reported battery voltage",
                &["source_id", "node_num"],
                registry
            )?,
            position_precision: register_int_gauge_vec_with_registry!(
                "meshmanager_node_position_precision_bits",
                "Precision bits of the last reported position",
                &["source_id", "node_num"],
                registry
            )?,
            source_healthy: register_int_gauge_vec_with_registry!(
                "meshmanager_source_healthy",
                "1 when the source's collector is healthy",
                &["source_id"],
                registry
            )?,
            consecutive_failures: register_int_gauge_vec_with_registry!(
                "meshmanager_source_consecutive_failures",
                "Consecutive failed collection cycles",
                &["source_id"],
                registry
            )?,
        })
    }

    fn reset(&self) {
        self.active_nodes.reset();
        self.battery_level.reset();
        self.voltage.reset();
        self.position_precision.reset();
        self.source_healthy.reset();
        self.consecutive_failures.reset();
    }
}

/// Renders the exposition text on demand.
pub struct MetricsAggregator {
    registry: Registry,
    gauges: StateGauges,
    counters: IngestCounters,
    stats: StatsReader,
    health: HealthRegistry,
    active_window: Duration,
    render_lock: Mutex<()>,
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("active_window", &self.active_window)
            .finish_non_exhaustive()
    }
}

impl MetricsAggregator {
    pub fn new(
        counters: IngestCounters,
        stats: StatsReader,
        health: HealthRegistry,
        active_window: Duration,
    ) -> Result<Self, MetricsError> {
        let registry = Registry::new();
        counters.register(&registry)?;
        let gauges = StateGauges::register(&registry)?;

        Ok(Self {
            registry,
            gauges,
            counters,
            stats,
            health,
            active_window,
            render_lock: Mutex::new(()),
        })
    }

    pub fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    /// Re-derive gauges and encode every family in text format.
    pub async fn render(&self) -> Result<String, MetricsError> {
        let _guard = self.render_lock.lock().await;
        self.refresh().await?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    async fn refresh(&self) -> Result<(), MetricsError> {
        let window = chrono::Duration::from_std(self.active_window)
            .map_err(|e| MetricsError::Window(e.to_string()))?;
        let since = Utc::now() - window;

        let active = self.stats.active_node_counts(since).await?;
        let nodes = self.stats.node_gauges(since).await?;
        let health = self.health.snapshot().await;

        self.gauges.reset();
        for row in &active {
            self.gauges
                .active_nodes
                .with_label_values(&[row.source_id.as_str()])
                .set(row.active_nodes);
        }
        for node in &nodes {
            let node_num = node.node_num.to_string();
            let labels = [node.source_id.as_str(), node_num.as_str()];
            if let Some(level) = node.battery_level {
                self.gauges
                    .battery_level
                    .with_label_values(&labels)
                    .set(level as f64);
            }
            if let Some(voltage) = node.voltage {
                self.gauges.voltage.with_label_values(&labels).set(voltage);
            }
            if let Some(bits) = node.position_precision {
                self.gauges
                    .position_precision
                    .with_label_values(&labels)
                    .set(bits);
            }
        }
        for entry in &health {
            let labels = [entry.source_id.as_str()];
            self.gauges
                .source_healthy
                .with_label_values(&labels)
                .set(i64::from(entry.healthy));
            self.gauges
                .consecutive_failures
                .with_label_values(&labels)
                .set(i64::from(entry.consecutive_failures));
        }
        Ok(())
    }
}
