//! Collector lifecycle management.
//!
//! The manager reconciles the enabled sources against the running
//! collectors, one supervisor task per source. Supervisors own the cycle
//! schedule and backoff; the manager only starts, restarts and stops them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collector::backoff::BackoffPolicy;
use crate::collector::health::{
    CollectorState, DEFAULT_FAILURE_THRESHOLD, HealthRegistry, HealthReporter,
};
use crate::collector::polling::{PollingCollector, PollingConfig};
use crate::collector::streaming::{StreamingCollector, StreamingConfig};
use crate::collector::{
    Collector, CollectorContext, CollectorError, ConnectionCheck, FailureKind, Schedule,
};
use crate::storage::{
    InvalidSource, Persister, SourceListing, SourceRecord, SourceStore, SourceType, StorageError,
};

/// Default timeout for graceful shutdown (10 seconds).
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Default interval between source reconciliations.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Settings shared by every collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorOptions {
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
    /// Consecutive failures before a source is reported unhealthy.
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    pub page_size: u32,
    pub max_pages: u32,
    #[serde(with = "humantime_serde")]
    pub mqtt_keep_alive: Duration,
    #[serde(with = "humantime_serde")]
    pub mqtt_connect_timeout: Duration,
    /// Capacity of the broker-to-processor channel.
    pub channel_capacity: usize,
    pub backoff: BackoffPolicy,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            http_timeout: Duration::from_secs(30),
            page_size: 100,
            max_pages: 1000,
            mqtt_keep_alive: Duration::from_secs(30),
            mqtt_connect_timeout: Duration::from_secs(10),
            channel_capacity: 1024,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Collector settings resolved from a source; a change means restart.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorSpec {
    Polling(PollingConfig),
    Streaming(StreamingConfig),
}

impl CollectorSpec {
    pub fn from_source(
        source: &SourceRecord,
        options: &CollectorOptions,
    ) -> Result<Self, CollectorError> {
        match source.source_type {
            SourceType::MeshMonitor => PollingConfig::from_source(source, options).map(Self::Polling),
            SourceType::Mqtt => StreamingConfig::from_source(source, options).map(Self::Streaming),
        }
    }

    fn build(&self, persister: Persister) -> Result<Arc<dyn Collector>, CollectorError> {
        Ok(match self {
            Self::Polling(config) => Arc::new(PollingCollector::new(config.clone(), persister)?),
            Self::Streaming(config) => {
                Arc::new(StreamingCollector::new(config.clone(), persister))
            }
        })
    }
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    /// Sources rejected for configuration errors.
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.restarted.is_empty()
            && self.stopped.is_empty()
            && self.failed.is_empty()
    }
}

/// A source the manager should be running, readable or not.
#[derive(Clone, Copy)]
enum Entry<'a> {
    Source(&'a SourceRecord),
    Invalid(&'a InvalidSource),
}

impl Entry<'_> {
    fn id(&self) -> &str {
        match self {
            Self::Source(source) => &source.id,
            Self::Invalid(row) => &row.id,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Source(source) => &source.name,
            Self::Invalid(row) => &row.name,
        }
    }

    fn spec(&self, options: &CollectorOptions) -> Result<CollectorSpec, String> {
        match self {
            Self::Source(source) => {
                CollectorSpec::from_source(source, options).map_err(|e| e.to_string())
            }
            Self::Invalid(row) => Err(row.error.clone()),
        }
    }
}

struct Slot {
    spec: Result<CollectorSpec, String>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Owns every running collector.
pub struct CollectorManager {
    sources: SourceStore,
    persister: Persister,
    health: HealthRegistry,
    options: CollectorOptions,
    slots: Mutex<HashMap<String, Slot>>,
    /// Source ids in the last reconciled listing.
    known: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    wake: Notify,
}

impl std::fmt::Debug for CollectorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorManager")
            .field(
                "collector_count",
                &self.slots.try_lock().map(|s| s.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl CollectorManager {
    pub fn new(sources: SourceStore, persister: Persister, options: CollectorOptions) -> Self {
        Self {
            sources,
            persister,
            health: HealthRegistry::new(options.failure_threshold),
            options,
            slots: Mutex::new(HashMap::new()),
            known: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            wake: Notify::new(),
        }
    }

    /// Read-only health view shared with the metrics side.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    /// Ids of sources with a slot (running or failed).
    pub async fn collector_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.slots.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request an immediate reconcile from [`CollectorManager::run`].
    pub fn trigger_reconcile(&self) {
        self.wake.notify_one();
    }

    /// Bring running collectors in line with `sources`.
    ///
    /// Disabled and absent sources are stopped, new ones started, and any
    /// source whose collector settings changed is restarted.
    pub async fn reconcile(&self, sources: &[SourceRecord]) -> ReconcileReport {
        self.reconcile_entries(sources, &[]).await
    }

    /// Reconcile a store listing. Enabled rows that could not be read are
    /// reported as configuration failures; the readable ones reconcile as
    /// usual.
    pub async fn reconcile_listing(&self, listing: &SourceListing) -> ReconcileReport {
        self.reconcile_entries(&listing.valid, &listing.invalid).await
    }

    async fn reconcile_entries(
        &self,
        sources: &[SourceRecord],
        invalid: &[InvalidSource],
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.shutdown.is_cancelled() {
            return report;
        }

        let mut desired: HashMap<&str, Entry<'_>> = HashMap::new();
        for source in sources.iter().filter(|s| s.enabled) {
            desired.insert(source.id.as_str(), Entry::Source(source));
        }
        for row in invalid.iter().filter(|r| r.enabled) {
            desired.insert(row.id.as_str(), Entry::Invalid(row));
        }
        let known: HashSet<&str> = sources
            .iter()
            .map(|s| s.id.as_str())
            .chain(invalid.iter().map(|r| r.id.as_str()))
            .collect();

        let mut slots = self.slots.lock().await;
        let mut retired = Vec::new();

        let gone: Vec<String> = slots
            .keys()
            .filter(|id| !desired.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(slot) = slots.remove(&id) {
                retired.push((id.clone(), slot));
                report.stopped.push(id);
            }
        }

        let mut to_start = Vec::new();
        for (id, entry) in &desired {
            let spec = entry.spec(&self.options);
            let unchanged = match slots.get(*id) {
                Some(slot) => Some(slot.spec == spec && !self.needs_revive(id, slot).await),
                None => None,
            };
            match unchanged {
                Some(true) => {}
                Some(false) => {
                    if let Some(slot) = slots.remove(*id) {
                        retired.push((id.to_string(), slot));
                    }
                    report.restarted.push(id.to_string());
                    to_start.push((*entry, spec));
                }
                None => {
                    report.started.push(id.to_string());
                    to_start.push((*entry, spec));
                }
            }
        }

        let retired_ids: HashSet<String> = retired.iter().map(|(id, _)| id.clone()).collect();
        self.stop_slots(retired).await;
        for id in &report.stopped {
            if retired_ids.contains(id) {
                self.health.remove(id).await;
            }
        }
        self.forget_deleted(known).await;

        for (entry, spec) in to_start {
            if spec.is_err() {
                report.failed.push(entry.id().to_string());
            }
            let slot = self.start(entry, spec).await;
            slots.insert(entry.id().to_string(), slot);
        }

        if !report.is_empty() {
            tracing::info!(
                started = report.started.len(),
                restarted = report.restarted.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "Collectors reconciled"
            );
        }
        report
    }

    /// Drop the ingest counters of sources missing from this listing that
    /// were present in the previous one.
    async fn forget_deleted(&self, known: HashSet<&str>) {
        let mut previous = self.known.lock().await;
        for id in previous.iter().filter(|id| !known.contains(id.as_str())) {
            let removed = self.persister.counters().remove_source(id);
            tracing::debug!(source_id = %id, series = removed, "Dropped counters of deleted source");
        }
        *previous = known.into_iter().map(str::to_string).collect();
    }

    /// A supervisor that exited on its own (panic) is restarted unless it
    /// stopped for a configuration error.
    async fn needs_revive(&self, id: &str, slot: &Slot) -> bool {
        let Some(handle) = &slot.handle else {
            return false;
        };
        if !handle.is_finished() {
            return false;
        }
        !matches!(
            self.health.get(id).await.map(|h| h.state),
            Some(CollectorState::Failed)
        )
    }

    async fn start(&self, entry: Entry<'_>, spec: Result<CollectorSpec, String>) -> Slot {
        match entry {
            Entry::Source(source) => self.health.register(source).await,
            Entry::Invalid(row) => self.health.register_invalid(row).await,
        }
        let reporter = HealthReporter::new(entry.id(), self.health.clone(), Some(self.sources.clone()));
        let cancel = self.shutdown.child_token();

        let collector = match &spec {
            Ok(spec) => spec.build(self.persister.clone()),
            Err(msg) => Err(CollectorError::Config(msg.clone())),
        };
        let collector = match collector {
            Ok(collector) => collector,
            Err(e) => {
                tracing::error!(source_id = %entry.id(), source = %entry.name(), error = %e, "Collector not started");
                reporter.config_error(&e).await;
                return Slot {
                    spec,
                    cancel,
                    handle: None,
                };
            }
        };

        let ctx = CollectorContext {
            cancel: cancel.clone(),
            health: reporter,
        };
        let handle = tokio::spawn(supervise(collector, ctx, self.options.backoff));
        tracing::info!(source_id = %entry.id(), source = %entry.name(), "Collector started");

        Slot {
            spec,
            cancel,
            handle: Some(handle),
        }
    }

    /// Check that a stored source is reachable with its current settings.
    ///
    /// Runs beside any collector already serving the source and touches
    /// neither its health nor its data.
    ///
    /// # Errors
    /// `Storage(SourceNotFound)` for an unknown id, `Config` for unusable
    /// settings, otherwise the classified connection failure.
    pub async fn test_source(&self, source_id: &str) -> Result<ConnectionCheck, CollectorError> {
        let source = self
            .sources
            .get(source_id)
            .await?
            .ok_or_else(|| StorageError::SourceNotFound(source_id.to_string()))?;
        let collector = CollectorSpec::from_source(&source, &self.options)?
            .build(self.persister.clone())?;

        let result = collector.test_connection().await;
        match &result {
            Ok(check) => tracing::info!(source_id = %source_id, source = %source.name, nodes_seen = ?check.nodes_seen, "Source connection test passed"),
            Err(e) => tracing::warn!(source_id = %source_id, source = %source.name, kind = %e.kind(), error = %e, "Source connection test failed"),
        }
        result
    }

    /// Cancel every slot, then wait for all of them under one grace period.
    /// Returns the number of collectors that had to be aborted.
    async fn stop_slots(&self, slots: Vec<(String, Slot)>) -> usize {
        for (_, slot) in &slots {
            slot.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace;
        let mut aborted = 0;
        for (id, slot) in slots {
            let Some(mut handle) = slot.handle else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::info!(source_id = %id, "Collector stopped"),
                Ok(Err(e)) => tracing::error!(source_id = %id, error = %e, "Collector task failed"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                    tracing::error!(
                        source_id = %id,
                        grace = ?self.options.shutdown_grace,
                        "Collector did not stop within grace period; aborted"
                    );
                }
            }
        }
        aborted
    }

    /// Reconcile on an interval, or sooner when triggered, until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            match self.sources.list_checked().await {
                Ok(listing) => {
                    for row in &listing.invalid {
                        tracing::debug!(source_id = %row.id, source = %row.name, error = %row.error, "Unreadable source row");
                    }
                    self.reconcile_listing(&listing).await;
                }
                Err(e) => tracing::error!(error = %e, "Failed to load sources"),
            }
        }
        tracing::debug!("Reconcile loop stopped");
    }

    /// Stop every collector, waiting up to the shutdown grace period.
    /// Returns the number of collectors that were aborted.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let slots: Vec<_> = self.slots.lock().await.drain().collect();
        let count = slots.len();
        let aborted = self.stop_slots(slots).await;

        if aborted > 0 {
            tracing::error!(count, aborted, "Collector shutdown incomplete");
        } else {
            tracing::info!(count, "Collector shutdown complete");
        }
        aborted
    }
}

/// Run one collector until cancelled or permanently failed.
async fn supervise(collector: Arc<dyn Collector>, ctx: CollectorContext, backoff: BackoffPolicy) {
    let source_id = collector.source_id().to_string();
    let schedule = collector.schedule();
    tracing::debug!(source_id = %source_id, source_type = %collector.source_type(), schedule = %schedule, "Supervisor running");

    loop {
        let result = collector.run_cycle(&ctx).await;
        if ctx.cancel.is_cancelled() {
            break;
        }

        let delay = match result {
            Ok(outcome) => match schedule {
                Schedule::Interval(interval) => {
                    ctx.health.cycle_completed(outcome.data_error).await;
                    interval
                }
                // Session closed without error; reconnect after the base delay.
                Schedule::Continuous => {
                    if let Some(message) = outcome.data_error {
                        ctx.health.note_error(message).await;
                    }
                    backoff.base
                }
            },
            Err(e) if e.kind() == FailureKind::Configuration => {
                tracing::error!(source_id = %source_id, error = %e, "Collector configuration invalid; not retrying");
                ctx.health.config_error(&e).await;
                return;
            }
            Err(e) if !e.counts_as_failure() => {
                tracing::warn!(source_id = %source_id, error = %e, "Collection dropped malformed data");
                ctx.health.data_error(&e).await;
                match schedule {
                    Schedule::Interval(interval) => interval,
                    Schedule::Continuous => backoff.base,
                }
            }
            Err(e) => {
                let failures = ctx.health.consecutive_failures().await.saturating_add(1);
                let wait = backoff.delay_for(failures);
                ctx.health.failure(&e, wait).await;
                tracing::warn!(
                    source_id = %source_id,
                    kind = %e.kind(),
                    failures,
                    retry_in = ?wait,
                    error = %e,
                    "Collection failed"
                );
                match schedule {
                    Schedule::Interval(interval) => interval.max(wait),
                    Schedule::Continuous => wait,
                }
            }
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    ctx.health.stopped().await;
}
