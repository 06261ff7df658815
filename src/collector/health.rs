//! Per-source collector health.
//!
//! The registry is private to the manager's side: supervisors mutate it
//! through a [`HealthReporter`], everyone else only gets snapshot copies.
//! Each transition is also written back to the source's health columns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tokio::sync::RwLock;

use crate::collector::{CollectorError, FailureKind};
use crate::storage::{
    InvalidSource, SourceHealthUpdate, SourceRecord, SourceStore, SourceType,
};

/// Default consecutive failures before a source is reported unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Lifecycle state of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CollectorState {
    Starting,
    Running,
    Backoff,
    /// Will not be retried until the source changes.
    Failed,
    Stopped,
}

/// Point-in-time health of one collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorHealth {
    pub source_id: String,
    pub source_name: String,
    /// `None` when the stored type itself is unreadable.
    pub source_type: Option<SourceType>,
    pub state: CollectorState,
    pub healthy: bool,
    pub reason: Option<FailureKind>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(with = "humantime_serde")]
    pub current_backoff: Option<Duration>,
    pub last_error: Option<String>,
}

impl CollectorHealth {
    fn new(source_id: &str, source_name: &str, source_type: Option<SourceType>) -> Self {
        Self {
            source_id: source_id.to_string(),
            source_name: source_name.to_string(),
            source_type,
            state: CollectorState::Starting,
            healthy: true,
            reason: None,
            last_success: None,
            consecutive_failures: 0,
            current_backoff: None,
            last_error: None,
        }
    }

    fn as_update(&self, last_poll_at: Option<i64>) -> SourceHealthUpdate {
        SourceHealthUpdate {
            last_poll_at,
            last_error: self.last_error.clone(),
            healthy: self.healthy,
            health_reason: self.reason.map(|r| r.to_string()),
        }
    }
}

/// Shared health table.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RwLock<HashMap<String, CollectorHealth>>>,
    threshold: u32,
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("threshold", &self.threshold)
            .field(
                "sources",
                &self.inner.try_read().map(|h| h.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl HealthRegistry {
    pub fn new(threshold: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            threshold: threshold.max(1),
        }
    }

    /// Copy of every entry, ordered by source name.
    pub async fn snapshot(&self) -> Vec<CollectorHealth> {
        let mut all: Vec<_> = self.inner.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        all
    }

    pub async fn get(&self, source_id: &str) -> Option<CollectorHealth> {
        self.inner.read().await.get(source_id).cloned()
    }

    pub(crate) async fn register(&self, source: &SourceRecord) {
        let health = CollectorHealth::new(&source.id, &source.name, Some(source.source_type));
        self.inner.write().await.insert(source.id.clone(), health);
    }

    /// Entry for a stored row that could not be read as a source.
    pub(crate) async fn register_invalid(&self, source: &InvalidSource) {
        let health = CollectorHealth::new(&source.id, &source.name, source.source_type);
        self.inner.write().await.insert(source.id.clone(), health);
    }

    pub(crate) async fn remove(&self, source_id: &str) {
        self.inner.write().await.remove(source_id);
    }

    async fn update<F>(&self, source_id: &str, f: F) -> Option<CollectorHealth>
    where
        F: FnOnce(&mut CollectorHealth),
    {
        let mut guard = self.inner.write().await;
        let entry = guard.get_mut(source_id)?;
        f(entry);
        Some(entry.clone())
    }
}

/// Handle a supervisor uses to report transitions for one source.
#[derive(Clone)]
pub struct HealthReporter {
    source_id: String,
    registry: HealthRegistry,
    store: Option<SourceStore>,
}

impl std::fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthReporter")
            .field("source_id", &self.source_id)
            .finish_non_exhaustive()
    }
}

impl HealthReporter {
    pub fn new(
        source_id: impl Into<String>,
        registry: HealthRegistry,
        store: Option<SourceStore>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            registry,
            store,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.registry
            .get(&self.source_id)
            .await
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }

    /// Successful contact: resets failures and marks healthy.
    pub async fn success(&self) {
        self.cycle_completed(None).await;
    }

    /// Cycle finished; `data_error` is kept as `last_error` when part of the
    /// cycle's data was dropped, otherwise `last_error` is cleared.
    pub async fn cycle_completed(&self, data_error: Option<String>) {
        let now = Utc::now();
        let health = self
            .registry
            .update(&self.source_id, |h| {
                h.state = CollectorState::Running;
                h.healthy = true;
                h.reason = None;
                h.last_success = Some(now);
                h.consecutive_failures = 0;
                h.current_backoff = None;
                h.last_error = data_error;
            })
            .await;
        if let Some(health) = health {
            self.persist(health.as_update(Some(now.timestamp_millis())))
                .await;
        }
    }

    /// Retryable failure. Returns the new consecutive failure count.
    pub async fn failure(&self, error: &CollectorError, backoff: Duration) -> u32 {
        let threshold = self.registry.threshold;
        let message = error.to_string();
        let kind = error.kind();
        let health = self
            .registry
            .update(&self.source_id, |h| {
                h.state = CollectorState::Backoff;
                h.consecutive_failures = h.consecutive_failures.saturating_add(1);
                h.healthy = h.consecutive_failures < threshold;
                h.reason = Some(kind);
                h.current_backoff = Some(backoff);
                h.last_error = Some(message);
            })
            .await;

        match health {
            Some(health) => {
                let failures = health.consecutive_failures;
                self.persist(health.as_update(None)).await;
                failures
            }
            None => 0,
        }
    }

    /// Dropped data outside a completed cycle: recorded, schedule and
    /// failure count unchanged.
    pub async fn data_error(&self, error: &CollectorError) {
        self.note_error(error.to_string()).await;
    }

    pub(crate) async fn note_error(&self, message: String) {
        let health = self
            .registry
            .update(&self.source_id, |h| h.last_error = Some(message))
            .await;
        if let Some(health) = health {
            self.persist(health.as_update(None)).await;
        }
    }

    /// Permanent configuration failure; the collector will not be retried.
    pub async fn config_error(&self, error: &CollectorError) {
        let message = error.to_string();
        let health = self
            .registry
            .update(&self.source_id, |h| {
                h.state = CollectorState::Failed;
                h.healthy = false;
                h.reason = Some(FailureKind::Configuration);
                h.current_backoff = None;
                h.last_error = Some(message);
            })
            .await;
        if let Some(health) = health {
            self.persist(health.as_update(None)).await;
        }
    }

    pub async fn stopped(&self) {
        self.registry
            .update(&self.source_id, |h| {
                h.state = CollectorState::Stopped;
                h.current_backoff = None;
            })
            .await;
    }

    async fn persist(&self, update: SourceHealthUpdate) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.record_health(&self.source_id, &update).await {
            tracing::warn!(source_id = %self.source_id, error = %e, "Failed to record source health");
        }
    }
}
