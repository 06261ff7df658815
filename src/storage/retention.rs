//! Retention sweeper.
//!
//! Prunes aged rows per entity type on a fixed interval. Deletes run in
//! bounded batches, each its own short write transaction, so ingestion
//! interleaves with a sweep instead of waiting behind it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumIter};
use tokio_util::sync::CancellationToken;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Default rows deleted per statement.
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

/// Entity types subject to retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum RetainedEntity {
    Messages,
    Telemetry,
    Traceroutes,
}

impl RetainedEntity {
    fn table(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Telemetry => "telemetry",
            Self::Traceroutes => "traceroutes",
        }
    }
}

/// Per-entity max ages. `None` keeps rows forever.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub messages: Option<Duration>,
    pub telemetry: Option<Duration>,
    pub traceroutes: Option<Duration>,
}

impl RetentionPolicy {
    pub fn max_age(&self, entity: RetainedEntity) -> Option<Duration> {
        match entity {
            RetainedEntity::Messages => self.messages,
            RetainedEntity::Telemetry => self.telemetry,
            RetainedEntity::Traceroutes => self.traceroutes,
        }
    }
}

/// Rows deleted by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub messages: u64,
    pub telemetry: u64,
    pub traceroutes: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.messages + self.telemetry + self.traceroutes
    }

    fn record(&mut self, entity: RetainedEntity, deleted: u64) {
        match entity {
            RetainedEntity::Messages => self.messages += deleted,
            RetainedEntity::Telemetry => self.telemetry += deleted,
            RetainedEntity::Traceroutes => self.traceroutes += deleted,
        }
    }
}

pub struct RetentionSweeper {
    pool: SqlitePool,
    policy: RetentionPolicy,
    interval: Duration,
    batch_size: u32,
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("policy", &self.policy)
            .field("interval", &self.interval)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl RetentionSweeper {
    pub fn new(pool: SqlitePool, policy: RetentionPolicy, interval: Duration) -> Self {
        Self {
            pool,
            policy,
            interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Run one sweep relative to the current time.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep relative to `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
        use strum::IntoEnumIterator;

        let mut report = SweepReport::default();
        for entity in RetainedEntity::iter() {
            let Some(max_age) = self.policy.max_age(entity) else {
                continue;
            };
            // An age reaching past the earliest representable time expires nothing.
            let cutoff = chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|age| now.checked_sub_signed(age));
            let Some(cutoff) = cutoff else {
                tracing::debug!(entity = %entity, max_age = ?max_age, "Max age out of range; keeping rows");
                continue;
            };
            let deleted = self.delete_before(entity, cutoff.timestamp_millis()).await?;
            report.record(entity, deleted);
        }
        Ok(report)
    }

    async fn delete_before(
        &self,
        entity: RetainedEntity,
        cutoff_ms: i64,
    ) -> Result<u64, StorageError> {
        let table = entity.table();
        let sql = format!(
            "DELETE FROM {table} WHERE id IN \
             (SELECT id FROM {table} WHERE received_at < ? LIMIT ?)"
        );

        let mut total = 0;
        loop {
            let deleted = sqlx::query(&sql)
                .bind(cutoff_ms)
                .bind(i64::from(self.batch_size))
                .execute(self.pool.inner())
                .await?
                .rows_affected();
            total += deleted;
            if deleted < u64::from(self.batch_size) {
                break;
            }
            // Let queued writers acquire the lock between batches.
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    /// Sweep every `interval` until cancelled.
    ///
    /// A failed sweep is logged and retried at the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.interval, "Retention sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if report.total() > 0 => tracing::info!(
                    messages = report.messages,
                    telemetry = report.telemetry,
                    traceroutes = report.traceroutes,
                    "Retention sweep completed"
                ),
                Ok(_) => tracing::debug!("Retention sweep found nothing to delete"),
                Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
            }
        }
        tracing::info!("Retention sweeper stopped");
    }
}
