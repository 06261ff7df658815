//! Core collector traits and types.

use std::time::Duration;

use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::collector::health::HealthReporter;
use crate::storage::{SourceType, StorageError};

/// Minimum allowed poll interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that can occur during collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Connection refused, reset or otherwise unreachable.
    #[error("network error: {0}")]
    Network(String),

    /// Timeout elapsed.
    #[error("timeout elapsed")]
    Timeout,

    /// Upstream rejected the credential.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Upstream returned something that could not be used.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// Failed to write to storage.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Required source field missing or invalid.
    #[error("config error: {0}")]
    Config(String),
}

/// Failure classification driving retry and health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Retried with backoff.
    Transient,
    /// Retried with backoff, reported distinctly.
    Authentication,
    /// The unit of work is dropped; schedule unaffected.
    MalformedData,
    /// Cycle aborted; remainder retried next cycle.
    Storage,
    /// Never retried.
    Configuration,
}

impl CollectorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network(_) | Self::Timeout => FailureKind::Transient,
            Self::Authentication(_) => FailureKind::Authentication,
            Self::MalformedData(_) => FailureKind::MalformedData,
            Self::Storage(e) if e.is_invalid_data() => FailureKind::MalformedData,
            Self::Storage(_) => FailureKind::Storage,
            Self::Config(_) => FailureKind::Configuration,
        }
    }

    /// Whether this failure counts toward the consecutive-failure threshold.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self.kind(),
            FailureKind::MalformedData | FailureKind::Configuration
        )
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::MalformedData(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Schedule for collector execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// One cycle per interval. Interval is clamped to a minimum of 1 second.
    Interval(Duration),

    /// A cycle runs until it fails or is cancelled (a broker session).
    Continuous,
}

impl Schedule {
    /// Create an interval schedule.
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(duration)
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {}", humantime::format_duration(*d)),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// How a cycle that did not fail ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Last data error that dropped part of the cycle's work.
    pub data_error: Option<String>,
}

impl CycleOutcome {
    pub fn complete() -> Self {
        Self::default()
    }

    pub fn partial(error: &CollectorError) -> Self {
        Self {
            data_error: Some(error.to_string()),
        }
    }
}

/// Result of a one-off reachability check against a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCheck {
    /// Nodes on the first listing page (poll sources only).
    pub nodes_seen: Option<usize>,
}

/// Per-run context handed to a collector by its supervisor.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    /// Cancelled when the manager stops this collector.
    pub cancel: CancellationToken,
    /// Health write-back for mid-cycle transitions (a broker ConnAck).
    pub health: HealthReporter,
}

/// Core collector trait for implementing data collectors.
///
/// The manager depends only on this capability set. A supervisor task calls
/// [`Collector::run_cycle`] repeatedly according to [`Collector::schedule`],
/// applying backoff between failed cycles.
///
/// # Error Handling
///
/// - Per-record and per-packet decode problems are handled inside the cycle
///   (logged, counted, dropped); they never fail the cycle. A dropped page
///   is returned as [`CycleOutcome::data_error`].
/// - A returned error is classified by [`CollectorError::kind`]:
///   configuration errors stop the collector for good, everything else is
///   retried.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Source this collector serves.
    fn source_id(&self) -> &str;

    /// Source variant.
    fn source_type(&self) -> SourceType;

    /// How cycles are scheduled.
    fn schedule(&self) -> Schedule;

    /// Perform one collection cycle.
    ///
    /// Must return promptly once `ctx.cancel` fires. Data errors that only
    /// dropped part of the work are reported through the outcome.
    async fn run_cycle(&self, ctx: &CollectorContext) -> Result<CycleOutcome, CollectorError>;

    /// Check the upstream is reachable and accepts the configured
    /// credentials, without collecting anything. Bounded by the source's
    /// request or connect timeout.
    async fn test_connection(&self) -> Result<ConnectionCheck, CollectorError>;
}
