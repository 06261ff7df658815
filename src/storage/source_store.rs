//! Source registry access.
//!
//! Sources are owned by the admin collaborator. The collector side only
//! reads them and writes back the health columns (`last_poll_at`,
//! `last_error`, `healthy`, `health_reason`).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::decoder::FormatHint;
use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

// =============================================================================
// Constants
// =============================================================================

/// Default poll interval for poll-based sources (5 minutes).
pub const DEFAULT_POLL_INTERVAL_SECS: i64 = 300;

/// Default broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

// =============================================================================
// Types
// =============================================================================

/// Source variant; selects the collector implementation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SourceType {
    /// HTTP API polled on an interval.
    MeshMonitor,
    /// Broker topic subscription.
    Mqtt,
}

/// Source record stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    /// Unique display name.
    pub name: String,
    pub source_type: SourceType,
    pub enabled: bool,

    pub url: Option<String>,
    pub api_token: Option<String>,
    pub poll_interval_seconds: i64,

    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_pattern: Option<String>,
    pub mqtt_use_tls: bool,
    pub payload_format: FormatHint,

    /// Last successful contact (Unix millis).
    pub last_poll_at: Option<i64>,
    pub last_error: Option<String>,
    pub healthy: bool,
    pub health_reason: Option<String>,

    /// Creation timestamp (Unix millis).
    pub created_at: i64,
    /// Last update timestamp (Unix millis).
    pub updated_at: i64,
}

impl SourceRecord {
    fn blank(name: impl Into<String>, source_type: SourceType) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            source_type,
            enabled: true,
            url: None,
            api_token: None,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECS,
            mqtt_host: None,
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_pattern: None,
            mqtt_use_tls: false,
            payload_format: FormatHint::Auto,
            last_poll_at: None,
            last_error: None,
            healthy: true,
            health_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// New poll-based source.
    pub fn meshmonitor(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::blank(name, SourceType::MeshMonitor)
        }
    }

    /// New broker source.
    pub fn mqtt(
        name: impl Into<String>,
        host: impl Into<String>,
        topic_pattern: impl Into<String>,
    ) -> Self {
        Self {
            mqtt_host: Some(host.into()),
            mqtt_topic_pattern: Some(topic_pattern.into()),
            ..Self::blank(name, SourceType::Mqtt)
        }
    }
}

/// Health columns written back by the collector manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceHealthUpdate {
    /// Set on success.
    pub last_poll_at: Option<i64>,
    /// Replaces the stored error text (`None` clears it).
    pub last_error: Option<String>,
    pub healthy: bool,
    pub health_reason: Option<String>,
}

/// A stored source row that could not be turned into a [`SourceRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidSource {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// Set when only a later column was unreadable.
    pub source_type: Option<SourceType>,
    pub error: String,
}

/// Every stored source, split into usable records and unreadable rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceListing {
    pub valid: Vec<SourceRecord>,
    pub invalid: Vec<InvalidSource>,
}

#[derive(FromRow)]
struct SourceRow {
    id: String,
    name: String,
    source_type: String,
    enabled: bool,
    url: Option<String>,
    api_token: Option<String>,
    poll_interval_seconds: i64,
    mqtt_host: Option<String>,
    mqtt_port: i64,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_topic_pattern: Option<String>,
    mqtt_use_tls: bool,
    payload_format: String,
    last_poll_at: Option<i64>,
    last_error: Option<String>,
    healthy: bool,
    health_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SourceRow> for SourceRecord {
    type Error = StorageError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        let source_type = row.source_type.parse().map_err(|_| {
            StorageError::InvalidData(format!("unknown source type '{}'", row.source_type))
        })?;
        let payload_format = row.payload_format.parse().map_err(|_| {
            StorageError::InvalidData(format!("unknown payload format '{}'", row.payload_format))
        })?;
        let mqtt_port = u16::try_from(row.mqtt_port)
            .map_err(|_| StorageError::InvalidData(format!("invalid port {}", row.mqtt_port)))?;

        Ok(Self {
            id: row.id,
            name: row.name,
            source_type,
            enabled: row.enabled,
            url: row.url,
            api_token: row.api_token,
            poll_interval_seconds: row.poll_interval_seconds,
            mqtt_host: row.mqtt_host,
            mqtt_port,
            mqtt_username: row.mqtt_username,
            mqtt_password: row.mqtt_password,
            mqtt_topic_pattern: row.mqtt_topic_pattern,
            mqtt_use_tls: row.mqtt_use_tls,
            payload_format,
            last_poll_at: row.last_poll_at,
            last_error: row.last_error,
            healthy: row.healthy,
            health_reason: row.health_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, name, source_type, enabled, url, api_token, \
     poll_interval_seconds, mqtt_host, mqtt_port, mqtt_username, mqtt_password, \
     mqtt_topic_pattern, mqtt_use_tls, payload_format, last_poll_at, last_error, healthy, \
     health_reason, created_at, updated_at FROM sources";

// =============================================================================
// Source Store
// =============================================================================

/// Source registry facade.
#[derive(Clone, Debug)]
pub struct SourceStore {
    pool: SqlitePool,
}

impl SourceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new source.
    pub async fn insert(&self, record: &SourceRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sources (
                id, name, source_type, enabled, url, api_token, poll_interval_seconds,
                mqtt_host, mqtt_port, mqtt_username, mqtt_password, mqtt_topic_pattern,
                mqtt_use_tls, payload_format, healthy, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.source_type.as_ref())
        .bind(record.enabled)
        .bind(&record.url)
        .bind(&record.api_token)
        .bind(record.poll_interval_seconds)
        .bind(&record.mqtt_host)
        .bind(i64::from(record.mqtt_port))
        .bind(&record.mqtt_username)
        .bind(&record.mqtt_password)
        .bind(&record.mqtt_topic_pattern)
        .bind(record.mqtt_use_tls)
        .bind(record.payload_format.as_ref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Insert unless a source with the same name exists.
    ///
    /// Returns the id of the inserted record, or `None` when skipped.
    pub async fn insert_if_not_exists(
        &self,
        record: &SourceRecord,
    ) -> Result<Option<String>, StorageError> {
        if self.get_by_name(&record.name).await?.is_some() {
            return Ok(None);
        }
        self.insert(record).await?;
        Ok(Some(record.id.clone()))
    }

    /// Replace the connection settings of an existing source.
    pub async fn update(&self, record: &SourceRecord) -> Result<bool, StorageError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE sources SET
                name = ?, source_type = ?, enabled = ?, url = ?, api_token = ?,
                poll_interval_seconds = ?, mqtt_host = ?, mqtt_port = ?, mqtt_username = ?,
                mqtt_password = ?, mqtt_topic_pattern = ?, mqtt_use_tls = ?,
                payload_format = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.name)
        .bind(record.source_type.as_ref())
        .bind(record.enabled)
        .bind(&record.url)
        .bind(&record.api_token)
        .bind(record.poll_interval_seconds)
        .bind(&record.mqtt_host)
        .bind(i64::from(record.mqtt_port))
        .bind(&record.mqtt_username)
        .bind(&record.mqtt_password)
        .bind(&record.mqtt_topic_pattern)
        .bind(record.mqtt_use_tls)
        .bind(record.payload_format.as_ref())
        .bind(now)
        .bind(&record.id)
        .execute(self.pool.inner())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enable or disable a source.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, StorageError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE sources SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(now)
            .bind(id)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a source and, by cascade, everything collected for it.
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List all sources ordered by name.
    pub async fn list_all(&self) -> Result<Vec<SourceRecord>, StorageError> {
        let rows: Vec<SourceRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY name"))
            .fetch_all(self.pool.inner())
            .await?;
        rows.into_iter().map(SourceRecord::try_from).collect()
    }

    /// List all sources ordered by name, keeping unreadable rows apart
    /// instead of failing the whole listing.
    pub async fn list_checked(&self) -> Result<SourceListing, StorageError> {
        let rows: Vec<SourceRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY name"))
            .fetch_all(self.pool.inner())
            .await?;

        let mut listing = SourceListing::default();
        for row in rows {
            let id = row.id.clone();
            let name = row.name.clone();
            let enabled = row.enabled;
            let source_type = row.source_type.parse().ok();
            match SourceRecord::try_from(row) {
                Ok(record) => listing.valid.push(record),
                Err(e) => listing.invalid.push(InvalidSource {
                    id,
                    name,
                    enabled,
                    source_type,
                    error: e.to_string(),
                }),
            }
        }
        Ok(listing)
    }

    /// Get a source by id.
    pub async fn get(&self, id: &str) -> Result<Option<SourceRecord>, StorageError> {
        let row: Option<SourceRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;
        row.map(SourceRecord::try_from).transpose()
    }

    /// Get a source by its unique name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<SourceRecord>, StorageError> {
        let row: Option<SourceRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE name = ?"))
            .bind(name)
            .fetch_optional(self.pool.inner())
            .await?;
        row.map(SourceRecord::try_from).transpose()
    }

    /// Write back collector health. Only the health columns are touched.
    pub async fn record_health(
        &self,
        id: &str,
        update: &SourceHealthUpdate,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                last_poll_at = COALESCE(?, last_poll_at),
                last_error = ?,
                healthy = ?,
                health_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(update.last_poll_at)
        .bind(&update.last_error)
        .bind(update.healthy)
        .bind(&update.health_reason)
        .bind(id)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }
}
