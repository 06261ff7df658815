//! Database schema definitions.
//!
//! All timestamps are unix milliseconds. Child tables reference `sources`
//! with `ON DELETE CASCADE` so removing a source removes its data.

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Configured upstreams. Written by the admin collaborator, health columns by
/// the collector manager.
pub const SOURCES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id                    TEXT PRIMARY KEY,
    name                  TEXT NOT NULL UNIQUE,
    source_type           TEXT NOT NULL,
    enabled               INTEGER NOT NULL DEFAULT 1,
    url                   TEXT,
    api_token             TEXT,
    poll_interval_seconds INTEGER NOT NULL DEFAULT 300,
    mqtt_host             TEXT,
    mqtt_port             INTEGER NOT NULL DEFAULT 1883,
    mqtt_username         TEXT,
    mqtt_password         TEXT,
    mqtt_topic_pattern    TEXT,
    mqtt_use_tls          INTEGER NOT NULL DEFAULT 0,
    payload_format        TEXT NOT NULL DEFAULT 'auto',
    last_poll_at          INTEGER,
    last_error            TEXT,
    healthy               INTEGER NOT NULL DEFAULT 1,
    health_reason         TEXT,
    created_at            INTEGER NOT NULL,
    updated_at            INTEGER NOT NULL
);
"#;

/// Per-(source, node) latest state.
pub const NODES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id          TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    node_num           INTEGER NOT NULL,
    node_id            TEXT,
    short_name         TEXT,
    long_name          TEXT,
    hw_model           TEXT,
    role               TEXT,
    is_licensed        INTEGER,
    latitude           REAL,
    longitude          REAL,
    altitude           INTEGER,
    position_precision INTEGER,
    position_time      INTEGER,
    battery_level      INTEGER,
    voltage            REAL,
    last_heard         INTEGER,
    first_seen         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL,
    UNIQUE (source_id, node_num)
);
"#;

/// Text messages and reactions, deduplicated per source by packet id.
pub const MESSAGES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id   TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    packet_id   INTEGER NOT NULL,
    from_node   INTEGER NOT NULL,
    to_node     INTEGER,
    channel     INTEGER,
    text        TEXT,
    reply_id    INTEGER,
    emoji       INTEGER,
    hop_limit   INTEGER,
    hop_start   INTEGER,
    rx_snr      REAL,
    rx_rssi     INTEGER,
    received_at INTEGER NOT NULL,
    UNIQUE (source_id, packet_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_received_at ON messages (received_at);
"#;

/// Append-only telemetry log.
pub const TELEMETRY_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS telemetry (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id           TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    node_num            INTEGER NOT NULL,
    telemetry_type      TEXT NOT NULL,
    battery_level       INTEGER,
    voltage             REAL,
    channel_utilization REAL,
    air_util_tx         REAL,
    uptime_seconds      INTEGER,
    temperature         REAL,
    relative_humidity   REAL,
    barometric_pressure REAL,
    latitude            REAL,
    longitude           REAL,
    altitude            INTEGER,
    received_at         INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_telemetry_received_at ON telemetry (received_at);
CREATE INDEX IF NOT EXISTS idx_telemetry_node ON telemetry (source_id, node_num, received_at);
"#;

/// Append-only route snapshots. Hop arrays are stored as JSON text.
pub const TRACEROUTES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS traceroutes (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id   TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    from_node   INTEGER NOT NULL,
    to_node     INTEGER NOT NULL,
    route       TEXT NOT NULL DEFAULT '[]',
    route_back  TEXT NOT NULL DEFAULT '[]',
    snr_towards TEXT NOT NULL DEFAULT '[]',
    snr_back    TEXT NOT NULL DEFAULT '[]',
    received_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_traceroutes_received_at ON traceroutes (received_at);
"#;

/// Channel configuration snapshots.
pub const CHANNELS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id     TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    channel_index INTEGER NOT NULL,
    name          TEXT,
    updated_at    INTEGER NOT NULL,
    UNIQUE (source_id, channel_index)
);
"#;

const ALL_DDL: [&str; 6] = [
    SOURCES_TABLE_DDL,
    NODES_TABLE_DDL,
    MESSAGES_TABLE_DDL,
    TELEMETRY_TABLE_DDL,
    TRACEROUTES_TABLE_DDL,
    CHANNELS_TABLE_DDL,
];

/// Initialize the database schema.
///
/// Creates all tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in ALL_DDL {
        sqlx::raw_sql(ddl).execute(pool.inner()).await?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(name)
                .fetch_one(pool.inner())
                .await
                .unwrap();
        row.0 == 1
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("schema.db").display());
        let pool = SqlitePool::connect(&url).await.unwrap();

        init_schema(&pool).await.unwrap();
        // Idempotent
        init_schema(&pool).await.unwrap();

        for table in [
            "sources",
            "nodes",
            "messages",
            "telemetry",
            "traceroutes",
            "channels",
        ] {
            assert!(table_exists(&pool, table).await, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_source_delete_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("cascade.db").display());
        let pool = SqlitePool::connect(&url).await.unwrap();
        init_schema(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO sources (id, name, source_type, created_at, updated_at)
             VALUES ('s1', 'one', 'mqtt', 0, 0)",
        )
        .execute(pool.inner())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO nodes (source_id, node_num, first_seen, updated_at)
             VALUES ('s1', 7, 0, 0)",
        )
        .execute(pool.inner())
        .await
        .unwrap();

        sqlx::query("DELETE FROM sources WHERE id = 's1'")
            .execute(pool.inner())
            .await
            .unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
