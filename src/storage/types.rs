//! Read-side row types and queries backing the state gauges.
//!
//! Everything here is re-derived from storage on each call; nothing is
//! cached between metric scrapes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Nodes heard within a window, per source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ActiveNodeCount {
    pub source_id: String,
    pub active_nodes: i64,
}

/// Latest per-node device facts.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct NodeGauge {
    pub source_id: String,
    pub node_num: i64,
    pub battery_level: Option<i64>,
    pub voltage: Option<f64>,
    pub position_precision: Option<i64>,
}

#[derive(Clone)]
pub struct StatsReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for StatsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsReader").finish_non_exhaustive()
    }
}

impl StatsReader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Count nodes with `last_heard >= since` for every source, including
    /// sources with none.
    pub async fn active_node_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActiveNodeCount>, StorageError> {
        let rows = sqlx::query_as::<_, ActiveNodeCount>(
            r#"
            SELECT s.id AS source_id, COUNT(n.id) AS active_nodes
            FROM sources s
            LEFT JOIN nodes n ON n.source_id = s.id AND n.last_heard >= ?
            GROUP BY s.id
            ORDER BY s.id
            "#,
        )
        .bind(since.timestamp_millis())
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows)
    }

    /// Device facts for nodes heard since `since` that report any of them.
    pub async fn node_gauges(&self, since: DateTime<Utc>) -> Result<Vec<NodeGauge>, StorageError> {
        let rows = sqlx::query_as::<_, NodeGauge>(
            r#"
            SELECT source_id, node_num, battery_level, voltage, position_precision
            FROM nodes
            WHERE last_heard >= ?
              AND (battery_level IS NOT NULL OR voltage IS NOT NULL
                   OR position_precision IS NOT NULL)
            ORDER BY source_id, node_num
            "#,
        )
        .bind(since.timestamp_millis())
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;

    #[tokio::test]
    async fn test_active_counts_include_empty_sources() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("stats.db").display());
        let pool = SqlitePool::connect(&url).await.unwrap();
        init_schema(&pool).await.unwrap();

        for id in ["a", "b"] {
            sqlx::query(
                "INSERT INTO sources (id, name, source_type, created_at, updated_at)
                 VALUES (?, ?, 'mqtt', 0, 0)",
            )
            .bind(id)
            .bind(id)
            .execute(pool.inner())
            .await
            .unwrap();
        }
        let now = Utc::now();
        let recent = now.timestamp_millis();
        let stale = (now - chrono::Duration::hours(5)).timestamp_millis();
        for (num, heard, battery) in [(1, recent, Some(80)), (2, recent, None), (3, stale, Some(10))] {
            sqlx::query(
                "INSERT INTO nodes (source_id, node_num, battery_level, last_heard, first_seen, updated_at)
                 VALUES ('a', ?, ?, ?, 0, 0)",
            )
            .bind(num)
            .bind(battery)
            .bind(heard)
            .execute(pool.inner())
            .await
            .unwrap();
        }

        let reader = StatsReader::new(pool);
        let since = now - chrono::Duration::hours(1);
        let counts = reader.active_node_counts(since).await.unwrap();
        assert_eq!(
            counts,
            vec![
                ActiveNodeCount { source_id: "a".into(), active_nodes: 2 },
                ActiveNodeCount { source_id: "b".into(), active_nodes: 0 },
            ]
        );

        let gauges = reader.node_gauges(since).await.unwrap();
        assert_eq!(gauges.len(), 1);
        assert_eq!(gauges[0].node_num, 1);
        assert_eq!(gauges[0].battery_level, Some(80));
    }
}
