//! Normalizer/persister.
//!
//! Resolves decoded packets against stored state and writes them with
//! idempotent upserts. Every write for a single packet happens inside one
//! transaction, node first, so readers never see a message or telemetry row
//! for a node that does not exist yet.
//!
//! Merge rules:
//! - `last_heard` only moves forward (`CASE WHEN excluded.last_heard > ...`),
//!   so concurrent writers cannot regress it regardless of arrival order.
//! - `first_seen` is written on insert and never updated.
//! - Identity fields merge with `COALESCE`: a partial packet never erases
//!   what is known. Position and battery only apply when the observation is
//!   not older than the stored `last_heard`.
//! - Messages are insert-or-ignore on `(source_id, packet_id)`.
//! - Telemetry and traceroutes are append-only.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::decoder::{
    DecodedPacket, DeviceMetrics, NodeInfo, NormalizedEvent, Position, Telemetry, TelemetryKind,
    TextMessage, Traceroute, node_id_for,
};
use crate::metrics::IngestCounters;
use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Mutable node attributes carried by one observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFields {
    pub node_id: Option<String>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub hw_model: Option<String>,
    pub role: Option<String>,
    pub is_licensed: Option<bool>,
    pub position: Option<Position>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
}

impl NodeFields {
    fn from_info(info: &NodeInfo) -> Self {
        Self {
            node_id: info.node_id.clone(),
            short_name: info.short_name.clone(),
            long_name: info.long_name.clone(),
            hw_model: info.hw_model.clone(),
            role: info.role.clone(),
            is_licensed: info.is_licensed,
            ..Default::default()
        }
    }

    fn from_device(device: Option<&DeviceMetrics>) -> Self {
        Self {
            battery_level: device.and_then(|d| d.battery_level),
            voltage: device.and_then(|d| d.voltage),
            ..Default::default()
        }
    }
}

/// Row counts produced by one or more applied packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub nodes_upserted: u64,
    pub messages_inserted: u64,
    pub messages_duplicate: u64,
    pub telemetry_appended: u64,
    pub traceroutes_appended: u64,
    /// Packets dropped as malformed before any write.
    pub rejected: u64,
}

impl std::ops::AddAssign for ApplyOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.nodes_upserted += rhs.nodes_upserted;
        self.messages_inserted += rhs.messages_inserted;
        self.messages_duplicate += rhs.messages_duplicate;
        self.telemetry_appended += rhs.telemetry_appended;
        self.traceroutes_appended += rhs.traceroutes_appended;
        self.rejected += rhs.rejected;
    }
}

/// Message columns.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub packet_id: u32,
    pub from: u32,
    pub to: Option<u32>,
    pub channel: Option<u32>,
    pub text: String,
    pub reply_id: Option<u32>,
    pub emoji: Option<u32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub received_at: DateTime<Utc>,
}

impl MessageRecord {
    fn from_packet(
        packet: &DecodedPacket,
        text: &TextMessage,
        received_at: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let packet_id = packet.packet_id.ok_or_else(|| {
            StorageError::InvalidData(format!("message from {} has no packet id", packet.from))
        })?;
        Ok(Self {
            packet_id,
            from: packet.from,
            to: packet.to,
            channel: packet.channel,
            text: text.text.clone(),
            reply_id: text.reply_id,
            emoji: text.emoji,
            hop_limit: packet.hop_limit,
            hop_start: packet.hop_start,
            rx_snr: packet.rx_snr,
            rx_rssi: packet.rx_rssi,
            received_at,
        })
    }
}

/// Persistence facade shared by all collectors.
#[derive(Clone)]
pub struct Persister {
    pool: SqlitePool,
    counters: IngestCounters,
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister").finish_non_exhaustive()
    }
}

impl Persister {
    pub fn new(pool: SqlitePool, counters: IngestCounters) -> Self {
        Self { pool, counters }
    }

    /// Counters incremented on persistence; collectors also record decode
    /// failures here.
    pub fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    /// Insert or merge a node observation.
    pub async fn upsert_node(
        &self,
        source_id: &str,
        node_num: u32,
        fields: &NodeFields,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.inner().begin().await?;
        upsert_node_in(&mut tx, source_id, node_num, fields, observed_at).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert a message unless `(source_id, packet_id)` already exists.
    ///
    /// Returns `true` when a row was written. The sender node is created in
    /// the same transaction if missing.
    pub async fn insert_message(
        &self,
        source_id: &str,
        message: &MessageRecord,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.inner().begin().await?;
        touch_node_in(&mut tx, source_id, message.from, message.received_at).await?;
        let inserted = insert_message_in(&mut tx, source_id, message).await?;
        tx.commit().await?;
        if inserted {
            self.counters.message_received(source_id);
        }
        Ok(inserted)
    }

    /// Append a telemetry sample for a node.
    pub async fn append_telemetry(
        &self,
        source_id: &str,
        node_num: u32,
        telemetry: &Telemetry,
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.inner().begin().await?;
        let fields = NodeFields::from_device(telemetry.device.as_ref());
        upsert_node_in(&mut tx, source_id, node_num, &fields, received_at).await?;
        append_telemetry_in(&mut tx, source_id, node_num, telemetry, received_at).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append a route snapshot. Rejects mismatched SNR arrays.
    pub async fn append_traceroute(
        &self,
        source_id: &str,
        from: u32,
        to: u32,
        route: &Traceroute,
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        route.validate().map_err(StorageError::InvalidData)?;
        let mut tx = self.pool.inner().begin().await?;
        touch_node_in(&mut tx, source_id, from, received_at).await?;
        append_traceroute_in(&mut tx, source_id, from, to, route, received_at).await?;
        tx.commit().await?;
        self.counters.traceroute_received(source_id);
        Ok(())
    }

    /// Latest-wins channel snapshot.
    pub async fn upsert_channel(
        &self,
        source_id: &str,
        channel_index: u32,
        name: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.inner().acquire().await?;
        upsert_channel_in(&mut conn, source_id, channel_index, name).await
    }

    /// Apply one decoded packet atomically.
    ///
    /// `received_at` is used when the packet carries no event time.
    pub async fn apply(
        &self,
        source_id: &str,
        packet: &DecodedPacket,
        received_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StorageError> {
        validate_packet(packet)?;
        let mut tx = self.pool.inner().begin().await?;
        let outcome = apply_in(&mut tx, source_id, packet, received_at).await?;
        tx.commit().await?;
        self.count(source_id, &outcome);
        Ok(outcome)
    }

    /// Apply a page of packets in a single transaction.
    ///
    /// Malformed packets are skipped and counted in
    /// [`ApplyOutcome::rejected`]; a storage failure rolls back the page.
    pub async fn apply_batch(
        &self,
        source_id: &str,
        packets: &[DecodedPacket],
        received_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StorageError> {
        let mut outcome = ApplyOutcome::default();
        let mut tx = self.pool.inner().begin().await?;
        for packet in packets {
            if let Err(e) = validate_packet(packet) {
                tracing::debug!(source_id = %source_id, from = packet.from, error = %e, "Dropping malformed record");
                outcome.rejected += 1;
                continue;
            }
            outcome += apply_in(&mut tx, source_id, packet, received_at).await?;
        }
        tx.commit().await?;
        self.count(source_id, &outcome);
        Ok(outcome)
    }

    fn count(&self, source_id: &str, outcome: &ApplyOutcome) {
        self.counters
            .messages_received(source_id, outcome.messages_inserted);
        self.counters
            .traceroutes_received(source_id, outcome.traceroutes_appended);
    }
}

fn validate_packet(packet: &DecodedPacket) -> Result<(), StorageError> {
    match &packet.event {
        NormalizedEvent::Text(_) if packet.packet_id.is_none() => Err(StorageError::InvalidData(
            format!("message from {} has no packet id", packet.from),
        )),
        NormalizedEvent::Traceroute(route) => {
            route.validate().map_err(StorageError::InvalidData)?;
            if packet.to.is_none() {
                return Err(StorageError::InvalidData(
                    "traceroute without destination".to_string(),
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn apply_in(
    conn: &mut SqliteConnection,
    source_id: &str,
    packet: &DecodedPacket,
    received_at: DateTime<Utc>,
) -> Result<ApplyOutcome, StorageError> {
    let observed_at = packet.observed_at().unwrap_or(received_at);
    let mut outcome = ApplyOutcome {
        nodes_upserted: 1,
        ..Default::default()
    };

    match &packet.event {
        NormalizedEvent::Text(text) => {
            touch_node_in(conn, source_id, packet.from, observed_at).await?;
            let message = MessageRecord::from_packet(packet, text, observed_at)?;
            if insert_message_in(conn, source_id, &message).await? {
                outcome.messages_inserted = 1;
            } else {
                outcome.messages_duplicate = 1;
            }
        }
        NormalizedEvent::Position(position) => {
            let fields = NodeFields {
                position: position.has_fix().then(|| position.clone()),
                ..Default::default()
            };
            upsert_node_in(conn, source_id, packet.from, &fields, observed_at).await?;
            if position.has_fix() {
                let sample = Telemetry {
                    kind: TelemetryKind::Position,
                    time: position.time,
                    device: None,
                    environment: None,
                };
                append_row(conn, source_id, packet.from, &sample, Some(position), observed_at)
                    .await?;
                outcome.telemetry_appended = 1;
            }
        }
        NormalizedEvent::Telemetry(telemetry) => {
            let fields = NodeFields::from_device(telemetry.device.as_ref());
            upsert_node_in(conn, source_id, packet.from, &fields, observed_at).await?;
            append_telemetry_in(conn, source_id, packet.from, telemetry, observed_at).await?;
            outcome.telemetry_appended = 1;
        }
        NormalizedEvent::Traceroute(route) => {
            let to = packet.to.ok_or_else(|| {
                StorageError::InvalidData("traceroute without destination".to_string())
            })?;
            touch_node_in(conn, source_id, packet.from, observed_at).await?;
            append_traceroute_in(conn, source_id, packet.from, to, route, observed_at).await?;
            outcome.traceroutes_appended = 1;
        }
        NormalizedEvent::NodeInfo(info) => {
            let fields = NodeFields::from_info(info);
            upsert_node_in(conn, source_id, packet.from, &fields, observed_at).await?;
        }
        NormalizedEvent::NodeSnapshot { info, position } => {
            let fields = NodeFields {
                position: position.clone(),
                ..NodeFields::from_info(info)
            };
            upsert_node_in(conn, source_id, packet.from, &fields, observed_at).await?;
        }
    }

    if let Some(index) = packet.channel {
        upsert_channel_in(conn, source_id, index, packet.channel_name.as_deref()).await?;
    }

    Ok(outcome)
}

/// Ensure the node exists and advance `last_heard`.
async fn touch_node_in(
    conn: &mut SqliteConnection,
    source_id: &str,
    node_num: u32,
    observed_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    upsert_node_in(conn, source_id, node_num, &NodeFields::default(), observed_at).await
}

async fn upsert_node_in(
    conn: &mut SqliteConnection,
    source_id: &str,
    node_num: u32,
    fields: &NodeFields,
    observed_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    let observed = observed_at.timestamp_millis();
    let now = Utc::now().timestamp_millis();
    let position = fields.position.as_ref().filter(|p| p.has_fix());
    // ?3 is the reported id, ?19 the id derived from the node number. Only a
    // reported id replaces a stored one.

    sqlx::query(
        r#"
        INSERT INTO nodes (
            source_id, node_num, node_id, short_name, long_name, hw_model, role, is_licensed,
            latitude, longitude, altitude, position_precision, position_time,
            battery_level, voltage, last_heard, first_seen, updated_at
        ) VALUES (
            ?1, ?2, COALESCE(?3, ?19), ?4, ?5, ?6, ?7, ?8,
            ?9, ?10, ?11, ?12, ?13,
            ?14, ?15, ?16, ?17, ?18
        )
        ON CONFLICT (source_id, node_num) DO UPDATE SET
            node_id     = COALESCE(?3, nodes.node_id),
            short_name  = COALESCE(excluded.short_name, nodes.short_name),
            long_name   = COALESCE(excluded.long_name, nodes.long_name),
            hw_model    = COALESCE(excluded.hw_model, nodes.hw_model),
            role        = COALESCE(excluded.role, nodes.role),
            is_licensed = COALESCE(excluded.is_licensed, nodes.is_licensed),
            latitude = CASE WHEN excluded.latitude IS NOT NULL
                AND excluded.last_heard >= COALESCE(nodes.last_heard, 0)
                THEN excluded.latitude ELSE nodes.latitude END,
            longitude = CASE WHEN excluded.latitude IS NOT NULL
                AND excluded.last_heard >= COALESCE(nodes.last_heard, 0)
                THEN excluded.longitude ELSE nodes.longitude END,
            altitude = CASE WHEN excluded.latitude IS NOT NULL
                AND excluded.last_heard >= COALESCE(nodes.last_heard, 0)
                THEN excluded.altitude ELSE nodes.altitude END,
            position_precision = CASE WHEN excluded.latitude IS NOT NULL
                AND excluded.last_heard >= COALESCE(nodes.last_heard, 0)
                THEN COALESCE(excluded.position_precision, nodes.position_precision)
                ELSE nodes.position_precision END,
            position_time = CASE WHEN excluded.latitude IS NOT NULL
                AND excluded.last_heard >= COALESCE(nodes.last_heard, 0)
                THEN excluded.position_time ELSE nodes.position_time END,
            battery_level = CASE WHEN excluded.battery_level IS NOT NULL
                AND excluded.last_heard >= COALESCE(nodes.last_heard, 0)
                THEN excluded.battery_level ELSE nodes.battery_level END,
            voltage = CASE WHEN excluded.voltage IS NOT NULL
                AND excluded.last_heard >= COALESCE(nodes.last_heard, 0)
                THEN excluded.voltage ELSE nodes.voltage END,
            last_heard = CASE WHEN nodes.last_heard IS NULL
                OR excluded.last_heard > nodes.last_heard
                THEN excluded.last_heard ELSE nodes.last_heard END,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(source_id)
    .bind(i64::from(node_num))
    .bind(&fields.node_id)
    .bind(&fields.short_name)
    .bind(&fields.long_name)
    .bind(&fields.hw_model)
    .bind(&fields.role)
    .bind(fields.is_licensed)
    .bind(position.and_then(Position::latitude))
    .bind(position.and_then(Position::longitude))
    .bind(position.and_then(|p| p.altitude))
    .bind(position.and_then(|p| p.precision_bits).map(i64::from))
    .bind(position.and_then(|p| p.time).map(|t| t.timestamp_millis()))
    .bind(fields.battery_level.map(i64::from))
    .bind(fields.voltage.map(f64::from))
    .bind(observed)
    .bind(observed)
    .bind(now)
    .bind(node_id_for(node_num))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_message_in(
    conn: &mut SqliteConnection,
    source_id: &str,
    m: &MessageRecord,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        r#"
        INSERT INTO messages (
            source_id, packet_id, from_node, to_node, channel, text, reply_id, emoji,
            hop_limit, hop_start, rx_snr, rx_rssi, received_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (source_id, packet_id) DO NOTHING
        "#,
    )
    .bind(source_id)
    .bind(i64::from(m.packet_id))
    .bind(i64::from(m.from))
    .bind(m.to.map(i64::from))
    .bind(m.channel.map(i64::from))
    .bind(&m.text)
    .bind(m.reply_id.map(i64::from))
    .bind(m.emoji.map(i64::from))
    .bind(m.hop_limit.map(i64::from))
    .bind(m.hop_start.map(i64::from))
    .bind(m.rx_snr.map(f64::from))
    .bind(m.rx_rssi)
    .bind(m.received_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn append_telemetry_in(
    conn: &mut SqliteConnection,
    source_id: &str,
    node_num: u32,
    telemetry: &Telemetry,
    received_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    append_row(conn, source_id, node_num, telemetry, None, received_at).await
}

async fn append_row(
    conn: &mut SqliteConnection,
    source_id: &str,
    node_num: u32,
    telemetry: &Telemetry,
    position: Option<&Position>,
    received_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    let device = telemetry.device.clone().unwrap_or_default();
    let env = telemetry.environment.clone().unwrap_or_default();

    sqlx::query(
        r#"
        INSERT INTO telemetry (
            source_id, node_num, telemetry_type, battery_level, voltage, channel_utilization,
            air_util_tx, uptime_seconds, temperature, relative_humidity, barometric_pressure,
            latitude, longitude, altitude, received_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(source_id)
    .bind(i64::from(node_num))
    .bind(telemetry.kind.as_ref())
    .bind(device.battery_level.map(i64::from))
    .bind(device.voltage.map(f64::from))
    .bind(device.channel_utilization.map(f64::from))
    .bind(device.air_util_tx.map(f64::from))
    .bind(device.uptime_seconds.map(i64::from))
    .bind(env.temperature.map(f64::from))
    .bind(env.relative_humidity.map(f64::from))
    .bind(env.barometric_pressure.map(f64::from))
    .bind(position.and_then(Position::latitude))
    .bind(position.and_then(Position::longitude))
    .bind(position.and_then(|p| p.altitude))
    .bind(received_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn append_traceroute_in(
    conn: &mut SqliteConnection,
    source_id: &str,
    from: u32,
    to: u32,
    route: &Traceroute,
    received_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO traceroutes (
            source_id, from_node, to_node, route, route_back, snr_towards, snr_back, received_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(source_id)
    .bind(i64::from(from))
    .bind(i64::from(to))
    .bind(serde_json::to_string(&route.route)?)
    .bind(serde_json::to_string(&route.route_back)?)
    .bind(serde_json::to_string(&route.snr_towards)?)
    .bind(serde_json::to_string(&route.snr_back)?)
    .bind(received_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_channel_in(
    conn: &mut SqliteConnection,
    source_id: &str,
    channel_index: u32,
    name: Option<&str>,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO channels (source_id, channel_index, name, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (source_id, channel_index) DO UPDATE SET
            name = COALESCE(excluded.name, channels.name),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(source_id)
    .bind(i64::from(channel_index))
    .bind(name)
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::EnvironmentMetrics;
    use crate::storage::schema::init_schema;
    use tempfile::TempDir;

    const SOURCE: &str = "src-1";

    async fn setup() -> (Persister, SqlitePool, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("persist.db").display());
        let pool = SqlitePool::connect(&url).await.unwrap();
        init_schema(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO sources (id, name, source_type, created_at, updated_at)
             VALUES (?, 'test', 'mqtt', 0, 0)",
        )
        .bind(SOURCE)
        .execute(pool.inner())
        .await
        .unwrap();
        let persister = Persister::new(pool.clone(), IngestCounters::new().unwrap());
        (persister, pool, dir)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool.inner())
            .await
            .unwrap();
        row.0
    }

    async fn last_heard(pool: &SqlitePool, node_num: u32) -> i64 {
        let row: (i64,) =
            sqlx::query_as("SELECT last_heard FROM nodes WHERE source_id = ? AND node_num = ?")
                .bind(SOURCE)
                .bind(i64::from(node_num))
                .fetch_one(pool.inner())
                .await
                .unwrap();
        row.0
    }

    fn text_packet(packet_id: u32, from: u32, secs: i64) -> DecodedPacket {
        let mut packet = DecodedPacket::new(
            from,
            NormalizedEvent::Text(TextMessage {
                text: "hello".to_string(),
                reply_id: None,
                emoji: None,
            }),
        );
        packet.packet_id = Some(packet_id);
        packet.rx_time = Some(at(secs));
        packet.channel = Some(0);
        packet
    }

    #[tokio::test]
    async fn test_last_heard_is_monotonic_in_either_order() {
        let (persister, pool, _dir) = setup().await;
        let older = at(1_000);
        let newer = at(2_000);

        persister
            .upsert_node(SOURCE, 1, &NodeFields::default(), older)
            .await
            .unwrap();
        persister
            .upsert_node(SOURCE, 1, &NodeFields::default(), newer)
            .await
            .unwrap();

        persister
            .upsert_node(SOURCE, 2, &NodeFields::default(), newer)
            .await
            .unwrap();
        persister
            .upsert_node(SOURCE, 2, &NodeFields::default(), older)
            .await
            .unwrap();

        assert_eq!(last_heard(&pool, 1).await, newer.timestamp_millis());
        assert_eq!(last_heard(&pool, 2).await, newer.timestamp_millis());
    }

    #[tokio::test]
    async fn test_first_seen_never_overwritten_and_fields_merge() {
        let (persister, pool, _dir) = setup().await;

        let named = NodeFields {
            long_name: Some("Ridge".to_string()),
            hw_model: Some("TBEAM".to_string()),
            ..Default::default()
        };
        persister.upsert_node(SOURCE, 5, &named, at(100)).await.unwrap();

        let positioned = NodeFields {
            position: Some(Position {
                latitude_i: Some(400_000_000),
                longitude_i: Some(-1_050_000_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        persister
            .upsert_node(SOURCE, 5, &positioned, at(200))
            .await
            .unwrap();

        let row: (i64, Option<String>, Option<String>, Option<f64>) = sqlx::query_as(
            "SELECT first_seen, long_name, hw_model, latitude FROM nodes WHERE node_num = 5",
        )
        .fetch_one(pool.inner())
        .await
        .unwrap();
        assert_eq!(row.0, at(100).timestamp_millis());
        assert_eq!(row.1.as_deref(), Some("Ridge"));
        assert_eq!(row.2.as_deref(), Some("TBEAM"));
        assert!((row.3.unwrap() - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reported_node_id_survives_touches() {
        let (persister, pool, _dir) = setup().await;
        let stored_id = |pool: SqlitePool, node_num: u32| async move {
            let row: (String,) = sqlx::query_as("SELECT node_id FROM nodes WHERE node_num = ?")
                .bind(i64::from(node_num))
                .fetch_one(pool.inner())
                .await
                .unwrap();
            row.0
        };

        // A fresh node without a reported id gets the derived one.
        persister
            .upsert_node(SOURCE, 0xabcd, &NodeFields::default(), at(100))
            .await
            .unwrap();
        assert_eq!(stored_id(pool.clone(), 0xabcd).await, "!0000abcd");

        let reported = NodeFields {
            node_id: Some("!relay-7".to_string()),
            ..Default::default()
        };
        persister.upsert_node(SOURCE, 7, &reported, at(100)).await.unwrap();
        persister
            .upsert_node(SOURCE, 7, &NodeFields::default(), at(200))
            .await
            .unwrap();
        assert_eq!(stored_id(pool.clone(), 7).await, "!relay-7");

        let renamed = NodeFields {
            node_id: Some("!relay-8".to_string()),
            ..Default::default()
        };
        persister.upsert_node(SOURCE, 7, &renamed, at(300)).await.unwrap();
        assert_eq!(stored_id(pool.clone(), 7).await, "!relay-8");
    }

    #[tokio::test]
    async fn test_stale_position_does_not_override() {
        let (persister, pool, _dir) = setup().await;
        let fields = |lat: i32| NodeFields {
            position: Some(Position {
                latitude_i: Some(lat),
                longitude_i: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        };
        persister
            .upsert_node(SOURCE, 8, &fields(200_000_000), at(2_000))
            .await
            .unwrap();
        persister
            .upsert_node(SOURCE, 8, &fields(100_000_000), at(1_000))
            .await
            .unwrap();

        let row: (f64,) = sqlx::query_as("SELECT latitude FROM nodes WHERE node_num = 8")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert!((row.0 - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_duplicate_packet_inserted_once() {
        let (persister, pool, _dir) = setup().await;
        let packet = text_packet(42, 7, 1_000);

        let first = persister.apply(SOURCE, &packet, Utc::now()).await.unwrap();
        let second = persister.apply(SOURCE, &packet, Utc::now()).await.unwrap();

        assert_eq!(first.messages_inserted, 1);
        assert_eq!(second.messages_inserted, 0);
        assert_eq!(second.messages_duplicate, 1);
        assert_eq!(count(&pool, "messages").await, 1);
        assert_eq!(count(&pool, "nodes").await, 1);
        assert_eq!(count(&pool, "channels").await, 1);
        assert_eq!(persister.counters().messages_total(SOURCE), 1);
    }

    #[tokio::test]
    async fn test_insert_message_direct() {
        let (persister, pool, _dir) = setup().await;
        let message = MessageRecord {
            packet_id: 9,
            from: 3,
            to: None,
            channel: None,
            text: "direct".to_string(),
            reply_id: None,
            emoji: None,
            hop_limit: None,
            hop_start: None,
            rx_snr: None,
            rx_rssi: None,
            received_at: at(50),
        };
        assert!(persister.insert_message(SOURCE, &message).await.unwrap());
        assert!(!persister.insert_message(SOURCE, &message).await.unwrap());
        assert_eq!(count(&pool, "messages").await, 1);
        assert_eq!(count(&pool, "nodes").await, 1);
    }

    #[tokio::test]
    async fn test_message_without_packet_id_rejected() {
        let (persister, pool, _dir) = setup().await;
        let mut packet = text_packet(1, 7, 1_000);
        packet.packet_id = None;

        let err = persister.apply(SOURCE, &packet, Utc::now()).await.unwrap_err();
        assert!(err.is_invalid_data());
        assert_eq!(count(&pool, "nodes").await, 0);
    }

    #[tokio::test]
    async fn test_telemetry_appends_and_updates_battery() {
        let (persister, pool, _dir) = setup().await;
        let telemetry = Telemetry {
            kind: TelemetryKind::Device,
            time: None,
            device: Some(DeviceMetrics {
                battery_level: Some(55),
                voltage: Some(3.75),
                ..Default::default()
            }),
            environment: None,
        };
        persister
            .append_telemetry(SOURCE, 11, &telemetry, at(10))
            .await
            .unwrap();
        persister
            .append_telemetry(SOURCE, 11, &telemetry, at(10))
            .await
            .unwrap();

        let env = Telemetry {
            kind: TelemetryKind::Environment,
            time: None,
            device: None,
            environment: Some(EnvironmentMetrics {
                temperature: Some(21.5),
                ..Default::default()
            }),
        };
        persister.append_telemetry(SOURCE, 11, &env, at(5)).await.unwrap();

        assert_eq!(count(&pool, "telemetry").await, 3);
        let row: (i64,) = sqlx::query_as("SELECT battery_level FROM nodes WHERE node_num = 11")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, 55);
    }

    #[tokio::test]
    async fn test_traceroute_length_mismatch_rejected() {
        let (persister, pool, _dir) = setup().await;
        let bad = Traceroute {
            route: vec![1, 2],
            snr_towards: vec![1.0],
            ..Default::default()
        };
        let err = persister
            .append_traceroute(SOURCE, 1, 2, &bad, at(1))
            .await
            .unwrap_err();
        assert!(err.is_invalid_data());

        let good = Traceroute {
            route: vec![1, 2],
            snr_towards: vec![1.0, 2.0],
            ..Default::default()
        };
        persister
            .append_traceroute(SOURCE, 1, 2, &good, at(1))
            .await
            .unwrap();
        assert_eq!(count(&pool, "traceroutes").await, 1);

        let row: (String,) = sqlx::query_as("SELECT route FROM traceroutes")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, "[1,2]");
    }

    #[tokio::test]
    async fn test_batch_skips_malformed_and_is_idempotent() {
        let (persister, pool, _dir) = setup().await;
        let mut no_id = text_packet(0, 4, 10);
        no_id.packet_id = None;
        let page = vec![text_packet(1, 4, 10), no_id, text_packet(2, 5, 11)];

        let first = persister.apply_batch(SOURCE, &page, Utc::now()).await.unwrap();
        assert_eq!(first.messages_inserted, 2);
        assert_eq!(first.rejected, 1);

        let again = persister.apply_batch(SOURCE, &page, Utc::now()).await.unwrap();
        assert_eq!(again.messages_inserted, 0);
        assert_eq!(count(&pool, "messages").await, 2);
        assert_eq!(count(&pool, "nodes").await, 2);
    }

    #[tokio::test]
    async fn test_channel_latest_name_wins() {
        let (persister, pool, _dir) = setup().await;
        persister.upsert_channel(SOURCE, 1, Some("Old")).await.unwrap();
        persister.upsert_channel(SOURCE, 1, None).await.unwrap();
        persister.upsert_channel(SOURCE, 1, Some("New")).await.unwrap();

        let row: (String,) = sqlx::query_as("SELECT name FROM channels WHERE channel_index = 1")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(row.0, "New");
        assert_eq!(count(&pool, "channels").await, 1);
    }
}
