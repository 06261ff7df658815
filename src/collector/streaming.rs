//! Broker subscription collector (Meshtastic MQTT).
//!
//! The broker event loop and packet processing run as two tasks joined by a
//! bounded channel: the pump only moves `(topic, payload)` pairs, the
//! processor decodes and persists them. A full channel slows the pump and,
//! through it, the broker connection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubAck, SubscribeReasonCode, Transport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collector::{
    Collector, CollectorContext, CollectorError, CollectorOptions, ConnectionCheck, CycleOutcome,
    Schedule,
};
use crate::decoder::{FormatHint, decode};
use crate::storage::{Persister, SourceRecord, SourceType, StorageError};

/// Largest accepted publish payload.
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Requests buffered between the client handle and the event loop.
const CLIENT_CAPACITY: usize = 64;

/// Pick the decode order for one message from its topic.
///
/// Meshtastic publishes JSON under `/json/` and protobuf envelopes under
/// `/e/` (encrypted channel) or `/c/` (legacy). Anything else uses the
/// source's configured hint.
pub fn hint_for_topic(topic: &str, default: FormatHint) -> FormatHint {
    if topic.contains("/json/") {
        FormatHint::Json
    } else if topic.contains("/e/") || topic.contains("/c/") {
        FormatHint::Protobuf
    } else {
        default
    }
}

/// Raw message handed from the pump to the processor.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Counts from one processing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub persisted: u64,
    /// Well-formed packets of an uncollected type.
    pub ignored: u64,
    /// Undecodable or invalid packets.
    pub dropped: u64,
}

/// Resolved settings for one broker source.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub source_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub use_tls: bool,
    pub format: FormatHint,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
}

impl StreamingConfig {
    /// Build from a source record.
    ///
    /// # Errors
    /// Returns `CollectorError::Config` when host or topic is missing.
    pub fn from_source(
        source: &SourceRecord,
        options: &CollectorOptions,
    ) -> Result<Self, CollectorError> {
        if source.source_type != SourceType::Mqtt {
            return Err(CollectorError::Config(format!(
                "source '{}' is not a broker source",
                source.name
            )));
        }
        let host = non_empty(&source.mqtt_host)
            .ok_or_else(|| CollectorError::Config("missing mqtt host".to_string()))?;
        let topic = non_empty(&source.mqtt_topic_pattern)
            .ok_or_else(|| CollectorError::Config("missing mqtt topic pattern".to_string()))?;
        if source.mqtt_port == 0 {
            return Err(CollectorError::Config("mqtt port must be non-zero".to_string()));
        }

        Ok(Self {
            source_id: source.id.clone(),
            host,
            port: source.mqtt_port,
            username: non_empty(&source.mqtt_username),
            password: source.mqtt_password.clone(),
            topic,
            use_tls: source.mqtt_use_tls,
            format: source.payload_format,
            keep_alive: options.mqtt_keep_alive.max(Duration::from_secs(1)),
            connect_timeout: options.mqtt_connect_timeout,
            channel_capacity: options.channel_capacity.max(1),
        })
    }

    /// Client id derived from the source id.
    pub fn client_id(&self) -> String {
        let prefix: String = self.source_id.chars().take(8).collect();
        format!("meshmanager-{prefix}")
    }

    /// Read timeout once connected; keep-alive pings arrive well within it.
    pub fn read_timeout(&self) -> Duration {
        self.keep_alive * 2
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id(), &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        if self.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn connection_error(e: ConnectionError) -> CollectorError {
    match e {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => CollectorError::Authentication(format!("broker refused connection: {code:?}")),
        ConnectionError::ConnectionRefused(code) => {
            CollectorError::Network(format!("broker refused connection: {code:?}"))
        }
        other => CollectorError::Network(other.to_string()),
    }
}

fn check_suback(ack: &SubAck, topic: &str) -> Result<(), CollectorError> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(CollectorError::Authentication(format!(
            "broker rejected subscription to '{topic}'"
        )));
    }
    Ok(())
}

/// Hand one message to the processor, giving up when `cancel` fires first.
///
/// Returns `Ok(false)` when cancelled.
async fn forward(
    tx: &mpsc::Sender<RawMessage>,
    message: RawMessage,
    cancel: &CancellationToken,
) -> Result<bool, CollectorError> {
    let sent = tokio::select! {
        _ = cancel.cancelled() => return Ok(false),
        sent = tx.send(message) => sent,
    };
    sent.map(|()| true).map_err(|_| {
        CollectorError::Storage(StorageError::Internal("packet processor stopped".to_string()))
    })
}

/// Queue a disconnect on `client`. Returns whether the request was queued.
fn request_disconnect(client: &AsyncClient, source_id: &str) -> bool {
    match client.try_disconnect() {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(source_id = %source_id, error = %e, "Broker disconnect not queued");
            false
        }
    }
}

/// Decode and persist messages until the channel closes.
///
/// Malformed packets are counted and skipped. A storage failure ends
/// processing so the session restarts through backoff.
pub async fn process_messages(
    source_id: &str,
    default_hint: FormatHint,
    persister: &Persister,
    mut rx: mpsc::Receiver<RawMessage>,
) -> Result<ProcessStats, CollectorError> {
    let mut stats = ProcessStats::default();

    while let Some(message) = rx.recv().await {
        let hint = hint_for_topic(&message.topic, default_hint);
        let packet = match decode(&message.payload, hint) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                stats.ignored += 1;
                continue;
            }
            Err(e) => {
                tracing::debug!(source_id = %source_id, topic = %message.topic, error = %e, "Dropping undecodable packet");
                persister.counters().decode_error(source_id);
                stats.dropped += 1;
                continue;
            }
        };

        match persister.apply(source_id, &packet, message.received_at).await {
            Ok(_) => stats.persisted += 1,
            Err(e) if e.is_invalid_data() => {
                tracing::debug!(source_id = %source_id, kind = packet.event.label(), error = %e, "Dropping invalid packet");
                stats.dropped += 1;
            }
            Err(e) => return Err(CollectorError::Storage(e)),
        }
    }

    Ok(stats)
}

/// MQTT subscription collector.
pub struct StreamingCollector {
    config: StreamingConfig,
    persister: Persister,
}

impl std::fmt::Debug for StreamingCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCollector")
            .field("source_id", &self.config.source_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("topic", &self.config.topic)
            .finish_non_exhaustive()
    }
}

impl StreamingCollector {
    pub fn new(config: StreamingConfig, persister: Persister) -> Self {
        Self { config, persister }
    }

    /// Drive the broker event loop, forwarding publishes to `tx`.
    ///
    /// Returns `Ok(())` only when cancelled.
    async fn pump(
        &self,
        client: &AsyncClient,
        eventloop: &mut EventLoop,
        tx: mpsc::Sender<RawMessage>,
        ctx: &CollectorContext,
    ) -> Result<(), CollectorError> {
        let source_id = self.config.source_id.as_str();
        let mut connected = false;

        loop {
            let wait = if connected {
                self.config.read_timeout()
            } else {
                self.config.connect_timeout
            };
            let polled = tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                polled = tokio::time::timeout(wait, eventloop.poll()) => polled,
            };

            let event = match polled {
                Err(_) => return Err(CollectorError::Timeout),
                Ok(Err(e)) => return Err(connection_error(e)),
                Ok(Ok(event)) => event,
            };

            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    connected = true;
                    // Clean sessions drop subscriptions; re-issue on every connect.
                    client
                        .subscribe(self.config.topic.as_str(), QoS::AtMostOnce)
                        .await
                        .map_err(|e| CollectorError::Network(e.to_string()))?;
                    tracing::info!(source_id = %source_id, host = %self.config.host, topic = %self.config.topic, "Broker connected");
                    ctx.health.success().await;
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    check_suback(&ack, &self.config.topic)?;
                    tracing::debug!(source_id = %source_id, pkid = ack.pkid, "Subscription acknowledged");
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    let message = RawMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    };
                    if !forward(&tx, message, &ctx.cancel).await? {
                        return Ok(());
                    }
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(CollectorError::Network("broker sent disconnect".to_string()));
                }
                _ => {}
            }
        }
    }

    /// Connect, subscribe, and wait for the subscription to be acknowledged.
    async fn handshake(
        &self,
        client: &AsyncClient,
        eventloop: &mut EventLoop,
    ) -> Result<(), CollectorError> {
        loop {
            match eventloop.poll().await.map_err(connection_error)? {
                Event::Incoming(Packet::ConnAck(_)) => {
                    client
                        .subscribe(self.config.topic.as_str(), QoS::AtMostOnce)
                        .await
                        .map_err(|e| CollectorError::Network(e.to_string()))?;
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    return check_suback(&ack, &self.config.topic);
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(CollectorError::Network("broker sent disconnect".to_string()));
                }
                _ => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl Collector for StreamingCollector {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Mqtt
    }

    fn schedule(&self) -> Schedule {
        Schedule::Continuous
    }

    /// One broker session: connect, subscribe, and process until the
    /// connection fails or the collector is cancelled.
    async fn run_cycle(&self, ctx: &CollectorContext) -> Result<CycleOutcome, CollectorError> {
        let (client, mut eventloop) = AsyncClient::new(self.config.mqtt_options(), CLIENT_CAPACITY);
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);

        let processor = {
            let source_id = self.config.source_id.clone();
            let hint = self.config.format;
            let persister = self.persister.clone();
            tokio::spawn(async move { process_messages(&source_id, hint, &persister, rx).await })
        };

        let pumped = self.pump(&client, &mut eventloop, tx, ctx).await;
        request_disconnect(&client, &self.config.source_id);
        drop(eventloop);

        let processed = match processor.await {
            Ok(result) => result,
            Err(e) => Err(CollectorError::Storage(StorageError::Internal(format!(
                "packet processor panicked: {e}"
            )))),
        };

        match (pumped, processed) {
            (_, Err(e)) => Err(e),
            (Err(e), Ok(stats)) => {
                tracing::debug!(source_id = %self.config.source_id, ?stats, "Broker session ended");
                Err(e)
            }
            (Ok(()), Ok(stats)) => {
                tracing::debug!(source_id = %self.config.source_id, ?stats, "Broker session closed");
                Ok(CycleOutcome::complete())
            }
        }
    }

    /// ConnAck then SubAck within the connect timeout.
    async fn test_connection(&self) -> Result<ConnectionCheck, CollectorError> {
        let (client, mut eventloop) = AsyncClient::new(self.config.mqtt_options(), CLIENT_CAPACITY);
        let result = tokio::time::timeout(
            self.config.connect_timeout,
            self.handshake(&client, &mut eventloop),
        )
        .await;
        request_disconnect(&client, &self.config.source_id);

        result.map_err(|_| CollectorError::Timeout)??;
        tracing::debug!(source_id = %self.config.source_id, host = %self.config.host, "Connection test passed");
        Ok(ConnectionCheck::default())
    }
}
