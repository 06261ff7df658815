//! Binary (protobuf) framing as published by mesh gateways.
//!
//! Only the fields the collector consumes are declared; prost skips the rest.

use chrono::{DateTime, Utc};
use prost::Message;

use super::DecodeError;
use super::event::{
    DecodedPacket, DeviceMetrics, EnvironmentMetrics, NodeInfo, NormalizedEvent, Position,
    Telemetry as TelemetryEvent, TelemetryKind, TextMessage, Traceroute, hw_model_name, role_name,
};

/// Application port numbers the decoder dispatches on.
pub mod port {
    pub const TEXT_MESSAGE_APP: i32 = 1;
    pub const POSITION_APP: i32 = 3;
    pub const NODEINFO_APP: i32 = 4;
    pub const TELEMETRY_APP: i32 = 67;
    pub const TRACEROUTE_APP: i32 = 70;
}

#[derive(Clone, PartialEq, Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(string, tag = "2")]
    pub channel_id: String,
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(message, optional, tag = "4")]
    pub decoded: Option<Data>,
    #[prost(bytes = "vec", tag = "5")]
    pub encrypted: Vec<u8>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Data {
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PositionProto {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(uint32, tag = "23")]
    pub precision_bits: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct TelemetryProto {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(message, optional, tag = "2")]
    pub device_metrics: Option<DeviceMetricsProto>,
    #[prost(message, optional, tag = "3")]
    pub environment_metrics: Option<EnvironmentMetricsProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetricsProto {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EnvironmentMetricsProto {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
}

/// SNR values are carried as dB * 4.
#[derive(Clone, PartialEq, Message)]
pub struct RouteDiscovery {
    #[prost(fixed32, repeated, tag = "1")]
    pub route: Vec<u32>,
    #[prost(int32, repeated, tag = "2")]
    pub snr_towards: Vec<i32>,
    #[prost(fixed32, repeated, tag = "3")]
    pub route_back: Vec<u32>,
    #[prost(int32, repeated, tag = "4")]
    pub snr_back: Vec<i32>,
}

/// Decode a binary frame.
///
/// Accepts a gateway `ServiceEnvelope` or a bare `MeshPacket`. Frames that
/// do not parse as either return a structural error so the caller can try
/// another format.
pub fn decode_binary(payload: &[u8]) -> Result<Option<DecodedPacket>, DecodeError> {
    let (packet, channel_name) = match ServiceEnvelope::decode(payload) {
        Ok(ServiceEnvelope {
            packet: Some(packet),
            channel_id,
            ..
        }) => (packet, non_empty(channel_id)),
        Ok(_) | Err(_) => {
            let packet = MeshPacket::decode(payload)?;
            if packet.from == 0 {
                return Err(DecodeError::EmptyEnvelope);
            }
            (packet, None)
        }
    };

    let Some(data) = packet.decoded.as_ref() else {
        // Encrypted traffic without a key is not ours to read.
        tracing::trace!(from = packet.from, "Skipping encrypted packet");
        return Ok(None);
    };

    let Some(event) = decode_port(data)? else {
        return Ok(None);
    };

    Ok(Some(DecodedPacket {
        packet_id: non_zero(packet.id),
        from: packet.from,
        to: non_zero(packet.to),
        channel: Some(packet.channel),
        channel_name,
        rx_time: unix_seconds(packet.rx_time),
        rx_snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr),
        rx_rssi: (packet.rx_rssi != 0).then_some(packet.rx_rssi),
        hop_limit: Some(packet.hop_limit),
        hop_start: non_zero(packet.hop_start),
        event,
    }))
}

fn decode_port(data: &Data) -> Result<Option<NormalizedEvent>, DecodeError> {
    let event = match data.portnum {
        port::TEXT_MESSAGE_APP => {
            let text = String::from_utf8(data.payload.clone()).map_err(|e| {
                DecodeError::InvalidField {
                    field: "text",
                    reason: e.to_string(),
                }
            })?;
            NormalizedEvent::Text(TextMessage {
                text,
                reply_id: non_zero(data.reply_id),
                emoji: non_zero(data.emoji),
            })
        }
        port::POSITION_APP => {
            let p = PositionProto::decode(data.payload.as_slice())
                .map_err(|source| DecodeError::Payload { port: "position", source })?;
            NormalizedEvent::Position(Position {
                latitude_i: p.latitude_i.filter(|v| *v != 0),
                longitude_i: p.longitude_i.filter(|v| *v != 0),
                altitude: p.altitude,
                time: unix_seconds(p.time),
                precision_bits: non_zero(p.precision_bits),
            })
        }
        port::NODEINFO_APP => {
            let u = User::decode(data.payload.as_slice())
                .map_err(|source| DecodeError::Payload { port: "nodeinfo", source })?;
            NormalizedEvent::NodeInfo(NodeInfo {
                node_id: non_empty(u.id),
                long_name: non_empty(u.long_name),
                short_name: non_empty(u.short_name),
                hw_model: Some(hw_model_name(u.hw_model)),
                role: Some(role_name(u.role)),
                is_licensed: Some(u.is_licensed),
            })
        }
        port::TELEMETRY_APP => {
            let t = TelemetryProto::decode(data.payload.as_slice())
                .map_err(|source| DecodeError::Payload { port: "telemetry", source })?;
            let time = unix_seconds(t.time);
            if let Some(d) = t.device_metrics {
                NormalizedEvent::Telemetry(TelemetryEvent {
                    kind: TelemetryKind::Device,
                    time,
                    device: Some(DeviceMetrics {
                        battery_level: d.battery_level,
                        voltage: d.voltage,
                        channel_utilization: d.channel_utilization,
                        air_util_tx: d.air_util_tx,
                        uptime_seconds: d.uptime_seconds,
                    }),
                    environment: None,
                })
            } else if let Some(e) = t.environment_metrics {
                NormalizedEvent::Telemetry(TelemetryEvent {
                    kind: TelemetryKind::Environment,
                    time,
                    device: None,
                    environment: Some(EnvironmentMetrics {
                        temperature: e.temperature,
                        relative_humidity: e.relative_humidity,
                        barometric_pressure: e.barometric_pressure,
                    }),
                })
            } else {
                // Power, air quality and other variants are not collected.
                return Ok(None);
            }
        }
        port::TRACEROUTE_APP => {
            let r = RouteDiscovery::decode(data.payload.as_slice())
                .map_err(|source| DecodeError::Payload { port: "traceroute", source })?;
            NormalizedEvent::Traceroute(Traceroute {
                route: r.route,
                route_back: r.route_back,
                snr_towards: r.snr_towards.into_iter().map(quarter_db).collect(),
                snr_back: r.snr_back.into_iter().map(quarter_db).collect(),
            })
        }
        other => {
            tracing::trace!(portnum = other, "Ignoring unsupported port");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn quarter_db(v: i32) -> f32 {
    v as f32 / 4.0
}

fn non_zero(v: u32) -> Option<u32> {
    (v != 0).then_some(v)
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn unix_seconds(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(i64::from(secs), 0)
}
