//! JSON packets and poll-API records.
//!
//! Gateways publish camelCase JSON and the firmware's own JSON uses
//! snake_case inside a `payload` object; both are accepted. Node references
//! may be numbers or `!hex` strings, timestamps unix seconds, unix millis or
//! RFC 3339.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use super::DecodeError;
use super::event::{
    DecodedPacket, DeviceMetrics, EnvironmentMetrics, NodeInfo, NormalizedEvent, Position,
    Telemetry, TelemetryKind, TextMessage, Traceroute, hw_model_name, role_name,
};

/// Timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

type Object = Map<String, Value>;

/// Decode one JSON packet published on a broker topic.
pub fn decode_json(payload: &[u8]) -> Result<Option<DecodedPacket>, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::InvalidField {
            field: "packet",
            reason: "expected a JSON object".to_string(),
        });
    };

    let Some(kind) = packet_kind(&obj) else {
        return Ok(None);
    };
    let from = field(&obj, &["from", "fromId", "fromNodeNum"])
        .and_then(as_node_num)
        .ok_or(DecodeError::MissingField("from"))?;

    // Firmware JSON nests the application body under `payload`.
    let body = match obj.get("payload") {
        Some(Value::Object(inner)) => inner,
        _ => &obj,
    };

    let event = match kind {
        PacketKind::Text => {
            let text = field(&obj, &["text"])
                .or_else(|| field(body, &["text"]))
                .or_else(|| obj.get("payload").filter(|v| v.is_string()))
                .and_then(as_string)
                .ok_or(DecodeError::MissingField("text"))?;
            NormalizedEvent::Text(TextMessage {
                text,
                reply_id: field(&obj, &["replyId", "reply_id"]).and_then(as_u32),
                emoji: field(&obj, &["emoji"]).and_then(as_u32),
            })
        }
        PacketKind::Position => {
            let pos = nested(&obj, "position").unwrap_or(body);
            NormalizedEvent::Position(parse_position(pos))
        }
        PacketKind::Telemetry => {
            let telem = nested(&obj, "telemetry").unwrap_or(body);
            match parse_telemetry(telem, None) {
                Some(t) => NormalizedEvent::Telemetry(t),
                None => return Ok(None),
            }
        }
        PacketKind::NodeInfo => {
            let info = nested(&obj, "nodeinfo").unwrap_or(body);
            let user = nested(info, "user").unwrap_or(info);
            NormalizedEvent::NodeInfo(parse_user(user))
        }
        PacketKind::Traceroute => {
            let route = nested(&obj, "traceroute").unwrap_or(body);
            NormalizedEvent::Traceroute(parse_route(route)?)
        }
    };

    Ok(Some(DecodedPacket {
        packet_id: field(&obj, &["id", "packetId"]).and_then(as_u32),
        from,
        to: field(&obj, &["to", "toId", "toNodeNum"]).and_then(as_node_num),
        channel: field(&obj, &["channel"]).and_then(as_u32),
        channel_name: field(&obj, &["channelName", "channel_name", "channelId"])
            .and_then(as_string),
        rx_time: field(&obj, &["rxTime", "rx_time", "timestamp"]).and_then(as_time),
        rx_snr: field(&obj, &["rxSnr", "rx_snr", "snr"]).and_then(as_f32),
        rx_rssi: field(&obj, &["rxRssi", "rx_rssi", "rssi"]).and_then(as_i32),
        hop_limit: field(&obj, &["hopLimit", "hop_limit"]).and_then(as_u32),
        hop_start: field(&obj, &["hopStart", "hop_start"]).and_then(as_u32),
        event,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Text,
    Position,
    Telemetry,
    NodeInfo,
    Traceroute,
}

fn packet_kind(obj: &Object) -> Option<PacketKind> {
    if let Some(t) = obj.get("type").and_then(Value::as_str) {
        return match t.to_ascii_lowercase().as_str() {
            "text" | "text_message" | "text_message_app" => Some(PacketKind::Text),
            "position" | "position_app" => Some(PacketKind::Position),
            "telemetry" | "telemetry_app" => Some(PacketKind::Telemetry),
            "nodeinfo" | "nodeinfo_app" => Some(PacketKind::NodeInfo),
            "traceroute" | "traceroute_app" => Some(PacketKind::Traceroute),
            _ => None,
        };
    }
    if obj.contains_key("text") {
        Some(PacketKind::Text)
    } else if obj.contains_key("position") {
        Some(PacketKind::Position)
    } else if obj.contains_key("telemetry") {
        Some(PacketKind::Telemetry)
    } else if obj.contains_key("nodeinfo") || obj.contains_key("user") {
        Some(PacketKind::NodeInfo)
    } else if obj.contains_key("traceroute") || obj.contains_key("route") {
        Some(PacketKind::Traceroute)
    } else {
        None
    }
}

// =============================================================================
// Poll API records
// =============================================================================

/// Parse one entry of the node listing.
pub fn parse_node_record(record: &Value) -> Result<DecodedPacket, DecodeError> {
    let obj = object(record)?;
    let node_num = field(obj, &["nodeNum", "num", "node_num"])
        .and_then(as_node_num)
        .ok_or(DecodeError::MissingField("nodeNum"))?;

    let mut info = parse_user(nested(obj, "user").unwrap_or(obj));
    if info.node_id.is_none() {
        info.node_id = field(obj, &["nodeId", "node_id"]).and_then(as_string);
    }
    let position = nested(obj, "position")
        .map(parse_position)
        .filter(Position::has_fix);

    let mut packet = DecodedPacket::new(node_num, NormalizedEvent::NodeSnapshot { info, position });
    packet.rx_time = field(obj, &["lastHeard", "last_heard"]).and_then(as_time);
    packet.rx_snr = field(obj, &["snr"]).and_then(as_f32);
    Ok(packet)
}

/// Parse one entry of the message listing. Messages without a packet id
/// cannot be deduplicated and are rejected.
pub fn parse_message_record(record: &Value) -> Result<DecodedPacket, DecodeError> {
    let obj = object(record)?;
    let packet_id = field(obj, &["packetId", "id"])
        .and_then(as_u32)
        .ok_or(DecodeError::MissingField("packetId"))?;
    let from = field(obj, &["fromNodeNum", "from"])
        .and_then(as_node_num)
        .ok_or(DecodeError::MissingField("fromNodeNum"))?;
    let text = field(obj, &["text"]).and_then(as_string).unwrap_or_default();

    Ok(DecodedPacket {
        packet_id: Some(packet_id),
        from,
        to: field(obj, &["toNodeNum", "to"]).and_then(as_node_num),
        channel: field(obj, &["channel"]).and_then(as_u32),
        channel_name: None,
        rx_time: field(obj, &["rxTime", "timestamp"]).and_then(as_time),
        rx_snr: field(obj, &["rxSnr"]).and_then(as_f32),
        rx_rssi: field(obj, &["rxRssi"]).and_then(as_i32),
        hop_limit: field(obj, &["hopLimit"]).and_then(as_u32),
        hop_start: field(obj, &["hopStart"]).and_then(as_u32),
        event: NormalizedEvent::Text(TextMessage {
            text,
            reply_id: field(obj, &["replyId"]).and_then(as_u32),
            emoji: field(obj, &["emoji"]).and_then(as_u32),
        }),
    })
}

/// Parse one entry of the telemetry listing. Returns `Ok(None)` for
/// telemetry variants that are not collected.
pub fn parse_telemetry_record(record: &Value) -> Result<Option<DecodedPacket>, DecodeError> {
    let obj = object(record)?;
    let node_num = field(obj, &["nodeNum", "from", "node_num"])
        .and_then(as_node_num)
        .ok_or(DecodeError::MissingField("nodeNum"))?;
    let declared = field(obj, &["type", "telemetryType"])
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<TelemetryKind>().ok());

    let Some(telemetry) = parse_telemetry(obj, declared) else {
        return Ok(None);
    };
    let mut packet = DecodedPacket::new(node_num, NormalizedEvent::Telemetry(telemetry));
    packet.rx_time = field(obj, &["timestamp", "rxTime", "time"]).and_then(as_time);
    Ok(Some(packet))
}

/// Parse one entry of the traceroute listing.
pub fn parse_traceroute_record(record: &Value) -> Result<DecodedPacket, DecodeError> {
    let obj = object(record)?;
    let from = field(obj, &["fromNodeNum", "from"])
        .and_then(as_node_num)
        .ok_or(DecodeError::MissingField("fromNodeNum"))?;
    let to = field(obj, &["toNodeNum", "to"])
        .and_then(as_node_num)
        .ok_or(DecodeError::MissingField("toNodeNum"))?;

    let route = parse_route(obj)?;
    let mut packet = DecodedPacket::new(from, NormalizedEvent::Traceroute(route));
    packet.to = Some(to);
    packet.rx_time = field(obj, &["timestamp", "rxTime", "time"]).and_then(as_time);
    Ok(packet)
}

// =============================================================================
// Payload bodies
// =============================================================================

fn parse_position(obj: &Object) -> Position {
    let coord = |int_keys: &[&str], deg_keys: &[&str]| {
        field(obj, int_keys)
            .and_then(as_i32)
            .or_else(|| field(obj, deg_keys).and_then(as_f64).and_then(Position::degrees_to_i))
            .filter(|v| *v != 0)
    };
    Position {
        latitude_i: coord(&["latitude_i", "latitudeI"], &["latitude", "lat"]),
        longitude_i: coord(&["longitude_i", "longitudeI"], &["longitude", "lon"]),
        altitude: field(obj, &["altitude", "alt"]).and_then(as_i32),
        time: field(obj, &["time"]).and_then(as_time),
        precision_bits: field(obj, &["precisionBits", "precision_bits"])
            .and_then(as_u32)
            .filter(|v| *v != 0),
    }
}

fn parse_telemetry(obj: &Object, declared: Option<TelemetryKind>) -> Option<Telemetry> {
    let time = field(obj, &["time"]).and_then(as_time);
    let device = nested(obj, "deviceMetrics").or_else(|| nested(obj, "device_metrics"));
    let environment =
        nested(obj, "environmentMetrics").or_else(|| nested(obj, "environment_metrics"));

    // Firmware JSON flattens metrics into the payload body.
    let flat_device = obj.contains_key("battery_level") || obj.contains_key("voltage");
    let flat_env = obj.contains_key("temperature") || obj.contains_key("relative_humidity");

    let kind = match declared {
        Some(kind) => kind,
        None if device.is_some() || flat_device => TelemetryKind::Device,
        None if environment.is_some() || flat_env => TelemetryKind::Environment,
        None => return None,
    };

    match kind {
        TelemetryKind::Device => {
            let d = device.unwrap_or(obj);
            Some(Telemetry {
                kind,
                time,
                device: Some(DeviceMetrics {
                    battery_level: field(d, &["batteryLevel", "battery_level"]).and_then(as_u32),
                    voltage: field(d, &["voltage"]).and_then(as_f32),
                    channel_utilization: field(d, &["channelUtilization", "channel_utilization"])
                        .and_then(as_f32),
                    air_util_tx: field(d, &["airUtilTx", "air_util_tx"]).and_then(as_f32),
                    uptime_seconds: field(d, &["uptimeSeconds", "uptime_seconds"])
                        .and_then(as_u32),
                }),
                environment: None,
            })
        }
        TelemetryKind::Environment => {
            let e = environment.unwrap_or(obj);
            Some(Telemetry {
                kind,
                time,
                device: None,
                environment: Some(EnvironmentMetrics {
                    temperature: field(e, &["temperature"]).and_then(as_f32),
                    relative_humidity: field(e, &["relativeHumidity", "relative_humidity"])
                        .and_then(as_f32),
                    barometric_pressure: field(e, &["barometricPressure", "barometric_pressure"])
                        .and_then(as_f32),
                }),
            })
        }
        TelemetryKind::Position => None,
    }
}

fn parse_user(obj: &Object) -> NodeInfo {
    NodeInfo {
        node_id: field(obj, &["id", "nodeId"]).and_then(as_string),
        long_name: field(obj, &["longName", "longname", "long_name"]).and_then(as_string),
        short_name: field(obj, &["shortName", "shortname", "short_name"]).and_then(as_string),
        hw_model: field(obj, &["hwModel", "hw_model", "hardware"]).and_then(|v| {
            v.as_i64()
                .map(|n| hw_model_name(n as i32))
                .or_else(|| as_string(v))
        }),
        role: field(obj, &["role"]).and_then(|v| {
            v.as_i64()
                .map(|n| role_name(n as i32))
                .or_else(|| as_string(v))
        }),
        is_licensed: field(obj, &["isLicensed", "is_licensed"]).and_then(Value::as_bool),
    }
}

/// Hop lists. A hop that is not a node number (or SNR value) rejects the
/// whole route rather than shortening it.
fn parse_route(obj: &Object) -> Result<Traceroute, DecodeError> {
    fn list<T>(
        obj: &Object,
        name: &'static str,
        keys: &[&str],
        item: fn(&Value) -> Option<T>,
    ) -> Result<Vec<T>, DecodeError> {
        let Some(value) = field(obj, keys) else {
            return Ok(Vec::new());
        };
        // Poll APIs may ship the list as JSON text.
        let embedded;
        let value = match value {
            Value::String(text) if text.trim().is_empty() => return Ok(Vec::new()),
            Value::String(text) => {
                embedded = serde_json::from_str::<Value>(text).map_err(|e| {
                    DecodeError::InvalidField {
                        field: name,
                        reason: format!("not a JSON list: {e}"),
                    }
                })?;
                &embedded
            }
            other => other,
        };
        let array = value.as_array().ok_or_else(|| DecodeError::InvalidField {
            field: name,
            reason: "expected an array".to_string(),
        })?;
        array
            .iter()
            .enumerate()
            .map(|(i, v)| {
                item(v).ok_or_else(|| DecodeError::InvalidField {
                    field: name,
                    reason: format!("entry {i} is unusable: {v}"),
                })
            })
            .collect()
    }

    Ok(Traceroute {
        route: list(obj, "route", &["route"], as_node_num)?,
        route_back: list(obj, "routeBack", &["routeBack", "route_back"], as_node_num)?,
        snr_towards: list(obj, "snrTowards", &["snrTowards", "snr_towards"], as_f32)?,
        snr_back: list(obj, "snrBack", &["snrBack", "snr_back"], as_f32)?,
    })
}

// =============================================================================
// Value helpers
// =============================================================================

fn object(value: &Value) -> Result<&Object, DecodeError> {
    value.as_object().ok_or(DecodeError::InvalidField {
        field: "record",
        reason: "expected a JSON object".to_string(),
    })
}

/// First present, non-null value among `keys`.
fn field<'a>(obj: &'a Object, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn nested<'a>(obj: &'a Object, key: &str) -> Option<&'a Object> {
    obj.get(key).and_then(Value::as_object)
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u32(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_i32(v: &Value) -> Option<i32> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f32(v: &Value) -> Option<f32> {
    as_f64(v).map(|f| f as f32)
}

/// Node number from a number or a `!xxxxxxxx` id.
fn as_node_num(v: &Value) -> Option<u32> {
    match v {
        Value::String(s) if s.starts_with('!') => u32::from_str_radix(&s[1..], 16).ok(),
        other => as_u32(other),
    }
}

fn as_time(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => n.as_f64().and_then(epoch_to_time),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return epoch_to_time(n);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        }
        _ => None,
    }
}

fn epoch_to_time(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() || ts <= 0.0 {
        return None;
    }
    let millis = if ts > MILLIS_THRESHOLD {
        ts
    } else {
        ts * 1000.0
    };
    DateTime::from_timestamp_millis(millis as i64)
}
