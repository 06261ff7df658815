//! Protocol decoder.
//!
//! Pure functions turning one raw payload into zero or one
//! [`DecodedPacket`]. No I/O and no state: the caller decides what to do
//! with failures (log, count, drop).
//!
//! # Strategy
//!
//! - Binary protobuf framing is attempted first, JSON second. A
//!   [`FormatHint::Json`] hint swaps the order.
//! - Only *structural* failures (the bytes are not that format at all) fall
//!   through to the other format. A frame that parses but carries a corrupt
//!   application payload is reported as is.
//! - Unknown application types and encrypted packets yield `Ok(None)`.

mod event;
mod json;
pub mod protobuf;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub use event::{
    BROADCAST_NODE, DecodedPacket, DeviceMetrics, EnvironmentMetrics, NodeInfo, NormalizedEvent,
    Position, Telemetry, TelemetryKind, TextMessage, Traceroute, hw_model_name, node_id_for,
    role_name,
};
pub use json::{
    decode_json, parse_message_record, parse_node_record, parse_telemetry_record,
    parse_traceroute_record,
};
pub use protobuf::decode_binary;

/// Payload format hint supplied by the collector.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FormatHint {
    /// Try binary, then JSON.
    #[default]
    Auto,
    /// Payload is expected to be protobuf.
    #[strum(to_string = "protobuf", serialize = "binary")]
    #[serde(alias = "binary")]
    Protobuf,
    /// Payload is expected to be JSON.
    Json,
}

/// Errors produced while decoding a payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Bytes are not a protobuf frame.
    #[error("invalid protobuf frame: {0}")]
    Frame(#[from] prost::DecodeError),

    /// Frame parsed but carried no packet.
    #[error("frame carries no mesh packet")]
    EmptyEnvelope,

    /// Bytes are not JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Required field absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Field present but unusable.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Application payload inside a valid frame is corrupt.
    #[error("malformed {port} payload: {source}")]
    Payload {
        port: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    /// Neither format matched.
    #[error("undecodable payload (binary: {binary}; json: {json})")]
    Undecodable {
        binary: Box<DecodeError>,
        json: Box<DecodeError>,
    },
}

impl DecodeError {
    /// Whether the failure means "not this format" rather than "bad packet".
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Frame(_) | Self::EmptyEnvelope | Self::Json(_))
    }
}

/// Decode one payload.
///
/// # Returns
///
/// - `Ok(Some(packet))`: a supported application packet
/// - `Ok(None)`: a well-formed packet of a type that is not collected
/// - `Err(_)`: the payload is malformed; drop it and move on
pub fn decode(payload: &[u8], hint: FormatHint) -> Result<Option<DecodedPacket>, DecodeError> {
    let json_first = hint == FormatHint::Json;
    let (first, second): (Decoder, Decoder) = if json_first {
        (decode_json, decode_binary)
    } else {
        (decode_binary, decode_json)
    };

    match first(payload) {
        Err(first_err) if first_err.is_structural() => match second(payload) {
            Err(second_err) if second_err.is_structural() => {
                let (binary, json) = if json_first {
                    (second_err, first_err)
                } else {
                    (first_err, second_err)
                };
                Err(DecodeError::Undecodable {
                    binary: Box::new(binary),
                    json: Box::new(json),
                })
            }
            other => other,
        },
        other => other,
    }
}

type Decoder = fn(&[u8]) -> Result<Option<DecodedPacket>, DecodeError>;

#[cfg(test)]
mod tests {
    use super::protobuf::{Data, MeshPacket, PositionProto, ServiceEnvelope, TelemetryProto, port};
    use super::protobuf::DeviceMetricsProto;
    use super::*;
    use prost::Message;
    use serde_json::json;

    fn envelope(id: u32, portnum: i32, payload: Vec<u8>) -> Vec<u8> {
        ServiceEnvelope {
            packet: Some(MeshPacket {
                from: 0x0a0b_0c0d,
                to: BROADCAST_NODE,
                channel: 0,
                decoded: Some(Data {
                    portnum,
                    payload,
                    reply_id: 0,
                    emoji: 0,
                }),
                encrypted: Vec::new(),
                id,
                rx_time: 1_700_000_000,
                rx_snr: 7.5,
                hop_limit: 2,
                rx_rssi: -101,
                hop_start: 3,
            }),
            channel_id: "LongFast".to_string(),
            gateway_id: "!00000001".to_string(),
        }
        .encode_to_vec()
    }

    #[test]
    fn test_text_binary_and_json_are_equivalent() {
        let binary = envelope(42, port::TEXT_MESSAGE_APP, b"good morning".to_vec());
        let json = json!({
            "type": "text",
            "id": 42,
            "from": "!0a0b0c0d",
            "to": BROADCAST_NODE,
            "channel": 0,
            "channelName": "LongFast",
            "text": "good morning",
            "rxTime": 1_700_000_000,
            "rxSnr": 7.5,
            "rxRssi": -101,
            "hopLimit": 2,
            "hopStart": 3
        })
        .to_string();

        let from_binary = decode(&binary, FormatHint::Protobuf).unwrap().unwrap();
        let from_json = decode(json.as_bytes(), FormatHint::Json).unwrap().unwrap();
        assert_eq!(from_binary, from_json);
    }

    #[test]
    fn test_position_binary_and_json_are_equivalent() {
        let pos = PositionProto {
            latitude_i: Some(377_749_000),
            longitude_i: Some(-1_224_194_000),
            altitude: Some(15),
            time: 1_699_999_990,
            precision_bits: 32,
        };
        let binary = envelope(7, port::POSITION_APP, pos.encode_to_vec());
        let json = json!({
            "type": "position",
            "id": 7,
            "from": 0x0a0b_0c0d,
            "to": BROADCAST_NODE,
            "channel": 0,
            "channelName": "LongFast",
            "rxTime": 1_700_000_000,
            "rxSnr": 7.5,
            "rxRssi": -101,
            "hopLimit": 2,
            "hopStart": 3,
            "position": {
                "latitude": 37.7749,
                "longitude": -122.4194,
                "altitude": 15,
                "time": 1_699_999_990,
                "precisionBits": 32
            }
        })
        .to_string();

        let from_binary = decode(&binary, FormatHint::Auto).unwrap().unwrap();
        let from_json = decode(json.as_bytes(), FormatHint::Auto).unwrap().unwrap();
        assert_eq!(from_binary, from_json);
    }

    #[test]
    fn test_telemetry_binary_and_json_are_equivalent() {
        let telem = TelemetryProto {
            time: 0,
            device_metrics: Some(DeviceMetricsProto {
                battery_level: Some(91),
                voltage: Some(4.125),
                channel_utilization: Some(12.5),
                air_util_tx: Some(1.5),
                uptime_seconds: Some(3600),
            }),
            environment_metrics: None,
        };
        let binary = envelope(9, port::TELEMETRY_APP, telem.encode_to_vec());
        let json = json!({
            "type": "telemetry",
            "id": 9,
            "from": 0x0a0b_0c0d,
            "to": BROADCAST_NODE,
            "channel": 0,
            "channelName": "LongFast",
            "rxTime": 1_700_000_000,
            "rxSnr": 7.5,
            "rxRssi": -101,
            "hopLimit": 2,
            "hopStart": 3,
            "telemetry": {
                "deviceMetrics": {
                    "batteryLevel": 91,
                    "voltage": 4.125,
                    "channelUtilization": 12.5,
                    "airUtilTx": 1.5,
                    "uptimeSeconds": 3600
                }
            }
        })
        .to_string();

        let from_binary = decode(&binary, FormatHint::Auto).unwrap().unwrap();
        let from_json = decode(json.as_bytes(), FormatHint::Auto).unwrap().unwrap();
        assert_eq!(from_binary, from_json);
    }

    #[test]
    fn test_auto_falls_back_to_json() {
        let payload = json!({"type": "text", "from": 1, "id": 2, "text": "x"}).to_string();
        let packet = decode(payload.as_bytes(), FormatHint::Auto).unwrap().unwrap();
        assert_eq!(packet.packet_id, Some(2));
    }

    #[test]
    fn test_json_hint_falls_back_to_binary() {
        let binary = envelope(3, port::TEXT_MESSAGE_APP, b"x".to_vec());
        let packet = decode(&binary, FormatHint::Json).unwrap().unwrap();
        assert_eq!(packet.packet_id, Some(3));
    }

    #[test]
    fn test_garbage_is_undecodable() {
        let err = decode(b"\xff\xfe not anything", FormatHint::Auto).unwrap_err();
        assert!(matches!(err, DecodeError::Undecodable { .. }));
        assert!(err.to_string().contains("binary:"));
    }

    #[test]
    fn test_format_hint_parsing() {
        assert_eq!("json".parse::<FormatHint>().unwrap(), FormatHint::Json);
        assert_eq!("binary".parse::<FormatHint>().unwrap(), FormatHint::Protobuf);
        assert_eq!("PROTOBUF".parse::<FormatHint>().unwrap(), FormatHint::Protobuf);
        assert_eq!(FormatHint::Auto.as_ref(), "auto");
    }
}
