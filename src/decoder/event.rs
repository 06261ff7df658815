//! Normalized, source-agnostic events produced by the decoder.

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumString};

/// Broadcast destination used by mesh firmware.
pub const BROADCAST_NODE: u32 = 0xFFFF_FFFF;

/// Canonical `!xxxxxxxx` identifier for a node number.
pub fn node_id_for(node_num: u32) -> String {
    format!("!{node_num:08x}")
}

/// One decoded packet or poll record, ready for persistence.
///
/// Link-level fields are `None` when the wire format did not carry them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedPacket {
    /// Packet id, required for messages and used for dedup.
    pub packet_id: Option<u32>,
    /// Originating node number.
    pub from: u32,
    /// Destination node number.
    pub to: Option<u32>,
    /// Channel index.
    pub channel: Option<u32>,
    /// Channel name when the transport carried one.
    pub channel_name: Option<String>,
    /// Time the packet was received by the reporting gateway.
    pub rx_time: Option<DateTime<Utc>>,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    /// Application payload.
    pub event: NormalizedEvent,
}

impl DecodedPacket {
    /// Create a packet with only the sender and payload set.
    pub fn new(from: u32, event: NormalizedEvent) -> Self {
        Self {
            packet_id: None,
            from,
            to: None,
            channel: None,
            channel_name: None,
            rx_time: None,
            rx_snr: None,
            rx_rssi: None,
            hop_limit: None,
            hop_start: None,
            event,
        }
    }

    /// Authoritative event time: gateway receive time, else the time carried
    /// inside the payload.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.rx_time.or_else(|| self.event.payload_time())
    }
}

/// Application payload, dispatched by packet application type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Text(TextMessage),
    Position(Position),
    Telemetry(Telemetry),
    Traceroute(Traceroute),
    NodeInfo(NodeInfo),
    /// Full node record as returned by a polled node listing.
    NodeSnapshot {
        info: NodeInfo,
        position: Option<Position>,
    },
}

impl NormalizedEvent {
    /// Short label used in logs and counters.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Position(_) => "position",
            Self::Telemetry(_) => "telemetry",
            Self::Traceroute(_) => "traceroute",
            Self::NodeInfo(_) => "nodeinfo",
            Self::NodeSnapshot { .. } => "node",
        }
    }

    fn payload_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Position(p) => p.time,
            Self::Telemetry(t) => t.time,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMessage {
    pub text: String,
    pub reply_id: Option<u32>,
    pub emoji: Option<u32>,
}

/// Position fix. Coordinates are kept in the wire's integer form
/// (degrees * 1e7) so binary and JSON sources compare exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Position {
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
    pub time: Option<DateTime<Utc>>,
    pub precision_bits: Option<u32>,
}

impl Position {
    /// Convert decimal degrees to the integer wire form.
    pub fn degrees_to_i(deg: f64) -> Option<i32> {
        if !deg.is_finite() || !(-180.0..=180.0).contains(&deg) {
            return None;
        }
        Some((deg * 1e7).round() as i32)
    }

    pub fn latitude(&self) -> Option<f64> {
        self.latitude_i.map(|v| f64::from(v) * 1e-7)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.longitude_i.map(|v| f64::from(v) * 1e-7)
    }

    /// A position is usable only with both coordinates.
    pub fn has_fix(&self) -> bool {
        self.latitude_i.is_some() && self.longitude_i.is_some()
    }
}

/// Telemetry variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TelemetryKind {
    Device,
    Environment,
    Position,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnvironmentMetrics {
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub kind: TelemetryKind,
    pub time: Option<DateTime<Utc>>,
    pub device: Option<DeviceMetrics>,
    pub environment: Option<EnvironmentMetrics>,
}

/// Route snapshot. SNR values are in dB.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Traceroute {
    pub route: Vec<u32>,
    pub route_back: Vec<u32>,
    pub snr_towards: Vec<f32>,
    pub snr_back: Vec<f32>,
}

impl Traceroute {
    /// SNR arrays must be empty or match their hop array.
    pub fn validate(&self) -> Result<(), String> {
        if !self.snr_towards.is_empty() && self.snr_towards.len() != self.route.len() {
            return Err(format!(
                "snr_towards has {} entries for {} hops",
                self.snr_towards.len(),
                self.route.len()
            ));
        }
        if !self.snr_back.is_empty() && self.snr_back.len() != self.route_back.len() {
            return Err(format!(
                "snr_back has {} entries for {} hops",
                self.snr_back.len(),
                self.route_back.len()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeInfo {
    pub node_id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub role: Option<String>,
    pub is_licensed: Option<bool>,
}

/// Hardware model name for a firmware enum value.
pub fn hw_model_name(value: i32) -> String {
    let name = match value {
        0 => "UNSET",
        1 => "TLORA_V2",
        2 => "TLORA_V1",
        3 => "TLORA_V2_1_1P6",
        4 => "TBEAM",
        5 => "HELTEC_V2_0",
        6 => "TBEAM_V0P7",
        7 => "T_ECHO",
        8 => "TLORA_V1_1P3",
        9 => "RAK4631",
        10 => "HELTEC_V2_1",
        11 => "HELTEC_V1",
        12 => "LILYGO_TBEAM_S3_CORE",
        13 => "RAK11200",
        14 => "NANO_G1",
        15 => "TLORA_V2_1_1P8",
        16 => "TLORA_T3_S3",
        17 => "NANO_G1_EXPLORER",
        18 => "NANO_G2_ULTRA",
        25 => "STATION_G1",
        26 => "RAK11310",
        29 => "CANARYONE",
        31 => "STATION_G2",
        39 => "DIY_V1",
        43 => "HELTEC_V3",
        44 => "HELTEC_WSL_V3",
        47 => "RPI_PICO",
        48 => "HELTEC_WIRELESS_TRACKER",
        49 => "HELTEC_WIRELESS_PAPER",
        50 => "T_DECK",
        51 => "T_WATCH_S3",
        52 => "PICOMPUTER_S3",
        53 => "HELTEC_HT62",
        255 => "PRIVATE_HW",
        other => return format!("UNKNOWN_{other}"),
    };
    name.to_string()
}

/// Device role name for a firmware enum value.
pub fn role_name(value: i32) -> String {
    let name = match value {
        0 => "CLIENT",
        1 => "CLIENT_MUTE",
        2 => "ROUTER",
        3 => "ROUTER_CLIENT",
        4 => "REPEATER",
        5 => "TRACKER",
        6 => "SENSOR",
        7 => "TAK",
        8 => "CLIENT_HIDDEN",
        9 => "LOST_AND_FOUND",
        10 => "TAK_TRACKER",
        11 => "ROUTER_LATE",
        other => return format!("UNKNOWN_{other}"),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_format() {
        assert_eq!(node_id_for(0xa1b2c3d4), "!a1b2c3d4");
        assert_eq!(node_id_for(42), "!0000002a");
    }

    #[test]
    fn test_degrees_roundtrip_is_exact() {
        let lat = Position::degrees_to_i(37.7749).unwrap();
        assert_eq!(lat, 377_749_000);
        assert_eq!(Position::degrees_to_i(f64::NAN), None);
        assert_eq!(Position::degrees_to_i(512.0), None);
    }

    #[test]
    fn test_traceroute_validation() {
        let ok = Traceroute {
            route: vec![1, 2],
            snr_towards: vec![1.0, 2.5],
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let empty_snr = Traceroute {
            route: vec![1, 2, 3],
            ..Default::default()
        };
        assert!(empty_snr.validate().is_ok());

        let bad = Traceroute {
            route: vec![1, 2],
            snr_towards: vec![1.0],
            ..Default::default()
        };
        assert!(bad.validate().unwrap_err().contains("snr_towards"));
    }

    #[test]
    fn test_enum_names() {
        assert_eq!(hw_model_name(9), "RAK4631");
        assert_eq!(hw_model_name(1000), "UNKNOWN_1000");
        assert_eq!(role_name(2), "ROUTER");
        assert_eq!(TelemetryKind::Device.as_ref(), "device");
        assert_eq!(
            "Environment".parse::<TelemetryKind>().unwrap(),
            TelemetryKind::Environment
        );
    }

    #[test]
    fn test_observed_at_falls_back_to_payload_time() {
        let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let packet = DecodedPacket::new(
            1,
            NormalizedEvent::Position(Position {
                time: Some(t),
                ..Default::default()
            }),
        );
        assert_eq!(packet.observed_at(), Some(t));
    }
}
