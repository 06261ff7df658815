//! Seed source definitions.
//!
//! Sources listed in the config file are inserted on startup when no source
//! with the same name exists. After that the database owns them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::MIN_INTERVAL;
use crate::decoder::FormatHint;
use crate::storage::source_store::{DEFAULT_MQTT_PORT, DEFAULT_POLL_INTERVAL_SECS};
use crate::storage::{SourceRecord, SourceType};

use super::validation::{ConfigError, expand_optional, parse_http_url};

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS as u64)
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

/// One seed source.
///
/// Credential and address fields accept `${VAR}` and `${VAR:-default}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub source_type: SourceType,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    // Poll-based sources.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    // Broker sources.
    #[serde(default)]
    pub mqtt_host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    #[serde(default)]
    pub mqtt_topic: Option<String>,
    #[serde(default)]
    pub mqtt_use_tls: bool,
    #[serde(default)]
    pub payload_format: FormatHint,
}

impl SourceConfig {
    /// Check required fields for the source type.
    ///
    /// Poll sources must have a parseable URL and an interval longer than
    /// `http_timeout`.
    pub fn validate(&self, http_timeout: Duration) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "source name cannot be empty".to_string(),
            ));
        }

        match self.source_type {
            SourceType::MeshMonitor => {
                let owner = format!("source '{}'", self.name);
                let url = expand_optional(self.url.as_deref())
                    .ok_or_else(|| ConfigError::Invalid(format!("{owner}: url is required")))?;
                parse_http_url(&owner, &url)?;
                if self.poll_interval < MIN_INTERVAL {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}': poll_interval must be at least {}",
                        self.name,
                        humantime::format_duration(MIN_INTERVAL)
                    )));
                }
                if http_timeout >= self.poll_interval {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}': http_timeout ({}) must be shorter than poll_interval ({})",
                        self.name,
                        humantime::format_duration(http_timeout),
                        humantime::format_duration(self.poll_interval)
                    )));
                }
            }
            SourceType::Mqtt => {
                if self.mqtt_host.as_deref().is_none_or(|h| h.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}': mqtt_host is required",
                        self.name
                    )));
                }
                if self.mqtt_topic.as_deref().is_none_or(|t| t.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "source '{}': mqtt_topic is required",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build a fresh source record with environment variables expanded.
    pub fn to_record(&self) -> SourceRecord {
        let expand = |value: &Option<String>| expand_optional(value.as_deref());

        let mut record = match self.source_type {
            SourceType::MeshMonitor => {
                SourceRecord::meshmonitor(&self.name, expand(&self.url).unwrap_or_default())
            }
            SourceType::Mqtt => SourceRecord::mqtt(
                &self.name,
                expand(&self.mqtt_host).unwrap_or_default(),
                self.mqtt_topic.clone().unwrap_or_default(),
            ),
        };
        record.enabled = self.enabled;
        record.api_token = expand(&self.api_token);
        record.poll_interval_seconds = self.poll_interval.as_secs() as i64;
        record.mqtt_port = self.mqtt_port;
        record.mqtt_username = expand(&self.mqtt_username);
        record.mqtt_password = expand(&self.mqtt_password);
        record.mqtt_use_tls = self.mqtt_use_tls;
        record.payload_format = self.payload_format;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_poll_source_defaults() {
        let yaml = r#"
name: office
type: meshmonitor
url: http://10.0.0.5:8080
"#;
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert_eq!(config.payload_format, FormatHint::Auto);
        assert!(config.validate(TIMEOUT).is_ok());

        let record = config.to_record();
        assert_eq!(record.source_type, SourceType::MeshMonitor);
        assert_eq!(record.url.as_deref(), Some("http://10.0.0.5:8080"));
        assert_eq!(record.poll_interval_seconds, 300);
    }

    #[test]
    fn test_mqtt_source_roundtrip() {
        let yaml = r#"
name: public
type: mqtt
mqtt_host: mqtt.example.org
mqtt_port: 8883
mqtt_username: ${NONEXISTENT_MQTT_USER_98765:-meshdev}
mqtt_password: large4cats
mqtt_topic: msh/US/#
mqtt_use_tls: true
payload_format: protobuf
"#;
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate(TIMEOUT).is_ok());

        let record = config.to_record();
        assert_eq!(record.source_type, SourceType::Mqtt);
        assert_eq!(record.mqtt_port, 8883);
        assert_eq!(record.mqtt_username.as_deref(), Some("meshdev"));
        assert_eq!(record.mqtt_topic_pattern.as_deref(), Some("msh/US/#"));
        assert!(record.mqtt_use_tls);
        assert_eq!(record.payload_format, FormatHint::Protobuf);
    }

    #[test]
    fn test_poll_source_requires_url() {
        let yaml = "name: office\ntype: meshmonitor\n";
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate(TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("url is required"));
    }

    #[test]
    fn test_poll_source_invalid_url() {
        let yaml = "name: office\ntype: meshmonitor\nurl: not a url\n";
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate(TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("invalid URL"));
    }

    #[test]
    fn test_timeout_must_be_shorter_than_interval() {
        let yaml = "name: office\ntype: meshmonitor\nurl: http://h\npoll_interval: 30s\n";
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate(TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("http_timeout"));
        assert!(config.validate(Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_mqtt_source_requires_topic() {
        let yaml = "name: public\ntype: mqtt\nmqtt_host: broker\n";
        let config: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate(TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("mqtt_topic"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let yaml = "name: x\ntype: carrier-pigeon\n";
        assert!(serde_yaml::from_str::<SourceConfig>(yaml).is_err());
    }
}
