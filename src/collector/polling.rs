//! Poll-based collector for MeshMonitor-style HTTP APIs.
//!
//! Each cycle walks four paginated endpoints in turn and persists every page
//! as soon as it is parsed. Bad records are skipped individually; a bad page
//! ends that endpoint's walk but not the cycle.

use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter};
use url::Url;

use crate::collector::{
    Collector, CollectorContext, CollectorError, CollectorOptions, ConnectionCheck, CycleOutcome,
    FailureKind, Schedule,
};
use crate::decoder::{
    DecodeError, DecodedPacket, parse_message_record, parse_node_record, parse_telemetry_record,
    parse_traceroute_record,
};
use crate::storage::{ApplyOutcome, Persister, SourceRecord, SourceType};

/// Liveness endpoint checked before a connection test lists nodes.
pub const HEALTH_PATH: &str = "/api/health";

/// Upstream listing endpoints, walked in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Endpoint {
    Nodes,
    Messages,
    Telemetry,
    Traceroutes,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::Nodes => "/api/v1/network/nodes",
            Self::Messages => "/api/v1/messages",
            Self::Telemetry => "/api/v1/telemetry",
            Self::Traceroutes => "/api/v1/traceroutes/recent",
        }
    }

    fn items_key(self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Messages => "messages",
            Self::Telemetry => "telemetry",
            Self::Traceroutes => "traceroutes",
        }
    }

    fn parse(self, record: &Value) -> Result<Option<DecodedPacket>, DecodeError> {
        match self {
            Self::Nodes => parse_node_record(record).map(Some),
            Self::Messages => parse_message_record(record).map(Some),
            Self::Telemetry => parse_telemetry_record(record),
            Self::Traceroutes => parse_traceroute_record(record).map(Some),
        }
    }
}

/// One page of an upstream listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    /// Cursor for the next page; `None` ends the walk.
    pub next_cursor: Option<String>,
}

impl Page {
    /// Interpret a response body.
    ///
    /// A bare array is a single terminal page. An object carries its items
    /// under the endpoint's key (or `items`/`data`) plus `has_more` and
    /// `next_cursor`.
    pub fn from_body(body: Value, endpoint: Endpoint) -> Result<Self, CollectorError> {
        let mut obj = match body {
            Value::Array(items) => {
                return Ok(Self {
                    items,
                    next_cursor: None,
                });
            }
            Value::Object(obj) => obj,
            other => {
                return Err(CollectorError::MalformedData(format!(
                    "{endpoint} page is not an object or array: {}",
                    json_type(&other)
                )));
            }
        };

        let items = [endpoint.items_key(), "items", "data"]
            .iter()
            .find_map(|key| match obj.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                CollectorError::MalformedData(format!("{endpoint} page has no item list"))
            })?;

        let has_more = ["has_more", "hasMore"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_bool))
            .unwrap_or(false);
        let cursor = ["next_cursor", "nextCursor"]
            .iter()
            .find_map(|key| match obj.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            });

        let next_cursor = if has_more && !items.is_empty() {
            cursor
        } else {
            None
        };
        Ok(Self { items, next_cursor })
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Map a non-success status onto the failure classes.
fn check_status(status: StatusCode, what: &str) -> Result<(), CollectorError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CollectorError::Authentication(
            format!("{what} returned {status}"),
        )),
        StatusCode::TOO_MANY_REQUESTS => {
            Err(CollectorError::Network(format!("{what} returned {status}")))
        }
        s if s.is_server_error() => {
            Err(CollectorError::Network(format!("{what} returned {status}")))
        }
        s if !s.is_success() => Err(CollectorError::MalformedData(format!(
            "{what} returned {status}"
        ))),
        _ => Ok(()),
    }
}

/// Resolved settings for one poll source.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    pub source_id: String,
    pub base_url: String,
    pub api_token: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub page_size: u32,
    pub max_pages: u32,
}

impl PollingConfig {
    /// Build from a source record.
    ///
    /// # Errors
    /// Returns `CollectorError::Config` when the URL is missing or invalid or
    /// the interval is below one second.
    pub fn from_source(
        source: &SourceRecord,
        options: &CollectorOptions,
    ) -> Result<Self, CollectorError> {
        if source.source_type != SourceType::MeshMonitor {
            return Err(CollectorError::Config(format!(
                "source '{}' is not a poll source",
                source.name
            )));
        }
        let raw_url = source
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CollectorError::Config("missing url".to_string()))?;
        let parsed = Url::parse(raw_url)
            .map_err(|e| CollectorError::Config(format!("invalid url '{raw_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CollectorError::Config(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }

        let secs = u64::try_from(source.poll_interval_seconds)
            .ok()
            .filter(|s| *s >= 1)
            .ok_or_else(|| {
                CollectorError::Config(format!(
                    "poll interval must be at least 1s, got {}",
                    source.poll_interval_seconds
                ))
            })?;
        let interval = Duration::from_secs(secs);

        // A request must finish before the next poll is due.
        let timeout = if options.http_timeout < interval {
            options.http_timeout
        } else {
            interval / 2
        };

        Ok(Self {
            source_id: source.id.clone(),
            base_url: raw_url.trim_end_matches('/').to_string(),
            api_token: source.api_token.clone().filter(|t| !t.is_empty()),
            interval,
            timeout,
            page_size: options.page_size.max(1),
            max_pages: options.max_pages.max(1),
        })
    }
}

/// HTTP poll collector.
pub struct PollingCollector {
    config: PollingConfig,
    client: Client,
    persister: Persister,
}

impl std::fmt::Debug for PollingCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingCollector")
            .field("source_id", &self.config.source_id)
            .field("base_url", &self.config.base_url)
            .field("interval", &self.config.interval)
            .finish_non_exhaustive()
    }
}

impl PollingCollector {
    /// # Errors
    /// Returns `CollectorError::Config` if the HTTP client cannot be built.
    pub fn new(config: PollingConfig, persister: Persister) -> Result<Self, CollectorError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("meshmanager/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CollectorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            persister,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json");
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        cursor: Option<&str>,
    ) -> Result<Page, CollectorError> {
        let url = format!("{}{}", self.config.base_url, endpoint.path());
        let mut request = self
            .get(&url)
            .query(&[("limit", self.config.page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request.send().await?;
        check_status(response.status(), endpoint.as_ref())?;

        let bytes = response.bytes().await?;
        let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
            CollectorError::MalformedData(format!("{endpoint} returned invalid json: {e}"))
        })?;
        Page::from_body(body, endpoint)
    }

    /// Walk one endpoint to its last page, persisting as it goes.
    async fn poll_endpoint(
        &self,
        endpoint: Endpoint,
        ctx: &CollectorContext,
    ) -> Result<ApplyOutcome, CollectorError> {
        let source_id = self.config.source_id.as_str();
        let mut total = ApplyOutcome::default();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(total);
            }
            let page = tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(total),
                page = self.fetch_page(endpoint, cursor.as_deref()) => page?,
            };
            pages += 1;

            let mut packets = Vec::with_capacity(page.items.len());
            for item in &page.items {
                match endpoint.parse(item) {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(source_id = %source_id, endpoint = %endpoint, error = %e, "Skipping record");
                        self.persister.counters().decode_error(source_id);
                        total.rejected += 1;
                    }
                }
            }

            if !packets.is_empty() {
                total += self
                    .persister
                    .apply_batch(source_id, &packets, Utc::now())
                    .await?;
            }

            let Some(next) = page.next_cursor else {
                break;
            };
            if cursor.as_deref() == Some(next.as_str()) {
                return Err(CollectorError::MalformedData(format!(
                    "{endpoint} repeated cursor '{next}'"
                )));
            }
            if pages >= self.config.max_pages {
                return Err(CollectorError::MalformedData(format!(
                    "{endpoint} exceeded {} pages",
                    self.config.max_pages
                )));
            }
            cursor = Some(next);
        }

        tracing::debug!(
            source_id = %source_id,
            endpoint = %endpoint,
            pages,
            nodes = total.nodes_upserted,
            messages = total.messages_inserted,
            "Endpoint polled"
        );
        Ok(total)
    }
}

#[async_trait::async_trait]
impl Collector for PollingCollector {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::MeshMonitor
    }

    fn schedule(&self) -> Schedule {
        Schedule::interval(self.config.interval)
    }

    async fn run_cycle(&self, ctx: &CollectorContext) -> Result<CycleOutcome, CollectorError> {
        let start = std::time::Instant::now();
        let mut total = ApplyOutcome::default();
        let mut outcome = CycleOutcome::complete();

        for endpoint in Endpoint::iter() {
            match self.poll_endpoint(endpoint, ctx).await {
                Ok(applied) => total += applied,
                Err(e) if e.kind() == FailureKind::MalformedData => {
                    tracing::warn!(source_id = %self.config.source_id, endpoint = %endpoint, error = %e, "Dropping endpoint data");
                    outcome = CycleOutcome::partial(&e);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            source_id = %self.config.source_id,
            duration_ms = start.elapsed().as_millis() as u64,
            nodes = total.nodes_upserted,
            messages = total.messages_inserted,
            duplicates = total.messages_duplicate,
            telemetry = total.telemetry_appended,
            traceroutes = total.traceroutes_appended,
            rejected = total.rejected,
            partial = outcome.data_error.is_some(),
            "Poll cycle completed"
        );
        Ok(outcome)
    }

    /// Health endpoint must answer 200, then the first node page must parse.
    async fn test_connection(&self) -> Result<ConnectionCheck, CollectorError> {
        let url = format!("{}{HEALTH_PATH}", self.config.base_url);
        let response = self.get(&url).send().await?;
        check_status(response.status(), "health check")?;

        let page = self.fetch_page(Endpoint::Nodes, None).await?;
        tracing::debug!(source_id = %self.config.source_id, nodes = page.items.len(), "Connection test passed");
        Ok(ConnectionCheck {
            nodes_seen: Some(page.items.len()),
        })
    }
}
