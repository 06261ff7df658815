//! Integration tests for meshmanager
//!
//! A fake upstream poll API runs on a random local port; collectors run
//! against it through the manager, and the HTTP surface is exercised over
//! real sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use meshmanager::collector::{
    CollectorError, CollectorManager, CollectorOptions, CollectorState, FailureKind,
};
use meshmanager::metrics::{IngestCounters, MetricsAggregator};
use meshmanager::server::{AppState, create_router};
use meshmanager::storage::{SourceRecord, StorageBuilder, StorageError, StorageHandles};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const TOKEN: &str = "test-token";

// =============================================================================
// Test Helpers
// =============================================================================

async fn build_storage(dir: &tempfile::TempDir) -> (StorageHandles, IngestCounters) {
    let url = format!("sqlite:{}", dir.path().join("integration.db").display());
    let counters = IngestCounters::new().expect("Failed to create counters");
    let handles = StorageBuilder::new(&url)
        .counters(counters.clone())
        .build()
        .await
        .expect("Failed to build storage");
    (handles, counters)
}

/// Serve `router` on a random port and return its base URL.
async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{}", addr)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

/// Two pages of 50 nodes, then an empty page.
async fn nodes_handler(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let (range, next) = match query.get("cursor").map(String::as_str) {
        None => (1..=50u32, Some("page-2")),
        Some("page-2") => (51..=100u32, Some("page-3")),
        _ => (1..=0u32, None),
    };
    let nodes: Vec<Value> = range
        .map(|n| {
            json!({
                "nodeNum": n,
                "user": {"shortName": format!("N{n}"), "longName": format!("Node {n}")},
                "lastHeard": 1_700_000_000 + n,
            })
        })
        .collect();
    Json(json!({
        "nodes": nodes,
        "has_more": next.is_some(),
        "next_cursor": next,
    }))
    .into_response()
}

async fn empty_handler(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([])).into_response()
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn garbage_handler() -> &'static str {
    "<html>maintenance</html>"
}

fn fake_upstream() -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/v1/network/nodes", get(nodes_handler))
        .route("/api/v1/messages", get(empty_handler))
        .route("/api/v1/telemetry", get(empty_handler))
        .route("/api/v1/traceroutes/recent", get(empty_handler))
}

/// Same listing endpoints, but telemetry answers with a non-JSON body and
/// there is no health endpoint.
fn broken_telemetry_upstream() -> Router {
    Router::new()
        .route("/api/v1/network/nodes", get(nodes_handler))
        .route("/api/v1/messages", get(empty_handler))
        .route("/api/v1/telemetry", get(garbage_handler))
        .route("/api/v1/traceroutes/recent", get(empty_handler))
}

fn test_options() -> CollectorOptions {
    CollectorOptions {
        reconcile_interval: Duration::from_millis(200),
        http_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        ..CollectorOptions::default()
    }
}

async fn node_count(handles: &StorageHandles, source_id: &str) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM nodes WHERE source_id = ?")
        .bind(source_id)
        .fetch_one(handles.pool.inner())
        .await
        .expect("Failed to count nodes")
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// =============================================================================
// Collection Tests
// =============================================================================

#[tokio::test]
async fn test_poll_source_collects_all_pages() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, _counters) = build_storage(&dir).await;
    let upstream = serve(fake_upstream()).await;

    let mut source = SourceRecord::meshmonitor("office", &upstream);
    source.api_token = Some(TOKEN.to_string());
    source.poll_interval_seconds = 60;
    handles.sources.insert(&source).await.unwrap();

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    ));
    let report = manager.reconcile(&handles.sources.list_all().await.unwrap()).await;
    assert_eq!(report.started, vec![source.id.clone()]);

    let done = eventually(|| async { node_count(&handles, &source.id).await == 100 }).await;
    assert!(done, "expected 100 nodes from two pages");

    let healthy = eventually(|| async {
        manager
            .health()
            .get(&source.id)
            .await
            .is_some_and(|h| h.last_success.is_some())
    })
    .await;
    assert!(healthy);

    let stored = handles.sources.get(&source.id).await.unwrap().unwrap();
    assert!(stored.last_poll_at.is_some());
    assert!(stored.healthy);
    assert!(stored.last_error.is_none());

    assert_eq!(manager.shutdown().await, 0);
    handles.shutdown().await;
}

#[tokio::test]
async fn test_poll_source_auth_failure_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, _counters) = build_storage(&dir).await;
    let upstream = serve(fake_upstream()).await;

    let mut bad = SourceRecord::meshmonitor("bad-token", &upstream);
    bad.api_token = Some("wrong".to_string());
    bad.poll_interval_seconds = 60;
    handles.sources.insert(&bad).await.unwrap();

    let mut good = SourceRecord::meshmonitor("good-token", &upstream);
    good.api_token = Some(TOKEN.to_string());
    good.poll_interval_seconds = 60;
    handles.sources.insert(&good).await.unwrap();

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    ));
    manager.reconcile(&handles.sources.list_all().await.unwrap()).await;

    let failed = eventually(|| async {
        manager
            .health()
            .get(&bad.id)
            .await
            .is_some_and(|h| h.consecutive_failures >= 1)
    })
    .await;
    assert!(failed);

    let health = manager.health().get(&bad.id).await.unwrap();
    assert_eq!(health.state, CollectorState::Backoff);
    assert_eq!(health.reason, Some(FailureKind::Authentication));
    assert!(health.current_backoff.is_some());

    let stored = handles.sources.get(&bad.id).await.unwrap().unwrap();
    assert!(stored.last_error.is_some());
    assert!(stored.last_poll_at.is_none());

    let done = eventually(|| async { node_count(&handles, &good.id).await == 100 }).await;
    assert!(done, "healthy source must keep collecting");
    assert_eq!(node_count(&handles, &bad.id).await, 0);

    manager.shutdown().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_disabled_source_is_stopped_on_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, _counters) = build_storage(&dir).await;
    let upstream = serve(fake_upstream()).await;

    let mut source = SourceRecord::meshmonitor("office", &upstream);
    source.api_token = Some(TOKEN.to_string());
    handles.sources.insert(&source).await.unwrap();

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    ));
    manager.reconcile(&handles.sources.list_all().await.unwrap()).await;
    assert_eq!(manager.collector_ids().await, vec![source.id.clone()]);

    handles.sources.set_enabled(&source.id, false).await.unwrap();
    let report = manager.reconcile(&handles.sources.list_all().await.unwrap()).await;
    assert_eq!(report.stopped, vec![source.id.clone()]);
    assert!(manager.collector_ids().await.is_empty());
    assert!(manager.health().get(&source.id).await.is_none());

    manager.shutdown().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_valid_source_runs_beside_corrupt_row() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, _counters) = build_storage(&dir).await;
    let upstream = serve(fake_upstream()).await;

    let mut good = SourceRecord::meshmonitor("good", &upstream);
    good.api_token = Some(TOKEN.to_string());
    good.poll_interval_seconds = 60;
    handles.sources.insert(&good).await.unwrap();

    let corrupt = SourceRecord::mqtt("corrupt", "localhost", "msh/#");
    handles.sources.insert(&corrupt).await.unwrap();
    sqlx::query("UPDATE sources SET source_type = 'carrier-pigeon' WHERE id = ?")
        .bind(&corrupt.id)
        .execute(handles.pool.inner())
        .await
        .unwrap();

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    ));
    let reconcile_loop = tokio::spawn(Arc::clone(&manager).run());
    manager.trigger_reconcile();

    let done = eventually(|| async { node_count(&handles, &good.id).await == 100 }).await;
    assert!(done, "readable source must be collected despite the corrupt row");

    let health = manager.health().get(&corrupt.id).await.unwrap();
    assert_eq!(health.state, CollectorState::Failed);
    assert_eq!(health.reason, Some(FailureKind::Configuration));
    assert_eq!(health.source_type, None);
    assert!(health.last_error.unwrap().contains("carrier-pigeon"));

    let (healthy, reason): (bool, Option<String>) =
        sqlx::query_as("SELECT healthy, health_reason FROM sources WHERE id = ?")
            .bind(&corrupt.id)
            .fetch_one(handles.pool.inner())
            .await
            .unwrap();
    assert!(!healthy);
    assert_eq!(reason.as_deref(), Some("configuration"));

    manager.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), reconcile_loop)
        .await
        .expect("reconcile loop should exit")
        .unwrap();
    handles.shutdown().await;
}

#[tokio::test]
async fn test_partial_cycle_keeps_last_error() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, _counters) = build_storage(&dir).await;
    let upstream = serve(broken_telemetry_upstream()).await;

    let mut source = SourceRecord::meshmonitor("flaky", &upstream);
    source.api_token = Some(TOKEN.to_string());
    source.poll_interval_seconds = 60;
    handles.sources.insert(&source).await.unwrap();

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    ));
    manager.reconcile(&handles.sources.list_all().await.unwrap()).await;

    let completed = eventually(|| async {
        manager
            .health()
            .get(&source.id)
            .await
            .is_some_and(|h| h.last_success.is_some())
    })
    .await;
    assert!(completed);
    assert_eq!(node_count(&handles, &source.id).await, 100);

    let health = manager.health().get(&source.id).await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.last_error.unwrap().contains("telemetry"));

    let stored = handles.sources.get(&source.id).await.unwrap().unwrap();
    assert!(stored.last_poll_at.is_some());
    assert!(stored.last_error.unwrap().contains("telemetry"));

    manager.shutdown().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_deleted_source_counters_leave_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, counters) = build_storage(&dir).await;

    let source = SourceRecord::meshmonitor("retired", "http://127.0.0.1:9");
    handles.sources.insert(&source).await.unwrap();
    counters.messages_received(&source.id, 3);
    counters.decode_error(&source.id);

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    ));
    let metrics = MetricsAggregator::new(
        counters,
        handles.stats.clone(),
        manager.health().clone(),
        Duration::from_secs(3600),
    )
    .unwrap();

    manager
        .reconcile_listing(&handles.sources.list_checked().await.unwrap())
        .await;
    let label = format!("source_id=\"{}\"", source.id);
    let text = metrics.render().await.unwrap();
    assert!(text.contains(&format!("meshmanager_messages_received_total{{{label}}} 3")));

    // Disabling keeps the counters; deleting drops them.
    handles.sources.set_enabled(&source.id, false).await.unwrap();
    let report = manager
        .reconcile_listing(&handles.sources.list_checked().await.unwrap())
        .await;
    assert_eq!(report.stopped, vec![source.id.clone()]);
    assert!(metrics.render().await.unwrap().contains(&label));

    handles.sources.delete(&source.id).await.unwrap();
    manager
        .reconcile_listing(&handles.sources.list_checked().await.unwrap())
        .await;
    assert!(!metrics.render().await.unwrap().contains(&label));

    manager.shutdown().await;
    handles.shutdown().await;
}

// =============================================================================
// Connection Test Tests
// =============================================================================

#[tokio::test]
async fn test_source_connection_checks() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, _counters) = build_storage(&dir).await;
    let upstream = serve(fake_upstream()).await;
    let no_health = serve(broken_telemetry_upstream()).await;

    let mut good = SourceRecord::meshmonitor("good", &upstream);
    good.api_token = Some(TOKEN.to_string());
    handles.sources.insert(&good).await.unwrap();

    let mut wrong_token = SourceRecord::meshmonitor("wrong-token", &upstream);
    wrong_token.api_token = Some("wrong".to_string());
    handles.sources.insert(&wrong_token).await.unwrap();

    let mut missing_health = SourceRecord::meshmonitor("old-api", &no_health);
    missing_health.api_token = Some(TOKEN.to_string());
    handles.sources.insert(&missing_health).await.unwrap();

    let manager = CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    );

    let check = manager.test_source(&good.id).await.unwrap();
    assert_eq!(check.nodes_seen, Some(50));
    assert_eq!(node_count(&handles, &good.id).await, 0);

    let err = manager.test_source(&wrong_token.id).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Authentication);

    let err = manager.test_source(&missing_health.id).await.unwrap_err();
    assert!(err.to_string().contains("health check returned 404"));

    let err = manager.test_source("no-such-source").await.unwrap_err();
    assert!(matches!(
        err,
        CollectorError::Storage(StorageError::SourceNotFound(_))
    ));

    // A collector-less connection test leaves health untouched.
    assert!(manager.health().get(&good.id).await.is_none());

    handles.shutdown().await;
}

// =============================================================================
// HTTP Surface Tests
// =============================================================================

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (handles, counters) = build_storage(&dir).await;
    let upstream = serve(fake_upstream()).await;

    let mut source = SourceRecord::meshmonitor("office", &upstream);
    source.api_token = Some(TOKEN.to_string());
    handles.sources.insert(&source).await.unwrap();

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        test_options(),
    ));
    manager.reconcile(&handles.sources.list_all().await.unwrap()).await;
    eventually(|| async { node_count(&handles, &source.id).await == 100 }).await;

    let metrics = MetricsAggregator::new(
        counters,
        handles.stats.clone(),
        manager.health().clone(),
        Duration::from_secs(3600 * 24 * 365 * 50),
    )
    .unwrap();
    let base_url = serve(create_router(AppState {
        pool: handles.pool.clone(),
        health: manager.health().clone(),
        metrics: Arc::new(metrics),
    }))
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/healthz", base_url))
        .send()
        .await
        .expect("Failed to send healthz request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .get(format!("{}/readyz", base_url))
        .send()
        .await
        .expect("Failed to send readyz request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["db"], "ready");

    let resp = client
        .get(format!("{}/api/sources/health", base_url))
        .send()
        .await
        .expect("Failed to fetch source health");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body[0]["source_id"], source.id.as_str());
    assert_eq!(body[0]["source_type"], "meshmonitor");

    let resp = client
        .get(format!("{}/metrics", base_url))
        .send()
        .await
        .expect("Failed to fetch metrics");
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains(&format!(
        "meshmanager_active_nodes{{source_id=\"{}\"}} 100",
        source.id
    )));
    assert!(text.contains(&format!(
        "meshmanager_source_healthy{{source_id=\"{}\"}} 1",
        source.id
    )));

    manager.shutdown().await;
    handles.shutdown().await;
}
