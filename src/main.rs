//! meshmanager Binary Entry Point
//!
//! Runs collection, retention and the HTTP surface in one process.
//! Core functionality is provided by the `meshmanager` library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use meshmanager::{
    collector::CollectorManager,
    config::AppConfig,
    metrics::{IngestCounters, MetricsAggregator},
    server::{AppState, create_router},
    storage::StorageBuilder,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// meshmanager - Mesh Network Telemetry
#[derive(Parser, Debug)]
#[command(name = "meshmanager", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "MESHMANAGER_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "MESHMANAGER_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "MESHMANAGER_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, env = "MESHMANAGER_DB_URL")]
    db_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,meshmanager=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("meshmanager - Mesh Network Telemetry");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(url) = cli.db_url {
        config.database.url = url;
    }
    config.validate()?;

    tracing::info!(
        "Server: {}:{}, Database: {}",
        config.server.bind,
        config.server.port,
        config.database.url,
    );

    // Storage
    let counters = IngestCounters::new()?;
    let mut handles = StorageBuilder::new(&config.database.url)
        .max_connections(config.database.max_connections)
        .busy_timeout(config.database.busy_timeout)
        .counters(counters.clone())
        .retention(
            config.retention.policy(),
            config.retention.interval,
            config.retention.batch_size,
        )
        .build()
        .await?;
    tracing::info!("Storage initialized");

    // Seed sources (insert only, no updates)
    let mut inserted = 0;
    let mut skipped = 0;
    for seed in &config.sources {
        let record = seed.to_record();
        match handles.sources.insert_if_not_exists(&record).await? {
            Some(id) => {
                tracing::info!(
                    "Seeded source: {} ({}, id={})",
                    record.name,
                    record.source_type.as_ref(),
                    id
                );
                inserted += 1;
            }
            None => {
                tracing::debug!("Source already exists, skipping: {}", record.name);
                skipped += 1;
            }
        }
    }
    if !config.sources.is_empty() {
        tracing::info!(
            "Source seeding complete: {} inserted, {} skipped",
            inserted,
            skipped
        );
    }

    // Background work
    let cancel = CancellationToken::new();
    let retention_task = handles
        .retention
        .take()
        .map(|sweeper| tokio::spawn(sweeper.run(cancel.child_token())));

    let manager = Arc::new(CollectorManager::new(
        handles.sources.clone(),
        handles.persister.clone(),
        config.collectors.clone(),
    ));
    let manager_task = tokio::spawn(Arc::clone(&manager).run());

    // HTTP surface
    let metrics = MetricsAggregator::new(
        counters,
        handles.stats.clone(),
        manager.health().clone(),
        config.metrics.active_window,
    )?;
    let app_state = AppState {
        pool: handles.pool.clone(),
        health: manager.health().clone(),
        metrics: Arc::new(metrics),
    };
    let app = create_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down collectors...");
    manager.shutdown().await;
    if let Err(e) = manager_task.await {
        tracing::error!(error = %e, "Reconcile loop failed");
    }

    cancel.cancel();
    if let Some(task) = retention_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Retention sweeper failed");
        }
    }

    tracing::info!("Shutting down storage...");
    handles.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
