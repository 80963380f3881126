//! lbo-server - Batch logo classification orchestrator
//!
//! Accepts batches of images over HTTP, classifies them against the detection
//! service in paced chunks, and pushes progress to clients over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lbo_common::config::{resolve_config_path, TomlConfig};
use lbo_common::events::EventBus;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lbo_server::db::{self, BatchStore};
use lbo_server::services::{DispatchSettings, HttpClassifier, RegistryConfig};

/// Command-line arguments for lbo-server
#[derive(Parser, Debug)]
#[command(name = "lbo-server")]
#[command(about = "Batch logo classification orchestrator")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "LBO_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides [server] bind
    #[arg(short, long, env = "LBO_BIND")]
    bind: Option<String>,

    /// SQLite database file, overrides [server] database_path
    #[arg(short, long, env = "LBO_DATABASE")]
    database: Option<PathBuf>,

    /// Detection service base URL, overrides [classifier] base_url
    #[arg(long, env = "LBO_CLASSIFIER_URL")]
    classifier_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing is seeded from the config, so nothing on this path may log yet
    let config_path = resolve_config_path(args.config.as_deref());
    let mut config = TomlConfig::from_source(config_path.as_deref())
        .context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(database) = args.database {
        config.server.database_path = database;
    }
    if let Some(url) = args.classifier_url {
        config.classifier.base_url = url;
    }
    config.validate().context("Invalid configuration")?;

    // Initialize tracing; RUST_LOG wins over [logging] level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting lbo-server (batch logo classification orchestrator)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults (no config file found)"),
    }
    info!("Database: {}", config.server.database_path.display());
    info!("Classifier: {}", config.classifier.base_url);

    let pool = db::init_database_pool(&config.server.database_path)
        .await
        .context("Failed to open database")?;
    info!("Database connection established");

    let event_bus = EventBus::new(config.store.event_capacity);
    let store = BatchStore::new(pool, event_bus, config.store.max_lock_wait_ms);

    let classifier = HttpClassifier::new(
        config.classifier.base_url.clone(),
        Duration::from_secs(config.dispatch.classify_timeout_secs),
    )
    .context("Failed to build classifier client")?;

    let runtime = lbo_server::assemble(
        store,
        Arc::new(classifier),
        DispatchSettings::from_config(&config.dispatch, &config.pacing),
        RegistryConfig::from_config(&config.connections),
    );

    let recovery = runtime
        .state
        .orchestrator
        .recover()
        .await
        .context("Failed to resume unfinished batches")?;
    if recovery.batches > 0 {
        info!(
            batches = recovery.batches,
            redispatched = recovery.redispatched,
            lost = recovery.lost,
            "Resumed unfinished batches"
        );
    }

    let app = lbo_server::build_router(runtime.state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
    info!("Listening on http://{}", config.server.bind);
    info!("Health check: http://{}/health", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    runtime.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
