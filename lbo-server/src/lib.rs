//! lbo-server library interface
//!
//! Batch logo-classification orchestrator: durable batch store, paced chunk
//! dispatcher, WebSocket progress broadcaster and connection registry. Exposed
//! as a library for integration testing.

pub mod api;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db::BatchStore;
use crate::services::{
    BatchOrchestrator, ChunkDispatcher, Classifier, ConnectionRegistry, DispatchSettings,
    ProgressBroadcaster, RegistryConfig,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: BatchOrchestrator,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: ProgressBroadcaster,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::batch_routes())
        .merge(api::ws_routes())
        .merge(api::health_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Composed services plus their background tasks
pub struct Runtime {
    pub state: AppState,
    pub cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Stop the broadcaster, the reaper and every dispatch run, then wait for them
    ///
    /// Interrupted batches keep their pending items for the next startup's recovery.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.state.orchestrator.dispatcher().drain().await;
    }
}

/// Wire store, dispatcher, registry and broadcaster together
///
/// Subscribes the broadcaster to the store's event bus before returning, so no
/// mutation made afterwards is missed. Must be called inside a Tokio runtime.
pub fn assemble(
    store: BatchStore,
    classifier: Arc<dyn Classifier>,
    dispatch: DispatchSettings,
    registry_config: RegistryConfig,
) -> Runtime {
    let cancel = CancellationToken::new();
    let registry = Arc::new(ConnectionRegistry::new(registry_config));
    let dispatcher =
        ChunkDispatcher::new(store.clone(), classifier, dispatch).with_cancellation(cancel.clone());
    let orchestrator = BatchOrchestrator::new(store.clone(), dispatcher, registry.clone());
    let broadcaster = ProgressBroadcaster::new(registry.clone(), store.clone());

    let events = store.events().subscribe();
    let tasks = vec![
        broadcaster.clone().spawn(events, cancel.clone()),
        registry.clone().spawn_reaper(cancel.clone()),
    ];

    let state = AppState {
        orchestrator,
        registry,
        broadcaster,
        startup_time: Utc::now(),
    };

    Runtime {
        state,
        cancel,
        tasks,
    }
}
