//! Server start-up: shared state, background workers and the HTTP router.
//!
//! All handlers reach the store, classifier and coordinator through the
//! Arc-wrapped `UnifiedAppState`; background workers share the same state
//! and stop on the shared shutdown signal.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    config::Config,
    coordinator::spawn_sweeper,
    relationship::RelationshipEngine,
    shared_state::{SharedState, UnifiedAppState},
    worker_threads::{EmbeddingWorker, RelationWorker},
};

/// Events and node texts are small; larger bodies are rejected with 413.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Spawn the sweeper, relation worker and (when embeddings are available)
/// the embedding refresher. Handles finish after `shared_state.shutdown()`.
pub fn spawn_background_workers(shared_state: &Arc<SharedState>) -> Vec<tokio::task::JoinHandle<()>> {
    let cfg = &shared_state.config;
    let mut handles = Vec::new();

    handles.push(spawn_sweeper(
        shared_state.coordinator.clone(),
        cfg.coordinator_config().sweep_interval,
        shared_state.shutdown_signal(),
    ));

    let relation_worker = Arc::new(RelationWorker::new(
        shared_state.store.clone(),
        RelationshipEngine::new(&cfg.relation_config()),
    ));
    handles.push(relation_worker.spawn(Duration::from_millis(cfg.relation_poll_ms), shared_state.shutdown_signal()));

    match &shared_state.embeddings {
        Some(service) => {
            let worker = Arc::new(EmbeddingWorker::new(
                shared_state.store.clone(),
                service.clone(),
                cfg.embedding_batch_size,
            ));
            handles.push(worker.spawn(Duration::from_millis(cfg.embedding_refresh_ms), shared_state.shutdown_signal()));
        }
        None => info!("Embedding refresher disabled"),
    }
    handles
}

/// Run the HTTP server until Ctrl-C, then drain the capture queue and stop
/// the workers.
pub async fn run_thread_server(cfg: Config) -> anyhow::Result<()> {
    crate::metrics::init_metrics();
    cfg.print_config();

    info!("Starting unified memory server");
    let addr = cfg.api_addr()?;
    let shared_state = Arc::new(SharedState::new(cfg)?);
    let workers = spawn_background_workers(&shared_state);

    let app = build_compatible_router(UnifiedAppState::new(shared_state.clone()));
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    shared_state.shutdown().await?;
    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            warn!("Background worker ended abnormally: {}", e);
        }
    }
    info!("Server stopped");
    Ok(())
}

/// Every route of the HTTP binding.
pub fn build_compatible_router(state: UnifiedAppState) -> axum::Router {
    use axum::{
        routing::{get, post, put},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        limit::RequestBodyLimitLayer,
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    use crate::api::{admin_api, capture_api, coordination_api, node_api, search_api};

    let timeout = Duration::from_secs(state.shared_state.config.request_timeout_seconds);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        // capture
        .route("/events", post(capture_api::submit_event))
        // graph
        .route("/nodes", put(node_api::upsert_node))
        .route("/nodes/:id", get(node_api::get_node).delete(node_api::delete_node))
        .route("/nodes/:id/edges", get(node_api::node_edges))
        .route("/nodes/:id/neighbors", get(node_api::neighbors))
        .route("/edges", post(node_api::link).delete(node_api::unlink))
        .route("/search", post(search_api::search))
        // coordination
        .route("/sessions", post(coordination_api::register).get(coordination_api::list_sessions))
        .route("/sessions/:id", get(coordination_api::get_session).delete(coordination_api::deregister))
        .route("/sessions/:id/heartbeat", post(coordination_api::heartbeat))
        .route(
            "/leases",
            post(coordination_api::acquire_lease)
                .delete(coordination_api::release_lease)
                .get(coordination_api::leases_for),
        )
        .route("/handoffs", post(coordination_api::handoff))
        // admin
        .route("/stats", get(admin_api::stats))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/admin/weights", put(admin_api::set_weights))
        .route("/admin/maintenance", post(admin_api::maintenance))
        .route("/healthz", get(admin_api::health))
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}
