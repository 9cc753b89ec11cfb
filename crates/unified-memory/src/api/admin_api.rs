//! Health, statistics and runtime tuning.
use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::Ordering;

use super::{blocking, ApiResult};
use crate::memory_db::schema::StoreStats;
use crate::retrieval::scoring::HybridWeights;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub store: StoreStats,
    pub capture: Value,
    pub total_requests: usize,
    pub searches: usize,
    /// Searches that ran without a query vector because embedding failed.
    pub query_embeddings_failed: usize,
    pub weights: HybridWeights,
    pub fallback_enabled: bool,
    pub embeddings_enabled: bool,
}

/// GET /healthz
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /stats
pub async fn stats(State(state): State<UnifiedAppState>) -> ApiResult<Json<StatsResponse>> {
    let shared = &state.shared_state;
    let store = shared.store.clone();
    let store_stats = blocking(move || store.stats()).await?;
    Ok(Json(StatsResponse {
        store: store_stats,
        capture: shared.capture.counters().snapshot(),
        total_requests: shared.counters.total_requests.load(Ordering::Relaxed),
        searches: shared.counters.searches.load(Ordering::Relaxed),
        query_embeddings_failed: shared.counters.query_embeddings_failed.load(Ordering::Relaxed),
        weights: **shared.weights.load(),
        fallback_enabled: shared.classifier.has_fallback(),
        embeddings_enabled: shared.embeddings.is_some(),
    }))
}

/// PUT /admin/weights
pub async fn set_weights(
    State(state): State<UnifiedAppState>,
    Json(weights): Json<HybridWeights>,
) -> ApiResult<Json<HybridWeights>> {
    state.shared_state.set_weights(weights)?;
    Ok(Json(weights))
}

/// POST /admin/maintenance
pub async fn maintenance(State(state): State<UnifiedAppState>) -> ApiResult<Json<StoreStats>> {
    let store = state.shared_state.store.clone();
    let stats = blocking(move || {
        store.run_maintenance()?;
        store.stats()
    })
    .await?;
    Ok(Json(stats))
}
