//! Search endpoint: keyword, vector and centrality fused into one ranking.
//!
//! The query is embedded through the configured provider when the caller
//! did not supply `query_embedding`; without a provider the vector axis
//! simply scores zero.

use axum::{extract::State, Json};
use serde::Serialize;
use tracing::info;

use super::ApiResult;
use crate::retrieval::hybrid::{SearchHit, SearchRequest};
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total: usize,
}

/// POST /search
pub async fn search(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    state.shared_state.counters.inc_total_requests();
    info!(
        query = %crate::utils::TextUtils::truncate_with_ellipsis(&payload.query, 80),
        limit = ?payload.limit,
        "Search request"
    );
    let results = state.shared_state.search(payload).await?;
    Ok(Json(SearchResponse { total: results.len(), results }))
}
