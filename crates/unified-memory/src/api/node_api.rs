//! Node and edge endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{blocking, ApiResult};
use crate::memory_db::schema::{Edge, Node};
use crate::memory_db::UpsertOutcome;
use crate::retrieval::graph_walk::{Neighbor, NeighborQuery};
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize)]
pub struct UpsertNodeRequest {
    #[serde(flatten)]
    pub node: Node,
    /// Compare-and-set on the stored version; 0 means "must not exist".
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub from_id: String,
    pub to_id: String,
    pub relation: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UnlinkRequest {
    pub from_id: String,
    pub to_id: String,
    pub relation: String,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub removed: bool,
}

/// PUT /nodes
pub async fn upsert_node(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<UpsertNodeRequest>,
) -> ApiResult<(StatusCode, Json<UpsertOutcome>)> {
    let store = state.shared_state.store.clone();
    let outcome = blocking(move || match payload.expected_version {
        Some(expected) => store.upsert_versioned(payload.node, expected),
        None => store.upsert(payload.node),
    })
    .await?;
    let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

/// GET /nodes/:id
pub async fn get_node(State(state): State<UnifiedAppState>, Path(id): Path<String>) -> ApiResult<Json<Node>> {
    let store = state.shared_state.store.clone();
    Ok(Json(blocking(move || store.get_node(&id)).await?))
}

/// DELETE /nodes/:id
pub async fn delete_node(
    State(state): State<UnifiedAppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RemovedResponse>> {
    let store = state.shared_state.store.clone();
    let node_id = id.clone();
    let removed = blocking(move || store.delete_node(&node_id)).await?;
    if removed {
        info!(node_id = %id, "Node deleted");
    }
    Ok(Json(RemovedResponse { removed }))
}

/// GET /nodes/:id/edges
pub async fn node_edges(State(state): State<UnifiedAppState>, Path(id): Path<String>) -> ApiResult<Json<Vec<Edge>>> {
    let store = state.shared_state.store.clone();
    Ok(Json(blocking(move || store.edges_of(&id)).await?))
}

/// GET /nodes/:id/neighbors?depth=2&relation=touches&direction=outgoing
pub async fn neighbors(
    State(state): State<UnifiedAppState>,
    Path(id): Path<String>,
    Query(query): Query<NeighborQuery>,
) -> ApiResult<Json<Vec<Neighbor>>> {
    let store = state.shared_state.store.clone();
    Ok(Json(blocking(move || store.neighbors(&id, &query)).await?))
}

/// POST /edges
pub async fn link(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<LinkRequest>,
) -> ApiResult<Json<Edge>> {
    let store = state.shared_state.store.clone();
    let edge = blocking(move || store.link(&payload.from_id, &payload.to_id, &payload.relation, payload.metadata)).await?;
    Ok(Json(edge))
}

/// DELETE /edges
pub async fn unlink(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<UnlinkRequest>,
) -> ApiResult<Json<RemovedResponse>> {
    let store = state.shared_state.store.clone();
    let removed = blocking(move || store.unlink(&payload.from_id, &payload.to_id, &payload.relation)).await?;
    Ok(Json(RemovedResponse { removed }))
}
