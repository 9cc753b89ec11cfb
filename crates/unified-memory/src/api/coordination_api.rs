//! Session registry, lease and handoff endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{blocking, ApiResult};
use crate::coordinator::HandoffReceipt;
use crate::memory_db::schema::{Lease, LeaseMode, Session};
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub instance_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub workspace_path: String,
}

#[derive(Debug, Deserialize)]
pub struct AcquireLeaseRequest {
    pub instance_id: String,
    pub resource_key: String,
    pub mode: LeaseMode,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLeaseRequest {
    pub instance_id: String,
    pub resource_key: String,
}

#[derive(Debug, Deserialize)]
pub struct LeaseQuery {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct HandoffRequest {
    pub from_instance: String,
    pub to_instance: String,
    pub context_node_id: String,
    #[serde(default)]
    pub leases: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// POST /sessions
pub async fn register(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let coordinator = state.shared_state.coordinator.clone();
    let session =
        blocking(move || coordinator.register(&payload.instance_id, &payload.role, &payload.workspace_path)).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<UnifiedAppState>) -> ApiResult<Json<Vec<Session>>> {
    let coordinator = state.shared_state.coordinator.clone();
    Ok(Json(blocking(move || coordinator.list_sessions()).await?))
}

/// GET /sessions/:id
pub async fn get_session(State(state): State<UnifiedAppState>, Path(id): Path<String>) -> ApiResult<Json<Session>> {
    let coordinator = state.shared_state.coordinator.clone();
    Ok(Json(blocking(move || coordinator.session(&id)).await?))
}

/// POST /sessions/:id/heartbeat. `ok` is false when the session is unknown.
pub async fn heartbeat(State(state): State<UnifiedAppState>, Path(id): Path<String>) -> ApiResult<Json<AckResponse>> {
    let coordinator = state.shared_state.coordinator.clone();
    let ok = blocking(move || coordinator.heartbeat(&id)).await?;
    Ok(Json(AckResponse { ok }))
}

/// DELETE /sessions/:id
pub async fn deregister(State(state): State<UnifiedAppState>, Path(id): Path<String>) -> ApiResult<Json<AckResponse>> {
    let coordinator = state.shared_state.coordinator.clone();
    let ok = blocking(move || coordinator.deregister(&id)).await?;
    Ok(Json(AckResponse { ok }))
}

/// POST /leases. Contention answers 423 with `held_by`.
pub async fn acquire_lease(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<AcquireLeaseRequest>,
) -> ApiResult<Json<Lease>> {
    let coordinator = state.shared_state.coordinator.clone();
    let lease =
        blocking(move || coordinator.acquire_lease(&payload.instance_id, &payload.resource_key, payload.mode)).await?;
    Ok(Json(lease))
}

/// DELETE /leases
pub async fn release_lease(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<ReleaseLeaseRequest>,
) -> ApiResult<Json<AckResponse>> {
    let coordinator = state.shared_state.coordinator.clone();
    let ok = blocking(move || coordinator.release_lease(&payload.instance_id, &payload.resource_key)).await?;
    Ok(Json(AckResponse { ok }))
}

/// GET /leases?key=src/lib.rs
pub async fn leases_for(
    State(state): State<UnifiedAppState>,
    Query(query): Query<LeaseQuery>,
) -> ApiResult<Json<Vec<Lease>>> {
    let coordinator = state.shared_state.coordinator.clone();
    Ok(Json(blocking(move || coordinator.leases_for(&query.key)).await?))
}

/// POST /handoffs
pub async fn handoff(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<HandoffRequest>,
) -> ApiResult<Json<HandoffReceipt>> {
    let coordinator = state.shared_state.coordinator.clone();
    let receipt = blocking(move || {
        coordinator.handoff(&payload.from_instance, &payload.to_instance, &payload.context_node_id, &payload.leases)
    })
    .await?;
    Ok(Json(receipt))
}
