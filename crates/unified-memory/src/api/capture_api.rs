//! Event capture endpoint. Returns as soon as the event is queued.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ApiError, ApiResult};
use crate::classifier::{RawEvent, SourceTag};
use crate::error::MemoryError;
use crate::memory_db::schema::Metadata;
use crate::shared_state::UnifiedAppState;

#[derive(Debug, Deserialize)]
pub struct SubmitEventRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SubmitEventResponse {
    pub event_id: String,
}

impl TryFrom<SubmitEventRequest> for RawEvent {
    type Error = MemoryError;

    fn try_from(req: SubmitEventRequest) -> Result<Self, Self::Error> {
        let source = SourceTag::parse(&req.source)
            .ok_or_else(|| MemoryError::invalid(format!("unknown source '{}'", req.source)))?;
        let mut event = RawEvent::new(source, req.text);
        event.id = req.id.unwrap_or_default();
        event.metadata = req.metadata;
        event.repo = req.repo;
        event.author = req.author;
        if let Some(ts) = req.timestamp {
            event.timestamp = ts;
        }
        Ok(event)
    }
}

/// POST /events
pub async fn submit_event(
    State(state): State<UnifiedAppState>,
    Json(payload): Json<SubmitEventRequest>,
) -> ApiResult<(StatusCode, Json<SubmitEventResponse>)> {
    state.shared_state.counters.inc_total_requests();
    let event = RawEvent::try_from(payload).map_err(ApiError)?;
    let source = event.source;
    let event_id = state.shared_state.submit_event(event).await?;
    debug!(event_id = %event_id, source = %source, "Event queued");
    Ok((StatusCode::ACCEPTED, Json(SubmitEventResponse { event_id })))
}
