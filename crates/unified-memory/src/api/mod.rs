//! HTTP/JSON binding for capture, query and coordination.

pub mod admin_api;
pub mod capture_api;
pub mod coordination_api;
pub mod node_api;
pub mod search_api;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::{ErrorKind, MemoryError};

/// Domain error carried out of a handler.
#[derive(Debug)]
pub struct ApiError(pub MemoryError);

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        ApiError(e)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError(MemoryError::from(e))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Denied => StatusCode::LOCKED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if kind == ErrorKind::Internal {
            error!(error = %self.0, "Request failed");
        }
        let mut body = json!({ "error": kind.as_str(), "message": self.0.to_string() });
        if let MemoryError::Denied { resource_key, held_by } = &self.0 {
            body["resource_key"] = json!(resource_key);
            body["held_by"] = json!(held_by);
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run a synchronous store call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_map_to_status() {
        assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Denied), StatusCode::LOCKED);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);

        let response = ApiError(MemoryError::Denied { resource_key: "file.py".into(), held_by: "a".into() }).into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        let response = ApiError(MemoryError::ImmutableFieldViolation { id: "n".into(), field: "type" }).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
