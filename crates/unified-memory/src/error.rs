//! Error kinds shared by the store, classifier and coordinator.

use std::time::Duration;
use thiserror::Error;

/// Coarse category of a [`MemoryError`], used for transport mapping and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Denied,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Denied => "denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// An upsert tried to change `type`, `repo` or `author` of an existing node.
    #[error("Immutable field '{field}' cannot change on node {id}")]
    ImmutableFieldViolation { id: String, field: &'static str },

    /// Lease contention. Expected during normal operation.
    #[error("Lease on '{resource_key}' denied, held by {held_by}")]
    Denied { resource_key: String, held_by: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::InvalidInput(_) => ErrorKind::InvalidInput,
            MemoryError::NotFound(_) => ErrorKind::NotFound,
            MemoryError::Conflict(_) | MemoryError::ImmutableFieldViolation { .. } => ErrorKind::Conflict,
            MemoryError::Denied { .. } => ErrorKind::Denied,
            MemoryError::Timeout(_) => ErrorKind::Timeout,
            MemoryError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        MemoryError::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        MemoryError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MemoryError::Internal(msg.into())
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Internal(format!("sqlite: {}", e))
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(e: r2d2::Error) -> Self {
        MemoryError::Internal(format!("Failed to get connection from pool: {}", e))
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Internal(format!("json: {}", e))
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(e: bincode::Error) -> Self {
        MemoryError::Internal(format!("bincode: {}", e))
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(e: tokio::task::JoinError) -> Self {
        MemoryError::Internal(format!("Blocking task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
