//! Error taxonomy and the mapping of request-level errors onto HTTP.
//!
//! Processing failures (extraction, engine) never reach [`ApiError`]: they are
//! recorded on the Job, which is returned as a normal response with
//! `status: "failed"`. Only request-level problems become error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::job::{JobStatus, LifecycleError};

/// Upload rejected before any Job exists.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No file uploaded")]
    MissingFile,

    #[error("Uploaded file '{0}' is empty")]
    Empty(String),

    #[error("File type {content_type} not allowed. Allowed types: {allowed:?}")]
    UnsupportedType {
        content_type: String,
        allowed: Vec<&'static str>,
    },

    #[error("File is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    /// The request body was cut off before the file could be measured.
    #[error("Upload exceeds the {limit} byte limit")]
    BodyTooLarge { limit: usize },

    #[error("Invalid query: {0}")]
    Query(String),
}

/// Failure turning an upload into pages.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt document: {0}")]
    CorruptDocument(String),

    #[error("PDF rasterization failed: {0}")]
    Rasterizer(String),
}

/// Failure reported by an OCR engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine cannot be invoked at all (down, missing weights).
    #[error("OCR engine unavailable: {0}")]
    Unavailable(String),

    /// The engine ran but could not process this page.
    #[error("OCR engine failed on page: {0}")]
    Page(String),
}

/// HistoryStore failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Result serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Database lock poisoned")]
    Poisoned,

    #[error("Database task failed: {0}")]
    Task(String),
}

/// Any error a handler can return.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Malformed upload: {0}")]
    Multipart(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(
                ValidationError::TooLarge { .. } | ValidationError::BodyTooLarge { .. },
            ) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Validation(_) | ApiError::Multipart(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(_) | ApiError::Lifecycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = serde_json::json!({ "detail": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let too_large = ApiError::from(ValidationError::TooLarge { size: 10, limit: 5 });
        assert_eq!(too_large.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let cut_off = ApiError::from(ValidationError::BodyTooLarge { limit: 5 });
        assert_eq!(cut_off.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let not_found = ApiError::from(StoreError::NotFound("abc".to_string()));
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let missing = ApiError::from(ValidationError::MissingFile);
        assert_eq!(missing.status_code(), StatusCode::BAD_REQUEST);

        let poisoned = ApiError::from(StoreError::Poisoned);
        assert_eq!(poisoned.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
