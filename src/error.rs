use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::models::operation::OperationError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;

/// Errors surfaced by API handlers, classified by HTTP status.
///
/// Bodies are always `{"error": <message>}`; the worker never produces these
/// (its outcomes are recorded on the job row instead).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("job cannot be canceled (already processing or completed)")]
    NotCancellable,

    /// Multipart read failures keep the status axum derived for them, so an
    /// oversized body surfaces as 413 rather than a generic 400.
    #[error("{message}")]
    Upload { status: StatusCode, message: String },

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        ApiError::InvalidInput(err.to_string())
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        ApiError::Upload {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) | ApiError::NotCancellable => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upload { status, .. } => *status,
            ApiError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(_) | ApiError::Queue(_) | ApiError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
