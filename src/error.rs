//! API error taxonomy.
//!
//! Domain errors live next to their modules (`UploadError`, `JobError`,
//! `CompressError`); this wrapper maps them onto HTTP responses with a
//! machine-readable code alongside the human-readable message.

use crate::jobs::JobError;
use crate::upload::UploadError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Upload(e) => match e {
                UploadError::TotalTooLarge { .. } | UploadError::BadChunkCount { .. } => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                UploadError::SessionNotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                UploadError::ChunkOutOfOrder { .. } => (StatusCode::CONFLICT, "ORDERING_ERROR"),
                UploadError::ChunkTooLarge { .. } | UploadError::TotalExceeded { .. } => {
                    (StatusCode::PAYLOAD_TOO_LARGE, "OVERSIZE")
                }
                UploadError::UnsupportedType => {
                    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_TYPE")
                }
                UploadError::Incomplete { .. } => (StatusCode::CONFLICT, "INCOMPLETE_UPLOAD"),
                UploadError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            ApiError::Job(e) => match e {
                JobError::JobNotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                JobError::NotReady => (StatusCode::CONFLICT, "NOT_READY"),
                JobError::Failed { code, .. } => {
                    if *code == "capability_unavailable" {
                        (StatusCode::SERVICE_UNAVAILABLE, "CAPABILITY_UNAVAILABLE")
                    } else {
                        (StatusCode::BAD_GATEWAY, "PROCESSING_FAILED")
                    }
                }
                JobError::StreamDelivery(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "STREAM_DELIVERY")
                }
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}
