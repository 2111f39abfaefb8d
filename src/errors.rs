use crate::storage::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures of the ingest and reassembly pipeline.
///
/// Sequencing and storage failures are returned synchronously to the
/// uploading client; downstream (transcription/analysis) failures never
/// appear here, they are recorded on the session instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("session `{0}` belongs to another user")]
    Unauthorized(String),
    #[error("chunk {index} of session `{session_id}` arrived out of sequence: {reason}")]
    SequenceError {
        session_id: String,
        index: u32,
        reason: String,
    },
    #[error("session `{0}` was aborted; start a new session")]
    SessionAborted(String),
    #[error("chunk upload failed: {0}")]
    UploadFailed(String),
    #[error("session `{session_id}` is missing chunks {missing:?}")]
    IncompleteSequence {
        session_id: String,
        missing: Vec<u32>,
    },
    #[error("reassembly failed: {0}")]
    ReassemblyFailed(String),
    #[error("session `{0}` not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type IngestResult<T> = Result<T, IngestError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            IngestError::SequenceError { .. } => StatusCode::CONFLICT,
            IngestError::SessionAborted(_) => StatusCode::GONE,
            IngestError::UploadFailed(_) => StatusCode::BAD_GATEWAY,
            IngestError::IncompleteSequence { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::BadRequest(_) => StatusCode::BAD_REQUEST,
            IngestError::ReassemblyFailed(_)
            | IngestError::Storage(_)
            | IngestError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_errors_map_to_distinct_statuses() {
        let cases = [
            (IngestError::Unauthorized("s".into()), StatusCode::UNAUTHORIZED),
            (
                IngestError::SequenceError {
                    session_id: "s".into(),
                    index: 1,
                    reason: "no multipart upload".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                IngestError::UploadFailed("boom".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                IngestError::IncompleteSequence {
                    session_id: "s".into(),
                    missing: vec![2],
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }
}
