//! Error types for the workbench server

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkbenchError {
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Invalid request: {0}")]
    ValidationError(String),

    #[error("Snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("USB {0} not found")]
    UsbNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    ConfigIni(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for WorkbenchError {
    fn from(e: serde_json::Error) -> Self {
        WorkbenchError::Internal(e.to_string())
    }
}

impl From<JsonRejection> for WorkbenchError {
    fn from(rejection: JsonRejection) -> Self {
        WorkbenchError::ValidationError(rejection.body_text())
    }
}

impl From<QueryRejection> for WorkbenchError {
    fn from(rejection: QueryRejection) -> Self {
        WorkbenchError::ValidationError(rejection.body_text())
    }
}

impl From<PathRejection> for WorkbenchError {
    fn from(rejection: PathRejection) -> Self {
        WorkbenchError::ValidationError(rejection.body_text())
    }
}

impl IntoResponse for WorkbenchError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WorkbenchError::InvalidPatch(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            WorkbenchError::ValidationError(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            WorkbenchError::SnapshotNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            WorkbenchError::UsbNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            WorkbenchError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            WorkbenchError::ConfigIni(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            WorkbenchError::Storage(_) | WorkbenchError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let response = WorkbenchError::SnapshotNotFound("abc".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn rejections_are_validation_errors() {
        let rejection = JsonRejection::from(axum::extract::rejection::MissingJsonContentType::default());
        let err = WorkbenchError::from(rejection);
        assert!(matches!(err, WorkbenchError::ValidationError(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn storage_errors_hide_details() {
        let err = WorkbenchError::from(std::io::Error::other("disk on fire"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
