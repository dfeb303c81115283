//! Error types for the REST API server

use crate::panel::PanelError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Invalid parameter in request
    InvalidParameter(String),
    /// Invalid date range
    InvalidDateRange(String),
    /// Experiment label not loaded in the session
    ExperimentNotFound(String),
    /// Panel session not found
    SessionNotFound(Uuid),
    /// Too many concurrent sessions
    SessionLimitReached,
    /// The request conflicts with the panel's current state
    Conflict(String),
    /// The experiment service failed
    UpstreamFailed(String),
    /// Internal server error
    InternalError(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            ApiError::InvalidDateRange(msg) => write!(f, "Invalid date range: {}", msg),
            ApiError::ExperimentNotFound(label) => write!(f, "Experiment not found: {}", label),
            ApiError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            ApiError::SessionLimitReached => write!(f, "Session limit reached"),
            ApiError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ApiError::UpstreamFailed(msg) => write!(f, "Upstream failure: {}", msg),
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// HTTP status and error type reported for this error.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::InvalidParameter(_) => (StatusCode::BAD_REQUEST, "InvalidParameter"),
            ApiError::InvalidDateRange(_) => (StatusCode::BAD_REQUEST, "InvalidDateRange"),
            ApiError::ExperimentNotFound(_) => (StatusCode::NOT_FOUND, "ExperimentNotFound"),
            ApiError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SessionNotFound"),
            ApiError::SessionLimitReached => {
                (StatusCode::SERVICE_UNAVAILABLE, "SessionLimitReached")
            }
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            ApiError::UpstreamFailed(_) => (StatusCode::BAD_GATEWAY, "UpstreamFailed"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        let message = match &self {
            ApiError::SessionNotFound(id) => format!("Panel session '{}' not found", id),
            ApiError::SessionLimitReached => {
                "Maximum number of concurrent sessions reached".to_string()
            }
            ApiError::ExperimentNotFound(label) => {
                format!("Experiment '{}' is not loaded in this session", label)
            }
            ApiError::InvalidParameter(msg)
            | ApiError::InvalidDateRange(msg)
            | ApiError::Conflict(msg)
            | ApiError::UpstreamFailed(msg)
            | ApiError::InternalError(msg) => msg.clone(),
        };

        let body = Json(json!({
            "error": error_type,
            "message": message,
        }));

        (status, body).into_response()
    }
}

// Conversions from other error types

impl From<PanelError> for ApiError {
    fn from(err: PanelError) -> Self {
        match err {
            PanelError::InvalidApplication(_) => ApiError::InvalidParameter(err.to_string()),
            PanelError::InvalidDateRange => ApiError::InvalidDateRange(err.to_string()),
            PanelError::UnknownExperiment(label) => ApiError::ExperimentNotFound(label),
            PanelError::Fetch { .. } => ApiError::UpstreamFailed(err.to_string()),
            PanelError::NoExperimentSelected
            | PanelError::Superseded
            | PanelError::InvalidTransition { .. }
            | PanelError::Closed => ApiError::Conflict(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidParameter(format!("JSON error: {}", err))
    }
}

impl From<chrono::ParseError> for ApiError {
    fn from(err: chrono::ParseError) -> Self {
        ApiError::InvalidDateRange(format!("Date parse error: {}", err))
    }
}

impl From<csv::Error> for ApiError {
    fn from(err: csv::Error) -> Self {
        ApiError::InternalError(format!("CSV error: {}", err))
    }
}
