//! API data models

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorKind, ServiceError};

/// Header carrying the per-request correlation id
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Correlation id stored in request extensions by the middleware
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Query parameters accepted by the transcription endpoints
#[derive(Debug, Default, Deserialize)]
pub struct TranscribeQuery {
    pub model_size: Option<String>,
    pub language: Option<String>,
    pub temperature: Option<f64>,
    pub task: Option<String>,
}

/// Error body returned for every failed request
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
    pub details: Value,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

/// HTTP status for a service error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidAudioFormat => StatusCode::BAD_REQUEST,
        ErrorKind::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::AudioProcessingError => StatusCode::BAD_REQUEST,
        ErrorKind::ModelLoadFailed
        | ErrorKind::TranscriptionFailed
        | ErrorKind::FileSystemError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A failed request, rendered as [`ErrorResponse`]
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        error_type: &str,
        message: impl Into<String>,
        correlation_id: &CorrelationId,
    ) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error_type: error_type.to_string(),
                message: message.into(),
                details: json!({}),
                correlation_id: correlation_id.0.clone(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn service(err: &ServiceError, correlation_id: &CorrelationId) -> Self {
        let kind = err.kind();
        let mut error = Self::new(status_for(kind), kind.as_str(), err.to_string(), correlation_id);
        error.body.details = err.details();
        error.body.details["category"] = json!(kind.category());
        error
    }

    pub fn validation(message: impl Into<String>, correlation_id: &CorrelationId) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message, correlation_id)
    }

    pub fn not_found(message: impl Into<String>, correlation_id: &CorrelationId) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message, correlation_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
