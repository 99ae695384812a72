//! API error types and helpers.
//!
//! # Purpose
//! Centralizes HTTP error response construction so every failure shares
//! one shape: `{error, message, details?, request_id}`.
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use relay_broker::{PollError, PublishError};
use relay_storage::StorageError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub request_id: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        metrics::counter!("relay_errors_total", "code" => self.body.error.clone()).increment(1);
        (self.status, Json(self.body)).into_response()
    }
}

fn build(status: StatusCode, code: &str, message: &str) -> ApiError {
    ApiError {
        status,
        body: ErrorBody {
            error: code.to_string(),
            message: message.to_string(),
            details: None,
            request_id: Uuid::new_v4().to_string(),
        },
    }
}

pub fn invalid_request(message: &str) -> ApiError {
    build(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
}

pub fn unauthorized(message: &str) -> ApiError {
    build(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

pub fn forbidden(message: &str) -> ApiError {
    build(StatusCode::FORBIDDEN, "FORBIDDEN", message)
}

pub fn topic_not_found(topic: &str) -> ApiError {
    build(
        StatusCode::NOT_FOUND,
        "TOPIC_NOT_FOUND",
        &format!("topic '{topic}' not found"),
    )
}

pub fn not_found(message: &str) -> ApiError {
    build(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn payload_too_large(message: &str) -> ApiError {
    build(StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", message)
}

pub fn conflict(message: &str) -> ApiError {
    build(StatusCode::CONFLICT, "TOPIC_EXISTS", message)
}

pub fn service_unavailable(message: &str) -> ApiError {
    build(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
}

pub fn storage_unavailable(err: &StorageError) -> ApiError {
    tracing::error!(error = %err, "storage backend unavailable");
    build(
        StatusCode::SERVICE_UNAVAILABLE,
        "STORAGE_UNAVAILABLE",
        "storage backend unavailable",
    )
}

pub fn internal(message: &str) -> ApiError {
    build(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
}

impl ApiError {
    pub fn unauthorized(message: &str) -> ApiError {
        unauthorized(message)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::NotFound(what) => not_found(what),
            StorageError::Conflict(what) => conflict(what),
            StorageError::Unavailable(_) => storage_unavailable(&err),
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Invalid(message) => invalid_request(&message),
            PublishError::PayloadTooLarge { actual, limit } => {
                payload_too_large(&format!("payload is {actual} bytes, limit is {limit}"))
            }
            PublishError::NoScope => forbidden("token lacks the required scope"),
            PublishError::NoAccess(topic) => forbidden(&format!("access denied to topic '{topic}'")),
            PublishError::TopicNotFound(topic) => topic_not_found(&topic),
            PublishError::Storage(inner) => storage_unavailable(&inner),
        }
    }
}

impl From<PollError> for ApiError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::AtCapacity => service_unavailable("too many concurrent poll requests"),
            PollError::Storage(inner) => storage_unavailable(&inner),
        }
    }
}
