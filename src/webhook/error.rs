use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Request-level failures of a webhook route
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookError {
    NotFound,
    Inactive,
    MethodNotAllowed,
    Unauthorized(String),
    PayloadTooLarge,
    BadRequest(String),
    RecordFailed,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            WebhookError::NotFound => (StatusCode::NOT_FOUND, "route not found".to_string()),
            WebhookError::Inactive => (StatusCode::BAD_REQUEST, "endpoint is inactive".to_string()),
            WebhookError::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
            }
            WebhookError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            WebhookError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload too large".to_string())
            }
            WebhookError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            WebhookError::RecordFailed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to record event".to_string(),
            ),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// Response sent once an event was recorded.
pub fn success() -> Response {
    (StatusCode::OK, "success").into_response()
}
