//! API error mapping.
//!
//! Translates domain errors into HTTP status codes and a stable JSON body:
//!
//! ```text
//! ValidationError          → 422 Unprocessable Entity
//! CapacityExceeded         → 409 Conflict        (backpressure, retry later)
//! NotFound                 → 404 Not Found
//! Print                    → 503 Service Unavailable
//! everything else          → 500 Internal Server Error
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use kassa_buffer::BufferError;
use kassa_sync::SyncError;

/// JSON error body returned to the caller.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

/// HTTP-mapped error wrapper.
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ErrorBody {
                error: message.into(),
                code,
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match &err {
            SyncError::Validation(e) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_failed", e.to_string())
            }

            SyncError::Buffer(BufferError::CapacityExceeded { active, capacity }) => ApiError::new(
                StatusCode::CONFLICT,
                "buffer_full",
                format!("buffer full: {active}/{capacity} active receipts; retry after the sync daemon drains"),
            ),

            SyncError::Buffer(BufferError::NotFound { .. }) => ApiError::not_found(err.to_string()),

            SyncError::Print(e) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "printer_unavailable", e.clone())
            }

            other => {
                error!(error = %other, "Unhandled internal error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error",
                )
            }
        }
    }
}

impl From<BufferError> for ApiError {
    fn from(err: BufferError) -> Self {
        ApiError::from(SyncError::Buffer(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kassa_core::ValidationError;

    #[test]
    fn test_validation_maps_to_422() {
        let err = ApiError::from(SyncError::Validation(ValidationError::Required {
            field: "pos_id".into(),
        }));
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.body.code, "validation_failed");
    }

    #[test]
    fn test_capacity_maps_to_409() {
        let err = ApiError::from(BufferError::CapacityExceeded {
            active: 200,
            capacity: 200,
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.body.code, "buffer_full");
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let err = ApiError::from(BufferError::NotFound {
            entity: "Receipt".into(),
            id: "x".into(),
        });
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
