//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::repository::StoreError;
use crate::service::DispatchError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Gone(String),
    DatabaseError(StoreError),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Gone(msg) => (StatusCode::GONE, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Forbidden(msg) => ApiError::Forbidden(msg),
            DispatchError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            DispatchError::BadRequest(msg) => ApiError::BadRequest(msg),
            DispatchError::TraceExpired => ApiError::Gone(err.to_string()),
            DispatchError::Store(err) => ApiError::DatabaseError(err),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: DispatchError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_dispatch_errors_map_to_status_codes() {
        assert_eq!(
            status_of(DispatchError::Forbidden("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(DispatchError::NotFound("Job 1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(DispatchError::BadRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(DispatchError::TraceExpired), StatusCode::GONE);
        assert_eq!(
            status_of(DispatchError::Store(StoreError::InvalidRow("bad".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
