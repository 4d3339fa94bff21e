//! HTTP rendering of core errors

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use certsync_core::Error;
use serde::Serialize;
use tracing::{error, warn};

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Short, non-revealing reason
    pub error: &'static str,
}

/// A core error on its way to the client
///
/// Authentication failures collapse into one undifferentiated 401; anything
/// unexpected is logged here and surfaces as a bare 500.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status code and body for this error
    pub fn parts(&self) -> (StatusCode, ErrorBody) {
        match &self.0 {
            Error::SignatureMismatch => (StatusCode::UNAUTHORIZED, ErrorBody { error: "unauthorized" }),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, ErrorBody { error: "not found" }),
            Error::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody { error: "rate limited" },
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { error: "internal error" },
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        if status.is_server_error() {
            error!("Agent request failed: {}", self.0);
        } else if status == StatusCode::NOT_FOUND {
            warn!("Agent request for unknown resource: {}", self.0);
        }
        (status, Json(body)).into_response()
    }
}
