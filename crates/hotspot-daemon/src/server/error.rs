//! API error envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::HotspotError;

/// Body of every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Handler error; renders a [`HotspotError`] as [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError(pub HotspotError);

impl<E: Into<HotspotError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.0.status_code();
        if status_code >= 500 {
            tracing::error!(error = %self.0, code = self.0.code(), "Request failed");
        }
        let body = ErrorBody {
            message: self.0.to_string(),
            code: self.0.code(),
            status_code,
            details: self.0.details(),
        };
        let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
