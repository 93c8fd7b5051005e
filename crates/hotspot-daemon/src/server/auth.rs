//! Bearer token guard for the API routes.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;
use hotspot_crypto::constant_time_str_eq;

use super::error::ApiError;
use crate::app::App;
use crate::error::HotspotError;

/// Header naming the operator behind an admin action, recorded in audit events.
pub const ACTOR_HEADER: &str = "x-actor";

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Reject requests without the configured token. With no token configured
/// the API is closed.
pub async fn require_token(
    State(app): State<App>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = app.admin_token.as_deref() else {
        return Err(HotspotError::Unauthorized.into());
    };
    match bearer(req.headers()) {
        Some(token) if constant_time_str_eq(token, expected) => Ok(next.run(req).await),
        _ => Err(HotspotError::Unauthorized.into()),
    }
}

pub fn actor(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}
