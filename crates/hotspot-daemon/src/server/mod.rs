//! HTTP API for hotspotd.
//!
//! `/health` and the provider webhook are open; everything else under `/api`
//! requires the bearer token from the process config.

mod admin;
mod auth;
mod error;
mod handlers;
mod health;

#[cfg(test)]
mod tests;

pub use auth::ACTOR_HEADER;
pub use error::{ApiError, ApiResult, ErrorBody};
pub use health::{ComponentHealth, HealthReport};

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::app::App;

/// Routes for `app`.
pub fn build_router(app: App) -> Router {
    let protected = Router::new()
        .route("/subscribers", post(handlers::register))
        .route("/subscribers/{id}", get(handlers::status))
        .route("/subscribers/{id}/devices", post(handlers::bind_device))
        .route("/subscribers/{id}/purchases", post(handlers::purchase))
        .route("/subscribers/{id}/debt-payments", post(handlers::pay_debt))
        .route("/transactions/{order_id}/cancel", post(handlers::cancel))
        .route("/admin/subscribers/{id}/approve", post(admin::approve))
        .route("/admin/subscribers/{id}/reject", post(admin::reject))
        .route("/admin/subscribers/{id}/block", post(admin::block))
        .route("/admin/subscribers/{id}/unblock", post(admin::unblock))
        .route("/admin/subscribers/{id}/role", post(admin::set_role))
        .route("/admin/subscribers/{id}/debt", post(admin::add_manual_debt))
        .route("/admin/subscribers/{id}/reconcile", post(admin::reconcile))
        .route("/admin/devices/{id}/revoke", post(admin::revoke_device))
        .route("/admin/tasks/{name}/run", post(admin::run_task))
        .route_layer(axum::middleware::from_fn_with_state(
            app.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/payments/notification",
            post(handlers::payment_notification),
        )
        .nest("/api", protected)
        .with_state(app)
}

/// Serve until `shutdown` flips.
pub async fn serve(
    addr: SocketAddr,
    app: App,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, build_router(app))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
