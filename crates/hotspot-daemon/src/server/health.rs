//! `GET /health`: database and router reachability.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::app::App;

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub serving: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub components: Vec<ComponentHealth>,
}

async fn check_db(app: &App) -> ComponentHealth {
    let (serving, message) = match app.db.list_active_packages().await {
        Ok(_) => (true, "SQLite database operational".to_string()),
        Err(e) => (false, format!("Database query failed: {e}")),
    };
    ComponentHealth {
        name: "database",
        serving,
        message,
    }
}

async fn check_router(app: &App) -> ComponentHealth {
    let (serving, message) = match app.reconciler.router().health().await {
        Ok(()) => (true, "Router reachable".to_string()),
        Err(e) => (false, e.to_string()),
    };
    ComponentHealth {
        name: "router",
        serving,
        message,
    }
}

/// The database decides the status code; an unreachable router only degrades.
pub async fn health(State(app): State<App>) -> (StatusCode, Json<HealthReport>) {
    let db = check_db(&app).await;
    let router = check_router(&app).await;

    let (code, status) = match (db.serving, router.serving) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "not_serving"),
        (true, false) => (StatusCode::OK, "degraded"),
        (true, true) => (StatusCode::OK, "serving"),
    };
    (
        code,
        Json(HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            components: vec![db, router],
        }),
    )
}
