//! Admin routes. Every action takes the operator from the `x-actor` header.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::NaiveDate;
use hotspot_core::Role;
use serde::Deserialize;
use serde_json::{Value, json};

use super::auth::actor;
use super::error::ApiResult;
use crate::app::{App, Approved, SubscriberView};
use crate::error::HotspotError;
use crate::ledger::RoleChange;
use crate::reconcile::ReconcileReport;
use crate::scheduler::Task;
use crate::storage::Device;

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    pub router_profile: Option<String>,
    pub router_server: Option<String>,
}

pub async fn approve(
    State(app): State<App>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ApproveRequest>>,
) -> ApiResult<Json<Approved>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let approved = app
        .approve(
            &id,
            req.router_profile.as_deref(),
            req.router_server.as_deref(),
            actor(&headers).as_deref(),
        )
        .await?;
    Ok(Json(approved))
}

pub async fn reject(
    State(app): State<App>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    app.reject(&id, actor(&headers).as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub reason: String,
}

pub async fn block(
    State(app): State<App>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<BlockRequest>,
) -> ApiResult<Json<SubscriberView>> {
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(HotspotError::Validation("reason is required".into()).into());
    }
    let sub = app.block(&id, reason, actor(&headers).as_deref()).await?;
    Ok(Json(SubscriberView::from(&sub)))
}

pub async fn unblock(
    State(app): State<App>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<SubscriberView>> {
    let sub = app.unblock(&id, actor(&headers).as_deref()).await?;
    Ok(Json(SubscriberView::from(&sub)))
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: String,
}

#[derive(Debug, serde::Serialize)]
pub struct RoleResponse {
    pub subscriber: SubscriberView,
    pub cleared_manual_mb: f64,
    /// Auto debt left in place for review after a promotion.
    pub auto_debt_mb: Option<f64>,
}

pub async fn set_role(
    State(app): State<App>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RoleRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let role: Role = req.role.parse().map_err(HotspotError::from)?;
    let RoleChange {
        subscriber,
        auto_debt_mb,
        cleared_manual_mb,
    } = app.set_role(&id, role, actor(&headers).as_deref()).await?;
    Ok(Json(RoleResponse {
        subscriber: SubscriberView::from(&subscriber),
        cleared_manual_mb,
        auto_debt_mb,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ManualDebtRequest {
    pub amount_mb: f64,
    pub debt_date: Option<NaiveDate>,
    pub note: Option<String>,
}

pub async fn add_manual_debt(
    State(app): State<App>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ManualDebtRequest>,
) -> ApiResult<Json<SubscriberView>> {
    let sub = app
        .add_manual_debt(
            &id,
            req.amount_mb,
            req.debt_date,
            req.note.as_deref(),
            actor(&headers).as_deref(),
        )
        .await?;
    Ok(Json(SubscriberView::from(&sub)))
}

pub async fn revoke_device(
    State(app): State<App>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Device>> {
    Ok(Json(
        app.revoke_device(&device_id, actor(&headers).as_deref())
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    #[serde(default)]
    pub force_profile: bool,
}

pub async fn reconcile(
    State(app): State<App>,
    Path(id): Path<String>,
    body: Option<Json<ReconcileRequest>>,
) -> ApiResult<Json<ReconcileReport>> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(app.reconcile(&id, req.force_profile).await?))
}

/// Run one scheduler task now, under the same lock as the loop.
pub async fn run_task(
    State(app): State<App>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = Task::from_name(&name)
        .ok_or_else(|| HotspotError::NotFound(format!("Task {name}")))?;
    let report = app.scheduler.run_task(task).await?;
    Ok(Json(match report {
        Some(report) => json!({ "task": task.name(), "report": report }),
        None => json!({ "task": task.name(), "skipped": true }),
    }))
}
