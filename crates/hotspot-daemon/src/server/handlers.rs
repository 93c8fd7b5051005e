//! Portal-facing routes: registration, login binding, payments, status.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use super::auth::actor;
use super::error::ApiResult;
use crate::app::{App, BindResult, SubscriberStatus, SubscriberView};
use crate::payment::{Initiation, Notification};
use crate::storage::Transaction;

/// `POST /api/payments/notification`, the provider webhook.
///
/// Every accepted or duplicate delivery gets `200 {"status":"ok"}`.
pub async fn payment_notification(
    State(app): State<App>,
    Json(notification): Json<Notification>,
) -> ApiResult<Json<Value>> {
    let outcome = app.payments.handle_webhook(&notification).await?;
    tracing::debug!(order_id = %notification.order_id, ?outcome, "Notification handled");
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub phone: String,
    pub full_name: String,
}

pub async fn register(
    State(app): State<App>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<SubscriberView>)> {
    let sub = app.register(&req.phone, &req.full_name).await?;
    Ok((StatusCode::CREATED, Json(SubscriberView::from(&sub))))
}

pub async fn status(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<Json<SubscriberStatus>> {
    Ok(Json(app.status(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct BindRequest {
    pub mac: String,
    pub ip: Option<String>,
    #[serde(default)]
    pub confirm_takeover: bool,
}

/// `POST /api/subscribers/{id}/devices`, called by the portal on login.
pub async fn bind_device(
    State(app): State<App>,
    Path(id): Path<String>,
    Json(req): Json<BindRequest>,
) -> ApiResult<Json<BindResult>> {
    let result = app
        .bind_device(&id, &req.mac, req.ip.as_deref(), req.confirm_takeover)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub package_id: String,
    pub payment_method: String,
}

pub async fn purchase(
    State(app): State<App>,
    Path(id): Path<String>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<(StatusCode, Json<Initiation>)> {
    let initiation = app
        .payments
        .initiate_purchase(&id, &req.package_id, &req.payment_method)
        .await?;
    let code = if initiation.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((code, Json(initiation)))
}

#[derive(Debug, Deserialize)]
pub struct DebtPaymentRequest {
    pub debt_item_id: Option<String>,
    pub payment_method: String,
}

pub async fn pay_debt(
    State(app): State<App>,
    Path(id): Path<String>,
    Json(req): Json<DebtPaymentRequest>,
) -> ApiResult<(StatusCode, Json<Initiation>)> {
    let initiation = app
        .payments
        .initiate_debt_settlement(&id, req.debt_item_id.as_deref(), &req.payment_method)
        .await?;
    Ok((StatusCode::CREATED, Json(initiation)))
}

pub async fn cancel(
    State(app): State<App>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Transaction>> {
    let actor = actor(&headers);
    Ok(Json(app.payments.cancel(&order_id, actor.as_deref()).await?))
}
