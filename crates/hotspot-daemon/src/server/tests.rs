#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hotspot_core::Counters;
use hotspot_routeros::MemoryRouter;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::build_router;
use crate::app::{App, AppParts};
use crate::cache::MemoryCache;
use crate::notify::RecordingNotifier;
use crate::payment::MemoryProvider;
use crate::settings::SettingsStore;
use crate::storage::Database;

const TOKEN: &str = "admin-token";
const SERVER_KEY: &str = "server-key";

struct Harness {
    app: App,
    notifier: Arc<RecordingNotifier>,
}

async fn harness() -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let settings = SettingsStore::with_env(db.clone(), None, |key| {
        (key == "PAYMENT_SERVER_KEY").then(|| SERVER_KEY.to_string())
    });
    let notifier = Arc::new(RecordingNotifier::new());
    let app = App::new(AppParts {
        db,
        settings,
        cache: Arc::new(MemoryCache::default()),
        router: Arc::new(MemoryRouter::memory()),
        provider: Arc::new(MemoryProvider::new()),
        notifier: notifier.clone(),
        counters: Counters::new(),
        production: true,
        admin_token: Some(TOKEN.to_string()),
    });
    Harness { app, notifier }
}

async fn send(app: &App, method: &str, uri: &str, body: Option<Value>, token: bool) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if token {
        builder = builder.header("authorization", format!("Bearer {TOKEN}"));
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = build_router(app.clone())
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_components() {
    let h = harness().await;
    let (status, body) = send(&h.app, "GET", "/health", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "serving");
    assert_eq!(body["components"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn api_requires_bearer_token() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/subscribers",
        Some(json!({ "phone": "081234567890", "full_name": "Budi" })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert_eq!(body["status_code"], 401);
}

#[tokio::test]
async fn register_then_read_status() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/subscribers",
        Some(json!({ "phone": "0812-3456-7890", "full_name": "Budi" })),
        true,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["phone"], "+6281234567890");
    assert_eq!(body["approval"], "PENDING");
    assert!(body.get("hotspot_password").is_none());

    let id = body["id"].as_str().unwrap();
    let (status, body) = send(&h.app, "GET", &format!("/api/subscribers/{id}"), None, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["debt"]["total_mb"], 0.0);
    assert!(body["decision"]["state"].is_string());
}

#[tokio::test]
async fn duplicate_registration_is_a_validation_error() {
    let h = harness().await;
    let req = json!({ "phone": "081234567890", "full_name": "Budi" });
    send(&h.app, "POST", "/api/subscribers", Some(req.clone()), true).await;
    let (status, body) = send(&h.app, "POST", "/api/subscribers", Some(req), true).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["message"].as_str().unwrap().contains("already registered"));
}

#[tokio::test]
async fn approve_sends_credentials() {
    let h = harness().await;
    let sub = h.app.register("081234567890", "Budi").await.unwrap();

    let (status, body) = send(
        &h.app,
        "POST",
        &format!("/api/admin/subscribers/{}/approve", sub.id),
        None,
        true,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscriber"]["approval"], "APPROVED");

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+6281234567890");
    assert!(sent[0].1.contains("081234567890"));

    let (status, body) = send(
        &h.app,
        "POST",
        &format!("/api/admin/subscribers/{}/approve", sub.id),
        None,
        true,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn webhook_with_bad_signature_is_forbidden() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/payments/notification",
        Some(json!({
            "order_id": "HS-1",
            "status_code": "200",
            "gross_amount": "10000.00",
            "transaction_status": "settlement",
            "signature_key": "00",
        })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "PROVIDER_SIGNATURE_INVALID");
    assert_eq!(h.app.counters.get("payment.webhook.signature_invalid"), 1);
}

#[tokio::test]
async fn webhook_for_unknown_order_is_acknowledged() {
    let h = harness().await;
    let signature =
        hotspot_crypto::provider_signature("HS-UNKNOWN", "200", "10000.00", SERVER_KEY);
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/payments/notification",
        Some(json!({
            "order_id": "HS-UNKNOWN",
            "status_code": "200",
            "gross_amount": "10000.00",
            "transaction_status": "settlement",
            "transaction_id": "t-1",
            "signature_key": signature,
        })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
    assert_eq!(h.app.counters.get("payment.notification.unknown_order"), 1);
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let h = harness().await;
    let (status, body) = send(&h.app, "POST", "/api/admin/tasks/nope/run", None, true).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn run_task_returns_report() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/admin/tasks/retention_cleanup/run",
        None,
        true,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"], "retention_cleanup");
    assert_eq!(body["report"]["transaction_events"], 0);
}
