//! Tests for the payment provider client.

#![allow(clippy::unwrap_used)]

use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::provider::{
    ChargeRequest, HttpProvider, MemoryProvider, PaymentProvider, ProviderConfig, ProviderError,
};

fn config(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        base_url: base_url.into(),
        server_key: "SB-Mid-server-test".into(),
    }
}

fn charge_request(method: &str) -> ChargeRequest {
    ChargeRequest {
        order_id: "BD-LPSR-ABCDEF123456".into(),
        gross_amount: 25_000,
        payment_method: method.into(),
        item_name: "Paket 1GB".into(),
        customer_name: "Budi".into(),
        customer_phone: "081234567890".into(),
        expiry_minutes: 60,
    }
}

// =============================================================================
// Client construction
// =============================================================================

#[test]
fn empty_server_key_is_config_error() {
    let err = HttpProvider::new(&ProviderConfig {
        base_url: "https://api.sandbox.midtrans.com".into(),
        server_key: String::new(),
    })
    .unwrap_err();
    assert!(matches!(err, ProviderError::Config(_)));
}

#[test]
fn trailing_slash_stripped() {
    let client = HttpProvider::new(&config("https://api.sandbox.midtrans.com/")).unwrap();
    assert_eq!(
        client.api_url("/charge"),
        "https://api.sandbox.midtrans.com/v2/charge"
    );
}

#[test]
fn charge_body_per_method() {
    let va = charge_request("bca_va").body();
    assert_eq!(va["payment_type"], json!("bank_transfer"));
    assert_eq!(va["bank_transfer"]["bank"], json!("bca"));
    assert_eq!(va["transaction_details"]["gross_amount"], json!(25_000));

    let qris = charge_request("qris").body();
    assert_eq!(qris["payment_type"], json!("qris"));
    assert!(qris.get("bank_transfer").is_none());
}

// =============================================================================
// HTTP
// =============================================================================

#[tokio::test]
async fn charge_returns_payment_details() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charge"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({
            "payment_type": "bank_transfer",
            "transaction_details": {"order_id": "BD-LPSR-ABCDEF123456"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status_code": "201",
            "transaction_id": "tx-1",
            "order_id": "BD-LPSR-ABCDEF123456",
            "gross_amount": "25000.00",
            "transaction_status": "pending",
            "va_numbers": [{"bank": "bca", "va_number": "99887766"}],
            "expiry_time": "2025-01-10 11:00:00"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpProvider::new(&config(&server.uri())).unwrap();
    let n = client.charge(&charge_request("bca_va")).await.unwrap();
    assert_eq!(n.transaction_id.as_deref(), Some("tx-1"));
    assert_eq!(n.payment_details().unwrap()["va_number"], json!("99887766"));
    assert!(n.expiry_at().is_some());
}

#[tokio::test]
async fn charge_rejected_in_body_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status_code": "406",
            "status_message": "The request could not be completed due to a conflict",
            "order_id": "BD-LPSR-ABCDEF123456"
        })))
        .mount(&server)
        .await;

    let client = HttpProvider::new(&config(&server.uri())).unwrap();
    let err = client.charge(&charge_request("qris")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 406, .. }));
}

#[tokio::test]
async fn status_not_found_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/BD-LPSR-000000000000/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status_code": "404",
            "status_message": "Transaction doesn't exist."
        })))
        .mount(&server)
        .await;

    let client = HttpProvider::new(&config(&server.uri())).unwrap();
    assert!(client.status("BD-LPSR-000000000000").await.unwrap().is_none());
}

#[tokio::test]
async fn status_settlement() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/BD-LPSR-ABCDEF123456/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status_code": "200",
            "transaction_id": "tx-1",
            "order_id": "BD-LPSR-ABCDEF123456",
            "gross_amount": "25000.00",
            "transaction_status": "settlement"
        })))
        .mount(&server)
        .await;

    let client = HttpProvider::new(&config(&server.uri())).unwrap();
    let n = client.status("BD-LPSR-ABCDEF123456").await.unwrap().unwrap();
    assert_eq!(
        n.mapped_status(),
        Some(crate::storage::TransactionStatus::Success)
    );
}

#[tokio::test]
async fn server_error_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/BD-LPSR-ABCDEF123456/cancel"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = HttpProvider::new(&config(&server.uri())).unwrap();
    let err = client.cancel("BD-LPSR-ABCDEF123456").await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 500, .. }));
}

// =============================================================================
// In-memory provider
// =============================================================================

#[tokio::test]
async fn memory_provider_moves_orders() {
    let provider = MemoryProvider::new();
    let n = provider.charge(&charge_request("qris")).await.unwrap();
    assert_eq!(n.transaction_status, "pending");
    assert_eq!(provider.charge_count(), 1);

    provider.settle("BD-LPSR-ABCDEF123456").unwrap();
    let polled = provider
        .status("BD-LPSR-ABCDEF123456")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(polled.transaction_status, "settlement");
    assert_eq!(polled.transaction_id, n.transaction_id);

    provider.set_fail_charges(true);
    assert!(provider.charge(&charge_request("qris")).await.is_err());
}
