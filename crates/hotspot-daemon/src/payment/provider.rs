//! Payment provider Core API client.
//!
//! `POST /v2/charge` creates a charge, `GET /v2/<order>/status` reads it back
//! and `POST /v2/<order>/cancel` cancels it. The server key is the basic-auth
//! username with an empty password.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use super::notification::Notification;
use crate::error::HotspotError;

/// Provider name used in webhook idempotency keys.
pub const PROVIDER_NAME: &str = "midtrans";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Payment provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ProviderError> for HotspotError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Config(msg) => Self::ConfigMissing(msg),
            other => Self::Provider(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// e.g. `https://api.sandbox.midtrans.com`
    pub base_url: String,
    pub server_key: String,
}

/// A charge to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub order_id: String,
    pub gross_amount: i64,
    /// `qris`, `gopay`, `shopeepay` or `<bank>_va` (e.g. `bca_va`).
    pub payment_method: String,
    pub item_name: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub expiry_minutes: i64,
}

impl ChargeRequest {
    /// Core API charge body for this request.
    pub fn body(&self) -> Value {
        let mut body = json!({
            "transaction_details": {
                "order_id": self.order_id,
                "gross_amount": self.gross_amount,
            },
            "item_details": [{
                "id": self.order_id,
                "price": self.gross_amount,
                "quantity": 1,
                "name": self.item_name,
            }],
            "customer_details": {
                "first_name": self.customer_name,
                "phone": self.customer_phone,
            },
            "custom_expiry": {
                "expiry_duration": self.expiry_minutes,
                "unit": "minute",
            },
        });
        let method = self.payment_method.as_str();
        if let Some(bank) = method.strip_suffix("_va") {
            body["payment_type"] = json!("bank_transfer");
            body["bank_transfer"] = json!({ "bank": bank });
        } else if method == "echannel" {
            body["payment_type"] = json!("echannel");
            body["echannel"] = json!({
                "bill_info1": "Payment:",
                "bill_info2": self.item_name,
            });
        } else {
            body["payment_type"] = json!(method);
        }
        body
    }
}

/// What the payment flow needs from the provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<Notification, ProviderError>;

    /// Current status, `None` when the provider has no such order.
    async fn status(&self, order_id: &str) -> Result<Option<Notification>, ProviderError>;

    async fn cancel(&self, order_id: &str) -> Result<(), ProviderError>;
}

/// HTTP client for the provider's Core API.
#[derive(Debug)]
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    server_key: String,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.base_url.is_empty() {
            return Err(ProviderError::Config("base_url is empty".into()));
        }
        if config.server_key.is_empty() {
            return Err(ProviderError::Config("PAYMENT_SERVER_KEY is empty".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        // reqwest is built with rustls-no-provider; Err only means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            server_key: config.server_key.clone(),
        })
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/v2{}", self.base_url, path)
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), ProviderError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }
        Ok(())
    }

    /// The API reports most failures in the body with HTTP 200.
    fn check_body(n: &Notification) -> Result<(), ProviderError> {
        let code: u16 = n.status_code.parse().unwrap_or(200);
        if code >= 300 {
            return Err(ProviderError::Api {
                status: code,
                message: n
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "provider rejected the request".into()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for HttpProvider {
    async fn charge(&self, request: &ChargeRequest) -> Result<Notification, ProviderError> {
        let resp = self
            .http
            .post(self.api_url("/charge"))
            .basic_auth(&self.server_key, Some(""))
            .json(&request.body())
            .send()
            .await?;
        Self::check_status(&resp)?;
        let n: Notification = resp.json().await?;
        Self::check_body(&n)?;
        debug!(order_id = %request.order_id, status = %n.transaction_status, "Charge created");
        Ok(n)
    }

    async fn status(&self, order_id: &str) -> Result<Option<Notification>, ProviderError> {
        let resp = self
            .http
            .get(self.api_url(&format!("/{order_id}/status")))
            .basic_auth(&self.server_key, Some(""))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check_status(&resp)?;
        let n: Notification = resp.json().await?;
        if n.is_not_found() {
            return Ok(None);
        }
        Self::check_body(&n)?;
        Ok(Some(n))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), ProviderError> {
        let resp = self
            .http
            .post(self.api_url(&format!("/{order_id}/cancel")))
            .basic_auth(&self.server_key, Some(""))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(&resp)?;
        let n: Notification = resp.json().await?;
        if n.is_not_found() {
            return Ok(());
        }
        Self::check_body(&n)
    }
}

/// Provider kept in process, used for dry runs and tests.
///
/// Charges come back `pending`; [`MemoryProvider::settle`] and friends move
/// an order the way the real provider would.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    orders: DashMap<String, Notification>,
    charges: DashMap<String, ChargeRequest>,
    fail_charges: std::sync::atomic::AtomicBool,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent charges fail with an API error.
    pub fn set_fail_charges(&self, fail: bool) {
        self.fail_charges
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn charge_count(&self) -> usize {
        self.charges.len()
    }

    pub fn charged(&self, order_id: &str) -> Option<ChargeRequest> {
        self.charges.get(order_id).map(|c| c.clone())
    }

    /// Set the provider-side status of an order.
    pub fn set_status(&self, order_id: &str, transaction_status: &str) -> Option<Notification> {
        let mut entry = self.orders.get_mut(order_id)?;
        entry.transaction_status = transaction_status.to_string();
        entry.status_code = match transaction_status {
            "settlement" | "capture" => "200",
            "pending" => "201",
            _ => "202",
        }
        .to_string();
        Some(entry.clone())
    }

    pub fn settle(&self, order_id: &str) -> Option<Notification> {
        self.set_status(order_id, "settlement")
    }
}

#[async_trait]
impl PaymentProvider for MemoryProvider {
    async fn charge(&self, request: &ChargeRequest) -> Result<Notification, ProviderError> {
        if self.fail_charges.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: 500,
                message: "charge rejected".into(),
            });
        }
        let n = Notification {
            order_id: request.order_id.clone(),
            status_code: "201".into(),
            gross_amount: format!("{}.00", request.gross_amount),
            transaction_status: "pending".into(),
            transaction_id: Some(uuid::Uuid::new_v4().to_string()),
            payment_type: Some(request.payment_method.clone()),
            qr_code_url: Some(format!("memory://qr/{}", request.order_id)),
            ..Notification::default()
        };
        self.orders.insert(request.order_id.clone(), n.clone());
        self.charges
            .insert(request.order_id.clone(), request.clone());
        Ok(n)
    }

    async fn status(&self, order_id: &str) -> Result<Option<Notification>, ProviderError> {
        Ok(self.orders.get(order_id).map(|n| n.clone()))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), ProviderError> {
        self.set_status(order_id, "cancel");
        Ok(())
    }
}
