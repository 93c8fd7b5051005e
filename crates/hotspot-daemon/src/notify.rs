//! Outbound WhatsApp notifications.
//!
//! Best effort: a failed send is logged and counted, never propagated into the
//! state change that triggered it.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hotspot_core::Counters;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WhatsApp gateway error ({status})")]
    Api { status: u16 },

    #[error("Configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `message` to an E.164 phone number.
    async fn send(&self, phone: &str, message: &str) -> Result<(), NotifyError>;
}

/// Send and swallow the error.
pub async fn send_best_effort(
    notifier: &dyn Notifier,
    counters: &Counters,
    phone: &str,
    message: &str,
) {
    match notifier.send(phone, message).await {
        Ok(()) => counters.incr("notify.sent"),
        Err(e) => {
            warn!(error = %e, "WhatsApp notification failed");
            counters.incr("notify.failed");
        }
    }
}

/// Gateway that takes `{target, message}` with the API key in `Authorization`.
#[derive(Debug)]
pub struct WhatsAppNotifier {
    http: reqwest::Client,
    url: String,
}

impl WhatsAppNotifier {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, NotifyError> {
        if base_url.is_empty() {
            return Err(NotifyError::Config("WHATSAPP_BASE_URL is empty".into()));
        }
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| NotifyError::Config("Invalid WHATSAPP_API_KEY".into()))?;
        headers.insert(AUTHORIZATION, key);

        // reqwest is built with rustls-no-provider; Err only means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(SEND_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            url: format!("{}/send", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Notifier for WhatsAppNotifier {
    async fn send(&self, phone: &str, message: &str) -> Result<(), NotifyError> {
        let target = phone.trim_start_matches('+');
        let resp = self
            .http
            .post(&self.url)
            .json(&json!({ "target": target, "message": message }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Api {
                status: resp.status().as_u16(),
            });
        }
        debug!(target, "WhatsApp message sent");
        Ok(())
    }
}

/// Used when no gateway is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, phone: &str, _message: &str) -> Result<(), NotifyError> {
        debug!(phone, "WhatsApp gateway not configured; message dropped");
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(phone, message)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, phone: &str, message: &str) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((phone.to_string(), message.to_string()));
        }
        Ok(())
    }
}
