//! Provider notification payload and status mapping.
//!
//! The webhook body, the status API response and the charge response share
//! one shape, so a single type covers all three.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::storage::TransactionStatus;

/// Provider timestamps are wall-clock Jakarta time.
const PROVIDER_UTC_OFFSET_SECS: i32 = 7 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaNumber {
    pub bank: String,
    pub va_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAction {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub order_id: String,
    #[serde(default)]
    pub status_code: String,
    #[serde(default)]
    pub gross_amount: String,
    #[serde(default)]
    pub transaction_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraud_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub va_numbers: Option<Vec<VaNumber>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bill_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biller_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<PaymentAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl Notification {
    /// Local status for the provider's `transaction_status`.
    ///
    /// `None` for values we do not act on (`refund`, `authorize`, ...).
    pub fn mapped_status(&self) -> Option<TransactionStatus> {
        match self.transaction_status.as_str() {
            "settlement" => Some(TransactionStatus::Success),
            "capture" => Some(if self.fraud_status.as_deref() == Some("challenge") {
                TransactionStatus::Pending
            } else {
                TransactionStatus::Success
            }),
            "pending" => Some(TransactionStatus::Pending),
            "deny" | "failure" => Some(TransactionStatus::Failed),
            "expire" => Some(TransactionStatus::Expired),
            "cancel" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    /// Body-level 404 from the status API.
    pub fn is_not_found(&self) -> bool {
        self.status_code == "404"
    }

    /// Parsed `expiry_time`.
    pub fn expiry_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.expiry_time.as_deref()?;
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Some(t.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
        let offset = FixedOffset::east_opt(PROVIDER_UTC_OFFSET_SECS)?;
        naive
            .and_local_timezone(offset)
            .single()
            .map(|t| t.with_timezone(&Utc))
    }

    /// How the subscriber pays: VA number, bill key, QR or deeplink actions.
    pub fn payment_details(&self) -> Option<Value> {
        let mut details = serde_json::Map::new();
        if let Some(va) = self.va_numbers.as_ref().and_then(|v| v.first()) {
            details.insert("bank".into(), json!(va.bank));
            details.insert("va_number".into(), json!(va.va_number));
        }
        if let Some(key) = &self.bill_key {
            details.insert("bill_key".into(), json!(key));
        }
        if let Some(code) = &self.biller_code {
            details.insert("biller_code".into(), json!(code));
        }
        let qr = self.qr_code_url.clone().or_else(|| {
            self.actions
                .iter()
                .flatten()
                .find(|a| a.name == "generate-qr-code")
                .map(|a| a.url.clone())
        });
        if let Some(url) = qr {
            details.insert("qr_code_url".into(), json!(url));
        }
        if let Some(deeplink) = self
            .actions
            .iter()
            .flatten()
            .find(|a| a.name == "deeplink-redirect")
        {
            details.insert("deeplink_url".into(), json!(deeplink.url));
        }
        (!details.is_empty()).then_some(Value::Object(details))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn with_status(status: &str, fraud: Option<&str>) -> Notification {
        Notification {
            order_id: "BD-LPSR-ABCDEF123456".into(),
            transaction_status: status.into(),
            fraud_status: fraud.map(String::from),
            ..Notification::default()
        }
    }

    #[test]
    fn status_mapping() {
        let cases = [
            ("settlement", None, Some(TransactionStatus::Success)),
            ("capture", Some("accept"), Some(TransactionStatus::Success)),
            ("capture", Some("challenge"), Some(TransactionStatus::Pending)),
            ("pending", None, Some(TransactionStatus::Pending)),
            ("deny", None, Some(TransactionStatus::Failed)),
            ("expire", None, Some(TransactionStatus::Expired)),
            ("cancel", None, Some(TransactionStatus::Cancelled)),
            ("refund", None, None),
        ];
        for (status, fraud, expected) in cases {
            assert_eq!(with_status(status, fraud).mapped_status(), expected, "{status}");
        }
    }

    #[test]
    fn parses_webhook_body() {
        let body = r#"{
            "transaction_time": "2025-01-10 10:00:00",
            "transaction_status": "pending",
            "transaction_id": "9aed5972-5b6a-401e-894b-a32c91ed1a3a",
            "status_code": "201",
            "signature_key": "abc",
            "payment_type": "bank_transfer",
            "order_id": "BD-LPSR-ABCDEF123456",
            "gross_amount": "10000.00",
            "va_numbers": [{"bank": "bca", "va_number": "12345678901"}],
            "expiry_time": "2025-01-10 11:00:00"
        }"#;
        let n: Notification = serde_json::from_str(body).unwrap();
        assert_eq!(n.gross_amount, "10000.00");
        assert_eq!(
            n.payment_details().unwrap()["va_number"],
            json!("12345678901")
        );
        let expiry = n.expiry_at().unwrap();
        assert_eq!(expiry.to_rfc3339(), "2025-01-10T04:00:00+00:00");
    }

    #[test]
    fn qr_from_actions() {
        let n = Notification {
            actions: Some(vec![PaymentAction {
                name: "generate-qr-code".into(),
                url: "https://example.test/qr.png".into(),
                method: Some("GET".into()),
            }]),
            ..with_status("pending", None)
        };
        assert_eq!(
            n.payment_details().unwrap()["qr_code_url"],
            json!("https://example.test/qr.png")
        );
    }
}
