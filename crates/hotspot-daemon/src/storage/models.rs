//! Database models for hotspotd.

use std::fmt;
use std::str::FromStr;

use hotspot_core::db::{DatabaseError, from_opt_timestamp};
use hotspot_core::{ApprovalStatus, Package, Role, Subscriber};
use serde::{Deserialize, Serialize};

/// Subscriber record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriberRow {
    pub id: String,
    pub phone: String,
    pub full_name: String,
    pub role: String,
    pub approval: String,
    pub is_active: i64,
    pub is_blocked: i64,
    pub blocked_reason: Option<String>,
    pub hotspot_password: Option<String>,
    pub router_profile: Option<String>,
    pub router_server: Option<String>,
    pub purchased_mb: f64,
    pub used_mb: f64,
    pub expiry_at: Option<i64>,
    pub is_unlimited: i64,
    pub manual_debt_mb: f64,
    pub auto_debt_mb: f64,
    pub approved_by: Option<String>,
    pub approved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<SubscriberRow> for Subscriber {
    type Error = DatabaseError;

    fn try_from(row: SubscriberRow) -> Result<Self, Self::Error> {
        let role = Role::from_str(&row.role)
            .map_err(|e| DatabaseError::Corrupt(format!("subscriber {}: {e}", row.id)))?;
        let approval = ApprovalStatus::from_str(&row.approval)
            .map_err(|e| DatabaseError::Corrupt(format!("subscriber {}: {e}", row.id)))?;
        Ok(Self {
            expiry_at: from_opt_timestamp(row.expiry_at)?,
            id: row.id,
            phone: row.phone,
            full_name: row.full_name,
            role,
            approval,
            is_active: row.is_active != 0,
            is_blocked: row.is_blocked != 0,
            blocked_reason: row.blocked_reason,
            hotspot_password: row.hotspot_password,
            router_profile: row.router_profile,
            router_server: row.router_server,
            purchased_mb: row.purchased_mb,
            used_mb: row.used_mb,
            is_unlimited: row.is_unlimited != 0,
            manual_debt_mb: row.manual_debt_mb,
            auto_debt_mb: row.auto_debt_mb,
        })
    }
}

/// Package record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PackageRow {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub quota_gb: f64,
    pub duration_days: i64,
    pub router_profile: Option<String>,
    pub is_active: i64,
    pub created_at: i64,
}

impl From<PackageRow> for Package {
    fn from(row: PackageRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            price: row.price,
            quota_gb: row.quota_gb,
            duration_days: row.duration_days,
            router_profile: row.router_profile,
            is_active: row.is_active != 0,
        }
    }
}

/// Device record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub subscriber_id: String,
    pub mac: String,
    pub last_ip: Option<String>,
    pub label: Option<String>,
    pub is_authorized: i64,
    pub last_seen_at: i64,
    pub last_bytes_total: Option<i64>,
    pub last_bytes_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
}

impl Device {
    pub const fn authorized(&self) -> bool {
        self.is_authorized != 0
    }
}

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Unknown,
    Pending,
    Success,
    Failed,
    Expired,
    Cancelled,
}

impl TransactionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unknown | Self::Pending)
    }
}

impl FromStr for TransactionStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Self::Unknown),
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "EXPIRED" => Ok(Self::Expired),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(DatabaseError::Corrupt(format!(
                "unknown transaction status: {other}"
            ))),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment transaction record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: String,
    pub subscriber_id: Option<String>,
    pub package_id: Option<String>,
    pub order_id: String,
    pub amount: i64,
    pub status: String,
    pub payment_method: String,
    pub debt_mb: Option<f64>,
    pub debt_item_id: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub payment_details: Option<String>,
    pub last_payload: Option<String>,
    pub expiry_at: Option<i64>,
    pub effects_applied: i64,
    /// Set in the same commit that credits the ledger for this transaction.
    pub ledger_applied_at: Option<i64>,
    pub last_polled_at: Option<i64>,
    pub settled_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Transaction {
    pub fn status(&self) -> Result<TransactionStatus, DatabaseError> {
        self.status.parse()
    }

    pub const fn effects_applied(&self) -> bool {
        self.effects_applied != 0
    }
}

/// Where a transaction event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSource {
    App,
    ProviderWebhook,
    ProviderPoll,
}

impl EventSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::App => "APP",
            Self::ProviderWebhook => "PROVIDER_WEBHOOK",
            Self::ProviderPoll => "PROVIDER_POLL",
        }
    }
}

/// Transaction event kinds.
pub mod event_kind {
    pub const INITIATED: &str = "INITIATED";
    pub const STATUS_CHANGE: &str = "STATUS_CHANGE";
    pub const LEDGER_APPLIED: &str = "LEDGER_APPLIED";
    pub const MIKROTIK_APPLY_SUCCESS: &str = "MIKROTIK_APPLY_SUCCESS";
    pub const MIKROTIK_APPLY_FAILED: &str = "MIKROTIK_APPLY_FAILED";
    pub const CANCELLED: &str = "CANCELLED";
}

/// Transaction event record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TransactionEvent {
    pub id: i64,
    pub transaction_id: String,
    pub source: String,
    pub kind: String,
    pub status: Option<String>,
    pub payload: Option<String>,
    pub created_at: i64,
}

/// Manual quota debt item.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DebtItem {
    pub id: String,
    pub subscriber_id: String,
    pub amount_mb: f64,
    pub paid_mb: f64,
    pub debt_date: String,
    pub note: Option<String>,
    pub created_by: Option<String>,
    pub paid_at: Option<i64>,
    pub created_at: i64,
}

impl DebtItem {
    pub fn remaining_mb(&self) -> f64 {
        (self.amount_mb - self.paid_mb).max(0.0)
    }
}

/// Quota mutation log sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationSource {
    Purchase,
    Usage,
    ManualDebt,
    DebtSettlement,
    DebtBlock,
    RoleChange,
    Admin,
}

impl MutationSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Usage => "usage",
            Self::ManualDebt => "manual_debt",
            Self::DebtSettlement => "debt_settlement",
            Self::DebtBlock => "debt_block",
            Self::RoleChange => "role_change",
            Self::Admin => "admin",
        }
    }
}

/// Payload of a quota mutation log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationDetails {
    Purchase {
        transaction_id: String,
        package_id: String,
        package_name: String,
        quota_mb: f64,
        duration_days: i64,
        debt_settled_mb: f64,
    },
    Usage {
        mac: String,
        delta_mb: f64,
        bytes_total: u64,
        baseline: Option<u64>,
    },
    ManualDebt {
        item_id: String,
        amount_mb: f64,
        debt_date: String,
        note: Option<String>,
    },
    DebtSettlement {
        item_id: Option<String>,
        manual_paid_mb: f64,
        auto_paid_mb: f64,
        unblocked: bool,
    },
    DebtBlock {
        reason: String,
        total_debt_mb: f64,
    },
    ManualDebtCleared {
        cleared_mb: f64,
        auto_debt_mb: f64,
    },
    AdminBlock {
        blocked: bool,
        reason: Option<String>,
    },
}

impl MutationDetails {
    pub const fn source(&self) -> MutationSource {
        match self {
            Self::Purchase { .. } => MutationSource::Purchase,
            Self::Usage { .. } => MutationSource::Usage,
            Self::ManualDebt { .. } => MutationSource::ManualDebt,
            Self::DebtSettlement { .. } => MutationSource::DebtSettlement,
            Self::DebtBlock { .. } => MutationSource::DebtBlock,
            Self::ManualDebtCleared { .. } => MutationSource::RoleChange,
            Self::AdminBlock { .. } => MutationSource::Admin,
        }
    }
}

/// Quota mutation log row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MutationEvent {
    pub id: i64,
    pub subscriber_id: String,
    pub source: String,
    pub idempotency_key: Option<String>,
    pub before_state: String,
    pub after_state: String,
    pub details: String,
    pub actor: Option<String>,
    pub created_at: i64,
}

/// Stored setting.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    pub is_secret: i64,
    pub updated_at: i64,
}

/// Audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub action: String,
    pub actor: Option<String>,
    pub subscriber_id: Option<String>,
    pub details: String,
    pub created_at: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Unknown.is_terminal());
        for s in [
            TransactionStatus::Success,
            TransactionStatus::Failed,
            TransactionStatus::Expired,
            TransactionStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
            assert_eq!(s.as_str().parse::<TransactionStatus>().unwrap(), s);
        }
    }

    #[test]
    fn mutation_details_are_tagged() {
        let details = MutationDetails::DebtBlock {
            reason: "quota_debt_limit".into(),
            total_debt_mb: 1024.0,
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["kind"], "debt_block");
        assert_eq!(details.source(), MutationSource::DebtBlock);
    }

    #[test]
    fn debt_item_remaining_is_clamped() {
        let item = DebtItem {
            id: "d".into(),
            subscriber_id: "s".into(),
            amount_mb: 100.0,
            paid_mb: 150.0,
            debt_date: "2025-01-01".into(),
            note: None,
            created_by: None,
            paid_at: None,
            created_at: 0,
        };
        assert!(item.remaining_mb().abs() < f64::EPSILON);
    }
}
