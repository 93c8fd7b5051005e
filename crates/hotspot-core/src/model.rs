//! Domain model shared by the policy engine, the ledger and the reconciler.
//!
//! These are value types. Storage rows convert into them at the edge and every
//! change goes through an explicit transition on the owning service.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Megabytes per gigabyte used for package quotas.
pub const MB_PER_GB: f64 = 1024.0;

/// Bytes per megabyte used when absorbing router counters.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Block reason written when total debt reaches the hard cap.
pub const BLOCK_REASON_DEBT_LIMIT: &str = "quota_debt_limit";

/// Block reason written by the end-of-month debt sweep.
pub const BLOCK_REASON_DEBT_END_OF_MONTH: &str = "quota_debt_end_of_month";

/// Issue a six-digit numeric hotspot credential.
pub fn new_hotspot_password() -> String {
    use rand::Rng;
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// Whether `password` has the shape [`new_hotspot_password`] produces.
pub fn is_valid_hotspot_password(password: &str) -> bool {
    password.len() == 6 && password.bytes().all(|b| b.is_ascii_digit())
}

/// Returns true when a block reason was produced by the debt policy.
pub fn is_debt_block_reason(reason: &str) -> bool {
    reason == BLOCK_REASON_DEBT_LIMIT || reason == BLOCK_REASON_DEBT_END_OF_MONTH
}

/// Subscriber role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Komandan,
    Admin,
    SuperAdmin,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Komandan => "KOMANDAN",
            Self::Admin => "ADMIN",
            Self::SuperAdmin => "SUPER_ADMIN",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User),
            "KOMANDAN" => Ok(Self::Komandan),
            "ADMIN" => Ok(Self::Admin),
            "SUPER_ADMIN" => Ok(Self::SuperAdmin),
            other => Err(Error::Parse(format!("unknown role: {other}"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admin approval state of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(Error::Parse(format!("unknown approval status: {other}"))),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access state produced by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessState {
    Active,
    Unlimited,
    Fup,
    Habis,
    Expired,
    Inactive,
    Blocked,
}

impl AccessState {
    pub const ALL: [Self; 7] = [
        Self::Active,
        Self::Unlimited,
        Self::Fup,
        Self::Habis,
        Self::Expired,
        Self::Inactive,
        Self::Blocked,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Unlimited => "UNLIMITED",
            Self::Fup => "FUP",
            Self::Habis => "HABIS",
            Self::Expired => "EXPIRED",
            Self::Inactive => "INACTIVE",
            Self::Blocked => "BLOCKED",
        }
    }

    /// States in which the subscriber's devices get connectivity.
    pub const fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Unlimited | Self::Fup)
    }
}

impl FromStr for AccessState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Parse(format!("unknown access state: {s}")))
    }
}

impl fmt::Display for AccessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a subscriber as seen by the policy engine and the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    /// E.164 phone number, e.g. `+6281234567890`.
    pub phone: String,
    pub full_name: String,
    pub role: Role,
    pub approval: ApprovalStatus,
    pub is_active: bool,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    /// Numeric hotspot credential issued on approval.
    pub hotspot_password: Option<String>,
    /// Profile assigned by an admin, kept unless a reconcile forces the managed one.
    pub router_profile: Option<String>,
    pub router_server: Option<String>,
    pub purchased_mb: f64,
    pub used_mb: f64,
    pub expiry_at: Option<DateTime<Utc>>,
    pub is_unlimited: bool,
    pub manual_debt_mb: f64,
    pub auto_debt_mb: f64,
}

impl Subscriber {
    pub fn remaining_mb(&self) -> f64 {
        self.purchased_mb - self.used_mb
    }

    pub fn total_debt_mb(&self) -> f64 {
        self.auto_debt_mb + self.manual_debt_mb
    }

    pub fn is_blocked_for_debt(&self) -> bool {
        self.is_blocked
            && self
                .blocked_reason
                .as_deref()
                .is_some_and(is_debt_block_reason)
    }

    /// Quota counters the ledger snapshots before and after each mutation.
    pub fn quota_state(&self) -> QuotaState {
        QuotaState {
            purchased_mb: self.purchased_mb,
            used_mb: self.used_mb,
            expiry_at: self.expiry_at,
            is_unlimited: self.is_unlimited,
            manual_debt_mb: self.manual_debt_mb,
            auto_debt_mb: self.auto_debt_mb,
            is_blocked: self.is_blocked,
            blocked_reason: self.blocked_reason.clone(),
        }
    }
}

/// The quota portion of a subscriber, recorded in the mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub purchased_mb: f64,
    pub used_mb: f64,
    pub expiry_at: Option<DateTime<Utc>>,
    pub is_unlimited: bool,
    pub manual_debt_mb: f64,
    pub auto_debt_mb: f64,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
}

impl QuotaState {
    /// Every counter is non-negative.
    pub fn is_consistent(&self) -> bool {
        self.purchased_mb >= 0.0
            && self.used_mb >= 0.0
            && self.manual_debt_mb >= 0.0
            && self.auto_debt_mb >= 0.0
    }
}

/// A sellable access package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    /// Price in the smallest currency unit.
    pub price: i64,
    /// Quota in GB; zero means unlimited.
    pub quota_gb: f64,
    pub duration_days: i64,
    pub router_profile: Option<String>,
    pub is_active: bool,
}

impl Package {
    pub fn is_unlimited(&self) -> bool {
        self.quota_gb <= 0.0
    }

    pub fn quota_mb(&self) -> f64 {
        self.quota_gb * MB_PER_GB
    }
}
