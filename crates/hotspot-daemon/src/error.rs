//! Error kinds surfaced by hotspotd.

use hotspot_core::db::DatabaseError;
use hotspot_crypto::CryptoError;
use hotspot_routeros::RouterError;
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HotspotError>;

#[derive(Debug, Error)]
pub enum HotspotError {
    #[error("Required setting is missing: {0}")]
    ConfigMissing(String),

    #[error("Router unreachable: {0}")]
    RouterUnreachable(String),

    #[error("Router command failed: {0}")]
    RouterCommandFailed(String),

    #[error("Device is registered to another subscriber ({incumbent})")]
    DeviceTakeoverRequired { incumbent: String },

    #[error("Transaction {0} already succeeded")]
    TransactionAlreadySuccess(String),

    #[error("Invalid provider signature")]
    ProviderSignatureInvalid,

    #[error("Idempotency cache unavailable: {0}")]
    IdempotencyCacheUnavailable(String),

    #[error(
        "Package quota of {package_mb} MB does not cover outstanding debt of {debt_mb} MB; choose a package larger than {debt_mb} MB"
    )]
    QuotaPackageTooSmall { package_mb: f64, debt_mb: f64 },

    #[error("Policy invariant violated: {0}")]
    PolicyInvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HotspotError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigMissing(_) => "CONFIG_MISSING",
            Self::RouterUnreachable(_) => "ROUTER_UNREACHABLE",
            Self::RouterCommandFailed(_) => "ROUTER_COMMAND_FAILED",
            Self::DeviceTakeoverRequired { .. } => "DEVICE_TAKEOVER_REQUIRED",
            Self::TransactionAlreadySuccess(_) => "TRANSACTION_ALREADY_SUCCESS",
            Self::ProviderSignatureInvalid => "PROVIDER_SIGNATURE_INVALID",
            Self::IdempotencyCacheUnavailable(_) => "IDEMPOTENCY_CACHE_UNAVAILABLE",
            Self::QuotaPackageTooSmall { .. } => "QUOTA_PACKAGE_TOO_SMALL",
            Self::PolicyInvariantViolation(_) => "POLICY_INVARIANT_VIOLATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Provider(_) => "PAYMENT_PROVIDER_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Crypto(_) => "CRYPTO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for the API envelope.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::DeviceTakeoverRequired { .. } => 409,
            Self::TransactionAlreadySuccess(_)
            | Self::QuotaPackageTooSmall { .. }
            | Self::Validation(_) => 400,
            Self::ProviderSignatureInvalid => 403,
            Self::Unauthorized => 401,
            Self::NotFound(_) => 404,
            Self::RouterUnreachable(_) | Self::ConfigMissing(_) => 503,
            Self::RouterCommandFailed(_) | Self::Provider(_) => 502,
            Self::IdempotencyCacheUnavailable(_)
            | Self::PolicyInvariantViolation(_)
            | Self::Database(_)
            | Self::Crypto(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Structured extras for the API envelope.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::DeviceTakeoverRequired { incumbent } => {
                Some(serde_json::json!({ "incumbent": incumbent }))
            }
            Self::QuotaPackageTooSmall {
                package_mb,
                debt_mb,
            } => Some(serde_json::json!({
                "package_mb": package_mb,
                "debt_mb": debt_mb,
                "minimum_package_mb": debt_mb,
            })),
            _ => None,
        }
    }
}

impl From<DatabaseError> for HotspotError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Database(other),
        }
    }
}

impl From<RouterError> for HotspotError {
    fn from(e: RouterError) -> Self {
        if e.is_unreachable() {
            Self::RouterUnreachable(e.to_string())
        } else {
            Self::RouterCommandFailed(e.to_string())
        }
    }
}

impl From<hotspot_core::Error> for HotspotError {
    fn from(e: hotspot_core::Error) -> Self {
        match e {
            hotspot_core::Error::Config(msg) => Self::ConfigMissing(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let e = HotspotError::DeviceTakeoverRequired {
            incumbent: "0812***1234".into(),
        };
        assert_eq!(e.code(), "DEVICE_TAKEOVER_REQUIRED");
        assert_eq!(e.status_code(), 409);
        assert_eq!(
            e.details().and_then(|d| d["incumbent"].as_str().map(String::from)),
            Some("0812***1234".to_string())
        );

        assert_eq!(HotspotError::ProviderSignatureInvalid.status_code(), 403);
        assert_eq!(
            HotspotError::TransactionAlreadySuccess("X".into()).status_code(),
            400
        );
    }

    #[test]
    fn too_small_message_names_the_debt() {
        let e = HotspotError::QuotaPackageTooSmall {
            package_mb: 1024.0,
            debt_mb: 2048.0,
        };
        assert!(e.to_string().contains("2048 MB"));
        assert_eq!(e.code(), "QUOTA_PACKAGE_TOO_SMALL");
    }

    #[test]
    fn router_errors_split_by_reachability() {
        let down: HotspotError = RouterError::Unreachable("timeout".into()).into();
        assert_eq!(down.code(), "ROUTER_UNREACHABLE");
        let failed: HotspotError = RouterError::Command {
            status: 400,
            message: "bad".into(),
        }
        .into();
        assert_eq!(failed.code(), "ROUTER_COMMAND_FAILED");
    }

    #[test]
    fn db_not_found_maps_to_not_found() {
        let e: HotspotError = DatabaseError::NotFound("Subscriber x".into()).into();
        assert_eq!(e.status_code(), 404);
    }
}
