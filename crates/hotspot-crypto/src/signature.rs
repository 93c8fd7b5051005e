//! Payment provider notification signatures.
//!
//! The provider signs each notification with
//! `hex(sha512(order_id || status_code || gross_amount || server_key))`.

use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// Compute the expected signature for a notification.
pub fn provider_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a received signature. Hex case is ignored.
pub fn verify_provider_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
    received: &str,
) -> bool {
    let expected = provider_signature(order_id, status_code, gross_amount, server_key);
    constant_time_str_eq(&expected, &received.trim().to_ascii_lowercase())
}

/// Compare two strings without leaking the position of the first difference.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_sha512_hex() {
        let sig = provider_signature("BD-LPSR-ABC", "200", "50000.00", "key");
        assert_eq!(sig.len(), 128);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_accepts_upper_case_and_rejects_changes() {
        let sig = provider_signature("BD-LPSR-ABC", "200", "50000.00", "key");
        assert!(verify_provider_signature(
            "BD-LPSR-ABC",
            "200",
            "50000.00",
            "key",
            &sig.to_ascii_uppercase()
        ));
        assert!(!verify_provider_signature("BD-LPSR-ABC", "200", "50001.00", "key", &sig));
        assert!(!verify_provider_signature("BD-LPSR-ABC", "200", "50000.00", "other", &sig));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_str_eq("abc", "abc"));
        assert!(!constant_time_str_eq("abc", "abd"));
        assert!(!constant_time_str_eq("abc", "abcd"));
    }
}
