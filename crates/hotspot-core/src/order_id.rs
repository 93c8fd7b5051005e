//! Payment order-id codec.
//!
//! Purchases: `<prefix>-<12 upper hex>` (prefix defaults to `BD-LPSR`).
//! Debt settlements: `DEBT-<base64url(uuid)>~<4 upper hex>`, with the legacy
//! `DEBT-<uuid>~<4 upper hex>` still accepted on the way in.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Default prefix for package purchase orders.
pub const DEFAULT_PURCHASE_PREFIX: &str = "BD-LPSR";

/// Default prefix for debt settlement orders.
pub const DEFAULT_DEBT_PREFIX: &str = "DEBT";

/// What an order pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    /// A package purchase.
    Purchase,
    /// A debt settlement. `target` is the uuid carried in the order id, which
    /// names a single manual debt item when one with that id exists.
    DebtSettlement { target: Option<Uuid> },
}

/// Generate a purchase order id.
pub fn new_purchase_order_id(prefix: &str) -> String {
    let simple = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
    let suffix: String = simple.chars().take(12).collect();
    format!("{prefix}-{suffix}")
}

/// Generate a debt settlement order id carrying `target`.
pub fn new_debt_order_id(prefix: &str, target: Uuid) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(target.as_bytes());
    let nonce: u16 = rand::thread_rng().r#gen();
    format!("{prefix}-{encoded}~{nonce:04X}")
}

/// Classify an order id against the configured debt prefixes.
pub fn classify(order_id: &str, debt_prefixes: &[String]) -> OrderKind {
    for prefix in debt_prefixes {
        let marker = format!("{prefix}-");
        if let Some(rest) = order_id.strip_prefix(&marker) {
            return OrderKind::DebtSettlement {
                target: decode_debt_target(rest).ok(),
            };
        }
    }
    OrderKind::Purchase
}

/// Decode the uuid part of a debt order body (`<token>~<nonce>`).
fn decode_debt_target(body: &str) -> Result<Uuid> {
    let token = body.split_once('~').map_or(body, |(token, _)| token);

    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(token)
        && let Ok(uuid) = Uuid::from_slice(&bytes)
    {
        return Ok(uuid);
    }

    Uuid::parse_str(token).map_err(|_| Error::InvalidOrderId(body.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn debt_prefixes() -> Vec<String> {
        vec![DEFAULT_DEBT_PREFIX.to_string()]
    }

    #[test]
    fn purchase_order_id_shape() {
        let id = new_purchase_order_id(DEFAULT_PURCHASE_PREFIX);
        let suffix = id.strip_prefix("BD-LPSR-").unwrap();
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(classify(&id, &debt_prefixes()), OrderKind::Purchase);
    }

    #[test]
    fn debt_order_id_carries_target() {
        let target = Uuid::new_v4();
        let id = new_debt_order_id(DEFAULT_DEBT_PREFIX, target);
        let (_, nonce) = id.rsplit_once('~').unwrap();
        assert_eq!(nonce.len(), 4);
        assert_eq!(
            classify(&id, &debt_prefixes()),
            OrderKind::DebtSettlement {
                target: Some(target)
            }
        );
    }

    #[test]
    fn legacy_debt_order_id_is_accepted() {
        let target = Uuid::new_v4();
        let id = format!("DEBT-{target}~A1B2");
        assert_eq!(
            classify(&id, &debt_prefixes()),
            OrderKind::DebtSettlement {
                target: Some(target)
            }
        );
    }

    #[test]
    fn undecodable_debt_order_targets_nothing() {
        assert_eq!(
            classify("DEBT-garbage~A1B2", &debt_prefixes()),
            OrderKind::DebtSettlement { target: None }
        );
    }

    #[test]
    fn prefix_must_be_followed_by_dash() {
        assert_eq!(classify("DEBTOR-123", &debt_prefixes()), OrderKind::Purchase);
    }
}
