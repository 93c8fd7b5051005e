//! MAC address canonicalisation.

use crate::error::{Error, Result};

/// Canonicalise a MAC to upper-case, colon-separated hex (`AA:BB:CC:DD:EE:FF`).
///
/// Accepts colon, dash, dot (Cisco) and bare forms.
pub fn canonical_mac(input: &str) -> Result<String> {
    let hex: String = input
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidMac(input.to_string()));
    }

    let upper = hex.to_ascii_uppercase();
    let octets: Vec<&str> = (0..6).filter_map(|i| upper.get(i * 2..i * 2 + 2)).collect();
    Ok(octets.join(":"))
}

/// Canonical form if valid, otherwise `None`. Used on router snapshots where
/// malformed entries are skipped rather than failing the sweep.
pub fn try_canonical_mac(input: &str) -> Option<String> {
    canonical_mac(input).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_common_forms() {
        assert_eq!(canonical_mac("aa:bb:cc:dd:ee:ff").unwrap(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(canonical_mac("AA-BB-CC-DD-EE-FF").unwrap(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(canonical_mac("aabb.ccdd.eeff").unwrap(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(canonical_mac("aabbccddeeff").unwrap(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn rejects_invalid() {
        assert!(canonical_mac("AA:BB:CC:DD:EE").is_err());
        assert!(canonical_mac("GG:BB:CC:DD:EE:FF").is_err());
        assert!(try_canonical_mac("").is_none());
    }
}
