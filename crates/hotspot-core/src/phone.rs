//! Phone number canonicalisation.
//!
//! Subscribers are keyed by E.164 numbers. The router only ever sees the
//! local form (leading `0`), which doubles as the hotspot username.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Default country calling code (Indonesia).
pub const DEFAULT_COUNTRY_CODE: &str = "62";

static E164: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{7,14}$").ok());

/// Normalise user input to E.164.
///
/// Accepts `+62812…`, `62812…`, `0812…` and tolerates spaces, dashes and dots.
pub fn normalize_e164(input: &str, country_code: &str) -> Result<String> {
    let digits: String = input
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    let candidate = if let Some(rest) = digits.strip_prefix('+') {
        format!("+{rest}")
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("+{country_code}{rest}")
    } else if digits.starts_with(country_code) {
        format!("+{digits}")
    } else {
        return Err(Error::InvalidPhone(input.to_string()));
    };

    let valid = E164
        .as_ref()
        .is_some_and(|re| re.is_match(&candidate));
    if valid {
        Ok(candidate)
    } else {
        Err(Error::InvalidPhone(input.to_string()))
    }
}

/// Local form used as the hotspot username: `+62812…` becomes `0812…`.
pub fn local_form(e164: &str, country_code: &str) -> String {
    let prefix = format!("+{country_code}");
    e164.strip_prefix(&prefix).map_or_else(
        || e164.trim_start_matches('+').to_string(),
        |rest| format!("0{rest}"),
    )
}

/// Redacted phone for messages shown to other subscribers: `0812***7890`.
pub fn redact(e164: &str, country_code: &str) -> String {
    let local = local_form(e164, country_code);
    let chars: Vec<char> = local.chars().collect();
    if chars.len() <= 8 {
        let tail: String = chars.iter().skip(chars.len().saturating_sub(4)).collect();
        return format!("***{tail}");
    }
    let head: String = chars.iter().take(4).collect();
    let tail: String = chars.iter().skip(chars.len() - 4).collect();
    format!("{head}***{tail}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_local_and_international_forms() {
        assert_eq!(normalize_e164("081234567890", "62").unwrap(), "+6281234567890");
        assert_eq!(normalize_e164("6281234567890", "62").unwrap(), "+6281234567890");
        assert_eq!(normalize_e164("+62 812-3456-7890", "62").unwrap(), "+6281234567890");
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize_e164("hello", "62").is_err());
        assert!(normalize_e164("0812", "62").is_err());
        assert!(normalize_e164("", "62").is_err());
    }

    #[test]
    fn local_form_strips_country_code() {
        assert_eq!(local_form("+6281234567890", "62"), "081234567890");
        assert_eq!(local_form("+15551234567", "62"), "15551234567");
    }

    #[test]
    fn redact_keeps_head_and_tail() {
        assert_eq!(redact("+6281299991234", "62"), "0812***1234");
        assert!(redact("+6281299991234", "62").ends_with("***1234"));
    }
}
