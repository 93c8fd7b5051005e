//! hotspotd crypto primitives
//!
//! - **Secret box**: passphrase → HKDF-SHA256 → ChaCha20-Poly1305, used to keep
//!   router and provider credentials encrypted in the settings table
//! - **Provider signature**: SHA-512 over the notification fields plus the
//!   server key, compared in constant time

pub mod error;
pub mod secretbox;
pub mod signature;

pub use error::CryptoError;
pub use secretbox::SecretBox;
pub use signature::{constant_time_str_eq, provider_signature, verify_provider_signature};
