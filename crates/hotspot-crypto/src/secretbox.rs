//! Encryption at rest for secret settings.
//!
//! The key is derived from an operator passphrase via HKDF-SHA256. Each value
//! is sealed with ChaCha20-Poly1305 under a fresh random nonce and stored as
//! `enc:v1:<hex(nonce || ciphertext)>`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// HKDF info string for the settings key.
const HKDF_INFO: &[u8] = b"hotspotd-settings-v1";

/// HKDF salt for domain separation.
const HKDF_SALT: &[u8] = b"hotspotd-settings-hkdf-salt-v1";

/// Prefix marking a sealed value.
pub const SEALED_PREFIX: &str = "enc:v1:";

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Seals and opens setting values with a passphrase-derived key.
pub struct SecretBox {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

fn hkdf_derive(passphrase: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), passphrase);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

impl SecretBox {
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        let mut key_bytes = hkdf_derive(passphrase.as_bytes())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        key_bytes.zeroize();
        Ok(Self { cipher })
    }

    /// Whether `stored` carries the sealed prefix.
    pub fn is_sealed(stored: &str) -> bool {
        stored.starts_with(SEALED_PREFIX)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", hex::encode(payload)))
    }

    pub fn open(&self, stored: &str) -> Result<String, CryptoError> {
        let body = stored
            .strip_prefix(SEALED_PREFIX)
            .ok_or_else(|| CryptoError::MalformedEnvelope("missing prefix".into()))?;
        let payload =
            hex::decode(body).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        if payload.len() <= NONCE_SIZE {
            return Err(CryptoError::MalformedEnvelope("too short".into()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}
