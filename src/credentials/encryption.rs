//! AES-256-GCM secret codec for tenant credentials.
//!
//! Each secret is encrypted separately with a unique nonce. The sealed form is
//! a single string `v1.<nonce>.<ciphertext>` (both parts base64) so one column
//! holds everything needed to open it. The master key must be 32 bytes
//! (256 bits) and is provided from configuration at startup.

use crate::error::{IntegrationError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Envelope version prefix
const ENVELOPE_VERSION: &str = "v1";

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Zeroizing<Vec<u8>>> {
    let key_bytes = Zeroizing::new(
        BASE64
            .decode(key_base64.trim())
            .map_err(|e| IntegrationError::InvalidKey(format!("not valid base64: {}", e)))?,
    );

    if key_bytes.len() != KEY_SIZE {
        return Err(IntegrationError::InvalidKey(format!(
            "must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

/// Process-wide secret codec.
///
/// Cloning shares the key; the key bytes are zeroized when the last clone
/// is dropped. Safe to use concurrently from any number of requests.
#[derive(Clone)]
pub struct SecretCodec {
    key: Arc<Zeroizing<Vec<u8>>>,
}

impl SecretCodec {
    /// Builds the codec from the configured key.
    ///
    /// A missing key is a fatal configuration error for every code path that
    /// touches tenant credentials.
    pub fn from_key(key_base64: Option<&str>) -> Result<Self> {
        let key_base64 = key_base64
            .filter(|k| !k.trim().is_empty())
            .ok_or(IntegrationError::MissingKey)?;
        let key = validate_key(key_base64)?;
        Ok(Self { key: Arc::new(key) })
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| IntegrationError::InvalidKey(format!("cipher init failed: {}", e)))
    }

    /// Seals a secret with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;

        // Generate random nonce (never reuse!)
        let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext_bytes = cipher
            .encrypt(&nonce_bytes, plaintext.as_bytes())
            .map_err(|e| IntegrationError::Crypto(format!("encryption failed: {}", e)))?;

        Ok(format!(
            "{}.{}.{}",
            ENVELOPE_VERSION,
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext_bytes)
        ))
    }

    /// Opens a sealed secret. Fails on a wrong key, corrupted data or tampering.
    pub fn decrypt(&self, sealed: &str) -> Result<Zeroizing<String>> {
        let mut parts = sealed.splitn(3, '.');
        let (version, nonce, ciphertext) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(n), Some(c)) => (v, n, c),
            _ => return Err(IntegrationError::Crypto("malformed envelope".to_string())),
        };

        if version != ENVELOPE_VERSION {
            return Err(IntegrationError::Crypto(format!(
                "unsupported envelope version '{}'",
                version
            )));
        }

        let nonce_bytes = BASE64
            .decode(nonce)
            .map_err(|_| IntegrationError::Crypto("failed to decode nonce".to_string()))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(IntegrationError::Crypto(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let ciphertext_bytes = BASE64
            .decode(ciphertext)
            .map_err(|_| IntegrationError::Crypto("failed to decode ciphertext".to_string()))?;

        let cipher = self.cipher()?;
        let plaintext_bytes = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext_bytes.as_ref())
                .map_err(|_| {
                    IntegrationError::Crypto("wrong key or corrupted data".to_string())
                })?,
        );

        let plaintext = std::str::from_utf8(&plaintext_bytes)
            .map_err(|_| IntegrationError::Crypto("decrypted data is not UTF-8".to_string()))?;
        Ok(Zeroizing::new(plaintext.to_string()))
    }
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec").finish_non_exhaustive()
    }
}
