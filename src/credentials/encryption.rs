//! AES-256-GCM sealing of serialized credentials.
//!
//! Each write gets a fresh random nonce. The master key is 32 bytes, supplied
//! base64-encoded through `LATCHKEY_ENCRYPTION_KEY`.

use crate::errors::StoreError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_SIZE: usize = 32;

/// 96-bit nonce, standard for GCM.
const NONCE_SIZE: usize = 12;

fn encryption_error(details: impl Into<String>) -> StoreError {
    StoreError::Encryption {
        details: details.into(),
    }
}

/// Decodes the base64 master key and checks it is exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>, StoreError> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .map_err(|e| encryption_error(format!("invalid base64 encryption key: {e}")))?;

    if key_bytes.len() != KEY_SIZE {
        return Err(encryption_error(format!(
            "encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, StoreError> {
    if key.len() != KEY_SIZE {
        return Err(encryption_error(format!(
            "encryption key must be {KEY_SIZE} bytes"
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| encryption_error(e.to_string()))
}

/// Seals `plaintext` and returns `(ciphertext, nonce)`, both base64-encoded.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<(String, String), StoreError> {
    let cipher = cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| encryption_error(format!("encryption failed: {e}")))?;

    Ok((BASE64.encode(ciphertext), BASE64.encode(nonce)))
}

/// Opens a payload sealed by [`encrypt`].
///
/// Fails on a wrong key, a wrong nonce, or tampered ciphertext.
pub fn decrypt(ciphertext: &str, nonce: &str, key: &[u8]) -> Result<Vec<u8>, StoreError> {
    let cipher = cipher(key)?;

    let ciphertext = BASE64
        .decode(ciphertext)
        .map_err(|e| encryption_error(format!("invalid ciphertext encoding: {e}")))?;
    let nonce_bytes = BASE64
        .decode(nonce)
        .map_err(|e| encryption_error(format!("invalid nonce encoding: {e}")))?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(encryption_error(format!(
            "invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| encryption_error("decryption failed (wrong key or corrupted data)"))
}
