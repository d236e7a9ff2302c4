//! Token generation, hashing, and config encryption for Latchflow.
//!
//! Every credential Latchflow issues (session tokens, API tokens, magic-link
//! tokens, OTPs, device codes) is generated here and stored **hash-only**:
//! the database never holds a raw secret, only its SHA-256 digest. Lookups
//! hash the presented secret and compare digests in constant time.
//!
//! Plugin definition config can additionally be encrypted at rest with
//! AES-256-GCM, producing `ENC[AES256-GCM,data:<b64>,iv:<b64>,tag:<b64>]`
//! envelopes.

mod cipher;
mod token;

pub use cipher::{ConfigCipher, ConfigEncryptionMode, MasterKey, parse_master_key};
pub use token::{generate_numeric_otp, generate_token};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Errors from cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided master key is not valid (wrong length or encoding).
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    /// The encrypted value format is malformed.
    #[error("invalid encrypted value: {0}")]
    InvalidFormat(String),

    /// Decryption failed (wrong key or corrupted data).
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// AES-GCM mode was requested without a usable master key.
    #[error("config encryption mode aes-gcm requires a master key")]
    KeyRequired,
}

/// Lowercase hex SHA-256 digest of `data`.
///
/// This is the canonical at-rest form for every credential artifact and for
/// content addressing of stored objects.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Raw SHA-256 digest of `data`.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Constant-time equality of two byte strings.
///
/// Unequal lengths return `false` immediately; the length of a stored hash
/// is not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Base64url (no padding) encoding, the wire form for generated tokens.
pub fn base64url(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}
