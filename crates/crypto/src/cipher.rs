//! AES-256-GCM encryption of plugin definition config.
//!
//! Encrypted values are stored in the format
//! `ENC[AES256-GCM,data:<b64>,iv:<b64>,tag:<b64>]`. Plaintext values pass
//! through decryption unchanged so config written before encryption was
//! enabled stays readable.

use std::fmt;
use std::sync::LazyLock;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use regex::Regex;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// Compiled regex for parsing `ENC[AES256-GCM,data:<b64>,iv:<b64>,tag:<b64>]`.
static ENC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^ENC\[AES256-GCM,data:([A-Za-z0-9+/=]*),iv:([A-Za-z0-9+/=]+),tag:([A-Za-z0-9+/=]+)\]$",
    )
    .expect("ENC regex is valid")
});

/// A 32-byte AES-256 master key, zeroized on drop.
///
/// The `Debug` implementation is redacted; raw bytes never leave this module.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Parse a 32-byte master key from 64 hex characters or base64.
pub fn parse_master_key(raw: &str) -> Result<MasterKey, CryptoError> {
    let trimmed = raw.trim();
    if trimmed.len() == 64
        && let Ok(bytes) = hex::decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    if let Ok(bytes) = B64.decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    Err(CryptoError::InvalidKey(
        "must be 32 bytes encoded as 64 hex chars or base64".to_owned(),
    ))
}

/// How plugin definition config is stored at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEncryptionMode {
    /// Config is stored as plain JSON.
    None,
    /// Config is stored as an AES-256-GCM envelope.
    AesGcm,
}

/// Encrypts and decrypts opaque plugin config values.
///
/// In `None` mode both directions pass values through unchanged. In `AesGcm`
/// mode encryption always produces an `ENC[...]` envelope; decryption of a
/// non-envelope value passes through so pre-encryption rows stay readable.
/// An `AesGcm` cipher cannot be constructed without a key -- the mode is
/// never a silent passthrough.
pub struct ConfigCipher {
    mode: ConfigEncryptionMode,
    key: Option<MasterKey>,
}

impl fmt::Debug for ConfigCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigCipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ConfigCipher {
    /// A cipher that stores config as plain JSON.
    pub fn plaintext() -> Self {
        Self {
            mode: ConfigEncryptionMode::None,
            key: None,
        }
    }

    /// An AES-256-GCM cipher using `key`.
    pub fn aes_gcm(key: MasterKey) -> Self {
        Self {
            mode: ConfigEncryptionMode::AesGcm,
            key: Some(key),
        }
    }

    /// Resolve a cipher from operator settings.
    ///
    /// `mode: aes-gcm` without a parseable key is a hard error unless
    /// `allow_plaintext_fallback` is set, in which case the cipher degrades
    /// to `None` with a warning.
    pub fn from_settings(
        mode: ConfigEncryptionMode,
        raw_key: Option<&str>,
        allow_plaintext_fallback: bool,
    ) -> Result<Self, CryptoError> {
        match mode {
            ConfigEncryptionMode::None => Ok(Self::plaintext()),
            ConfigEncryptionMode::AesGcm => {
                let parsed = raw_key.map(parse_master_key).transpose();
                match parsed {
                    Ok(Some(key)) => Ok(Self::aes_gcm(key)),
                    Ok(None) if allow_plaintext_fallback => {
                        warn!("config encryption key missing, degrading to mode none");
                        Ok(Self::plaintext())
                    }
                    Err(e) if allow_plaintext_fallback => {
                        warn!(error = %e, "config encryption key unusable, degrading to mode none");
                        Ok(Self::plaintext())
                    }
                    Ok(None) => Err(CryptoError::KeyRequired),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// The active encryption mode.
    pub fn mode(&self) -> ConfigEncryptionMode {
        self.mode
    }

    /// Encrypt a config value for storage.
    ///
    /// In `None` mode the value is returned as-is. In `AesGcm` mode the JSON
    /// serialization is sealed into an `ENC[...]` envelope carried as a JSON
    /// string.
    pub fn encrypt(&self, config: &serde_json::Value) -> Result<serde_json::Value, CryptoError> {
        match self.mode {
            ConfigEncryptionMode::None => Ok(config.clone()),
            ConfigEncryptionMode::AesGcm => {
                let key = self.key.as_ref().ok_or(CryptoError::KeyRequired)?;
                let plain = serde_json::to_string(config).map_err(|e| {
                    CryptoError::EncryptionFailed(format!("JSON serialization failed: {e}"))
                })?;
                Ok(serde_json::Value::String(encrypt_value(&plain, key)?))
            }
        }
    }

    /// Decrypt a stored config value.
    ///
    /// Envelope strings are unsealed and parsed as JSON; anything else passes
    /// through unchanged. An envelope encountered in `None` mode is an error
    /// rather than a silent passthrough of opaque bytes.
    pub fn decrypt(&self, stored: &serde_json::Value) -> Result<serde_json::Value, CryptoError> {
        let Some(s) = stored.as_str() else {
            return Ok(stored.clone());
        };
        if !is_envelope(s) {
            return Ok(stored.clone());
        }
        let key = self.key.as_ref().ok_or(CryptoError::KeyRequired)?;
        let plain = decrypt_value(s, key)?;
        serde_json::from_str(&plain)
            .map_err(|e| CryptoError::InvalidFormat(format!("decrypted config is not JSON: {e}")))
    }
}

/// Returns `true` if `value` is an `ENC[AES256-GCM,...]` envelope.
pub fn is_envelope(value: &str) -> bool {
    ENC_RE.is_match(value.trim())
}

fn encrypt_value(plaintext: &str, key: &MasterKey) -> Result<String, CryptoError> {
    use aes_gcm::AeadCore;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("invalid AES key: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // AES-GCM output = ciphertext_data || 16-byte tag.
    let (data, tag) = ciphertext.split_at(ciphertext.len() - 16);

    Ok(format!(
        "ENC[AES256-GCM,data:{},iv:{},tag:{}]",
        B64.encode(data),
        B64.encode(nonce.as_slice()),
        B64.encode(tag),
    ))
}

fn decrypt_value(envelope: &str, key: &MasterKey) -> Result<String, CryptoError> {
    let caps = ENC_RE
        .captures(envelope.trim())
        .ok_or_else(|| CryptoError::InvalidFormat("not an ENC envelope".to_owned()))?;

    let data = B64
        .decode(&caps[1])
        .map_err(|e| CryptoError::InvalidFormat(format!("invalid base64 in data: {e}")))?;
    let iv = B64
        .decode(&caps[2])
        .map_err(|e| CryptoError::InvalidFormat(format!("invalid base64 in iv: {e}")))?;
    let tag = B64
        .decode(&caps[3])
        .map_err(|e| CryptoError::InvalidFormat(format!("invalid base64 in tag: {e}")))?;

    if iv.len() != 12 {
        return Err(CryptoError::InvalidFormat(format!(
            "IV must be 12 bytes, got {}",
            iv.len()
        )));
    }
    if tag.len() != 16 {
        return Err(CryptoError::InvalidFormat(format!(
            "tag must be 16 bytes, got {}",
            tag.len()
        )));
    }

    // AES-GCM ciphertext = data || tag.
    let mut ciphertext = data;
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("invalid AES key: {e}")))?;
    let nonce = Nonce::from_slice(&iv);

    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::InvalidFormat(format!("decrypted value is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        parse_master_key(&"42".repeat(32)).unwrap()
    }

    #[test]
    fn roundtrip_json_object() {
        let cipher = ConfigCipher::aes_gcm(test_key());
        let config = serde_json::json!({"schedule": "0 * * * *", "jitter_ms": 250});
        let stored = cipher.encrypt(&config).unwrap();
        assert!(stored.as_str().unwrap().starts_with("ENC[AES256-GCM,"));
        let back = cipher.decrypt(&stored).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn plaintext_mode_passes_through() {
        let cipher = ConfigCipher::plaintext();
        let config = serde_json::json!({"url": "https://example.com"});
        assert_eq!(cipher.encrypt(&config).unwrap(), config);
        assert_eq!(cipher.decrypt(&config).unwrap(), config);
    }

    #[test]
    fn decrypt_passes_through_plain_string() {
        let cipher = ConfigCipher::aes_gcm(test_key());
        let stored = serde_json::json!("not-an-envelope");
        assert_eq!(cipher.decrypt(&stored).unwrap(), stored);
    }

    #[test]
    fn envelope_in_plaintext_mode_is_an_error() {
        let sealing = ConfigCipher::aes_gcm(test_key());
        let stored = sealing.encrypt(&serde_json::json!({"a": 1})).unwrap();

        // A cipher without the key must refuse, not pass opaque bytes through.
        let plain = ConfigCipher::plaintext();
        let err = plain.decrypt(&stored).unwrap_err();
        assert!(matches!(err, CryptoError::KeyRequired));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = ConfigCipher::aes_gcm(test_key());
        let stored = cipher.encrypt(&serde_json::json!({"a": 1})).unwrap();

        let other = ConfigCipher::aes_gcm(parse_master_key(&"17".repeat(32)).unwrap());
        let err = other.decrypt(&stored).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn from_settings_requires_key_for_aes_gcm() {
        let err =
            ConfigCipher::from_settings(ConfigEncryptionMode::AesGcm, None, false).unwrap_err();
        assert!(matches!(err, CryptoError::KeyRequired));
    }

    #[test]
    fn from_settings_degrades_when_fallback_allowed() {
        let cipher =
            ConfigCipher::from_settings(ConfigEncryptionMode::AesGcm, None, true).unwrap();
        assert_eq!(cipher.mode(), ConfigEncryptionMode::None);

        let cipher =
            ConfigCipher::from_settings(ConfigEncryptionMode::AesGcm, Some("bogus"), true).unwrap();
        assert_eq!(cipher.mode(), ConfigEncryptionMode::None);
    }

    #[test]
    fn parse_hex_and_base64_keys() {
        assert!(parse_master_key(&"aa".repeat(32)).is_ok());
        assert!(parse_master_key(&B64.encode([0xbb_u8; 32])).is_ok());
        assert!(matches!(
            parse_master_key("too-short"),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn master_key_debug_is_redacted() {
        let key = test_key();
        assert_eq!(format!("{key:?}"), "MasterKey([REDACTED])");
    }
}
