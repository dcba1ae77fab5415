//! Encryption of operation payloads.
//!
//! Payloads are JSON values. Encrypted payloads travel as a base64 string:
//!
//! ```text
//! 0x01 || salt(16) || nonce(24) || ciphertext || tag   passphrase mode
//! 0x02 || nonce(24) || ciphertext || tag               raw key mode
//! ```
//!
//! Passphrase mode derives the key with Argon2id per salt. One salt is used
//! for everything a cipher instance encrypts, and derived keys are cached per
//! salt so decrypting a large batch pays the KDF cost once per writer.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::aead::{self, NONCE_SIZE, TAG_SIZE};
use crate::kdf::{derive_key, KdfParams};
use crate::keys::{EncryptionKey, Salt, SALT_LENGTH};
use tasksync_common::{Error, Result, SensitiveBytes};

const MODE_PASSPHRASE: u8 = 0x01;
const MODE_RAW_KEY: u8 = 0x02;

/// Which kind of secret sealed a payload frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    Passphrase,
    RawKey,
}

/// Mode of a sealed wire payload, `None` when it is not a well-formed frame.
///
/// Only the header and length are checked. A well-formed frame can still
/// fail to open under the wrong secret.
pub fn payload_mode(encoded: &str) -> Option<PayloadMode> {
    let framed = STANDARD.decode(encoded).ok()?;
    let (&mode, rest) = framed.split_first()?;
    match mode {
        MODE_PASSPHRASE if rest.len() >= SALT_LENGTH + NONCE_SIZE + TAG_SIZE => {
            Some(PayloadMode::Passphrase)
        }
        MODE_RAW_KEY if rest.len() >= NONCE_SIZE + TAG_SIZE => Some(PayloadMode::RawKey),
        _ => None,
    }
}

/// Secret material a payload cipher works from.
#[derive(Clone)]
pub enum EncryptionSecret {
    /// User-chosen passphrase (manual encryption).
    Passphrase(SensitiveBytes),
    /// Ready-made 256-bit key (auto-encryption).
    Key(EncryptionKey),
}

impl EncryptionSecret {
    /// Passphrase secret from a string.
    pub fn passphrase(passphrase: &str) -> Self {
        Self::Passphrase(SensitiveBytes::new(passphrase.as_bytes().to_vec()))
    }

    /// Raw key secret from the base64 form served by the key endpoint.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        Ok(Self::Key(EncryptionKey::from_base64(encoded)?))
    }
}

impl std::fmt::Debug for EncryptionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passphrase(_) => write!(f, "EncryptionSecret::Passphrase([REDACTED])"),
            Self::Key(_) => write!(f, "EncryptionSecret::Key([REDACTED])"),
        }
    }
}

/// Encrypts and decrypts operation payloads with one secret.
pub struct PayloadCipher {
    secret: EncryptionSecret,
    kdf_params: KdfParams,
    session_salt: Salt,
    derived: Mutex<HashMap<Salt, EncryptionKey>>,
}

impl PayloadCipher {
    /// Create a cipher for `secret`.
    pub fn new(secret: EncryptionSecret, kdf_params: KdfParams) -> Self {
        Self {
            secret,
            kdf_params,
            session_salt: Salt::generate(),
            derived: Mutex::new(HashMap::new()),
        }
    }

    fn key_for_salt(&self, passphrase: &SensitiveBytes, salt: &Salt) -> Result<EncryptionKey> {
        let mut cache = self
            .derived
            .lock()
            .map_err(|_| Error::Crypto("Key cache poisoned".to_string()))?;
        if let Some(key) = cache.get(salt) {
            return Ok(key.clone());
        }
        let key = derive_key(passphrase.as_bytes(), salt, &self.kdf_params)?;
        cache.insert(*salt, key.clone());
        Ok(key)
    }

    /// Encrypt raw bytes into the framed binary form.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &self.secret {
            EncryptionSecret::Passphrase(passphrase) => {
                let key = self.key_for_salt(passphrase, &self.session_salt)?;
                let sealed = aead::encrypt(key.as_bytes(), plaintext)?;
                let mut framed = Vec::with_capacity(1 + SALT_LENGTH + sealed.len());
                framed.push(MODE_PASSPHRASE);
                framed.extend_from_slice(self.session_salt.as_bytes());
                framed.extend_from_slice(&sealed);
                Ok(framed)
            }
            EncryptionSecret::Key(key) => {
                let sealed = aead::encrypt(key.as_bytes(), plaintext)?;
                let mut framed = Vec::with_capacity(1 + sealed.len());
                framed.push(MODE_RAW_KEY);
                framed.extend_from_slice(&sealed);
                Ok(framed)
            }
        }
    }

    /// Decrypt the framed binary form.
    ///
    /// # Errors
    /// - Frame mode does not match this cipher's secret kind
    /// - Authentication fails (wrong passphrase/key or tampering)
    pub fn decrypt_bytes(&self, framed: &[u8]) -> Result<Vec<u8>> {
        let (&mode, rest) = framed
            .split_first()
            .ok_or_else(|| Error::Crypto("Empty ciphertext".to_string()))?;

        match (mode, &self.secret) {
            (MODE_PASSPHRASE, EncryptionSecret::Passphrase(passphrase)) => {
                if rest.len() < SALT_LENGTH {
                    return Err(Error::Crypto("Ciphertext too short".to_string()));
                }
                let (salt_bytes, sealed) = rest.split_at(SALT_LENGTH);
                let mut salt = [0u8; SALT_LENGTH];
                salt.copy_from_slice(salt_bytes);
                let key = self.key_for_salt(passphrase, &Salt::from_bytes(salt))?;
                aead::decrypt(key.as_bytes(), sealed)
            }
            (MODE_RAW_KEY, EncryptionSecret::Key(key)) => aead::decrypt(key.as_bytes(), rest),
            (MODE_PASSPHRASE, EncryptionSecret::Key(_)) => Err(Error::Crypto(
                "Payload was encrypted with a passphrase, but only a key is configured"
                    .to_string(),
            )),
            (MODE_RAW_KEY, EncryptionSecret::Passphrase(_)) => Err(Error::Crypto(
                "Payload was encrypted with a server key, but a passphrase is configured"
                    .to_string(),
            )),
            (other, _) => Err(Error::Crypto(format!("Unknown payload mode {:#04x}", other))),
        }
    }

    /// Encrypt a JSON value into its base64 wire string.
    pub fn encrypt_value(&self, value: &Value) -> Result<String> {
        let plaintext = serde_json::to_vec(value)?;
        Ok(STANDARD.encode(self.encrypt_bytes(&plaintext)?))
    }

    /// Decrypt a base64 wire string back into a JSON value.
    pub fn decrypt_value(&self, encoded: &str) -> Result<Value> {
        let framed = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("Invalid base64 payload: {}", e)))?;
        let plaintext = self.decrypt_bytes(&framed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Whether the AEAD primitive works on this platform.
///
/// Runs a one-shot seal/open self test. Destructive flows call this before
/// touching the remote so a broken primitive can never strand data.
pub fn is_available() -> bool {
    let key = EncryptionKey::generate();
    match aead::encrypt(key.as_bytes(), b"probe") {
        Ok(sealed) => matches!(aead::decrypt(key.as_bytes(), &sealed), Ok(p) if p == b"probe"),
        Err(_) => false,
    }
}
