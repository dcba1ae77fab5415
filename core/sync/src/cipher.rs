//! Payload encryption applied at the sync boundary.
//!
//! Operations are stored locally in plaintext and only encrypted on the way
//! out. A cipher is built per configured secret and reused while the secret
//! stays the same, so passphrase key derivation runs once per session.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;

use tasksync_common::{Error, Operation, Result};
use tasksync_crypto::{payload_mode, EncryptionSecret, KdfParams, PayloadCipher};
use tasksync_provider::SyncProviderPrivateCfg;

#[derive(Clone, PartialEq, Eq)]
enum SecretId {
    Manual(String),
    Auto(String),
}

impl SecretId {
    fn of(cfg: &SyncProviderPrivateCfg) -> Option<Self> {
        match (&cfg.encrypt_key, &cfg.auto_encryption_key) {
            (Some(passphrase), _) if cfg.is_encryption_enabled => {
                Some(SecretId::Manual(passphrase.clone()))
            }
            (_, Some(key)) if cfg.is_auto_encryption_enabled => Some(SecretId::Auto(key.clone())),
            _ => None,
        }
    }

    fn secret(&self) -> Result<EncryptionSecret> {
        match self {
            SecretId::Manual(passphrase) => Ok(EncryptionSecret::passphrase(passphrase)),
            SecretId::Auto(key) => EncryptionSecret::from_base64_key(key),
        }
    }
}

/// Caches the cipher for the configured secret.
pub struct CipherCache {
    kdf_params: KdfParams,
    current: Mutex<Option<(SecretId, Arc<PayloadCipher>)>>,
}

impl CipherCache {
    /// Empty cache; passphrase ciphers derive keys with `kdf_params`.
    pub fn new(kdf_params: KdfParams) -> Self {
        Self {
            kdf_params,
            current: Mutex::new(None),
        }
    }

    /// Cipher for `cfg`, `None` when encryption is off.
    pub fn for_cfg(&self, cfg: &SyncProviderPrivateCfg) -> Result<Option<Arc<PayloadCipher>>> {
        let Some(id) = SecretId::of(cfg) else {
            return Ok(None);
        };
        let mut current = self
            .current
            .lock()
            .map_err(|_| Error::Crypto("Cipher cache poisoned".to_string()))?;
        if let Some((cached_id, cipher)) = current.as_ref() {
            if *cached_id == id {
                return Ok(Some(Arc::clone(cipher)));
            }
        }
        debug!("Building payload cipher for new secret");
        let cipher = Arc::new(PayloadCipher::new(id.secret()?, self.kdf_params));
        *current = Some((id, Arc::clone(&cipher)));
        Ok(Some(cipher))
    }
}

/// Copy of `op` ready for upload: payload sealed when a cipher is given.
pub fn encrypt_op(op: &Operation, cipher: Option<&PayloadCipher>) -> Result<Operation> {
    let mut out = op.clone();
    if let Some(cipher) = cipher {
        if !op.is_payload_encrypted {
            out.payload = Value::String(cipher.encrypt_value(&op.payload)?);
            out.is_payload_encrypted = true;
        }
    }
    Ok(out)
}

/// Plaintext copy of a downloaded `op`.
///
/// # Errors
/// - Payload is encrypted and no cipher is configured
/// - Wrong secret or tampered payload
pub fn decrypt_op(op: &Operation, cipher: Option<&PayloadCipher>) -> Result<Operation> {
    if !op.is_payload_encrypted {
        return Ok(op.clone());
    }
    let cipher = cipher.ok_or_else(|| {
        Error::Crypto(format!(
            "Op {} is encrypted but no encryption key is configured",
            op.id
        ))
    })?;
    let encoded = op.payload.as_str().ok_or_else(|| {
        Error::Crypto(format!("Op {} encrypted payload is not a string", op.id))
    })?;
    let mut out = op.clone();
    out.payload = cipher.decrypt_value(encoded)?;
    out.is_payload_encrypted = false;
    Ok(out)
}

/// Why a downloaded op could not be opened.
#[derive(Debug)]
pub enum OpenFailure {
    /// The payload is not a sealed frame at all.
    Corrupt(Error),
    /// A sealed frame the configured secret cannot open.
    Locked(Error),
}

/// Like [`decrypt_op`], but tells a damaged payload apart from one sealed
/// under a secret this device does not have.
pub fn open_op(
    op: &Operation,
    cipher: Option<&PayloadCipher>,
) -> std::result::Result<Operation, OpenFailure> {
    if !op.is_payload_encrypted {
        return Ok(op.clone());
    }
    let well_formed = op.payload.as_str().and_then(payload_mode).is_some();
    if !well_formed {
        return Err(OpenFailure::Corrupt(Error::Crypto(format!(
            "Op {} carries a malformed encrypted payload",
            op.id
        ))));
    }
    decrypt_op(op, cipher).map_err(OpenFailure::Locked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasksync_common::{ClientId, OpType, VectorClock};
    use tasksync_crypto::EncryptionKey;

    fn op() -> Operation {
        let client = ClientId::new("a").unwrap();
        Operation::new(
            client.clone(),
            VectorClock::new().increment(&client),
            "task",
            "t1",
            OpType::Create,
            json!({"title": "secret plans"}),
        )
    }

    fn cfg() -> SyncProviderPrivateCfg {
        SyncProviderPrivateCfg::new("https://sync.example", "t")
    }

    #[test]
    fn test_no_cipher_when_unencrypted() {
        let cache = CipherCache::new(KdfParams::insecure_fast());
        assert!(cache.for_cfg(&cfg()).unwrap().is_none());
        assert_eq!(encrypt_op(&op(), None).unwrap(), op());
    }

    #[test]
    fn test_cipher_reused_until_secret_changes() {
        let cache = CipherCache::new(KdfParams::insecure_fast());
        let manual = cfg().with_manual_key("pw");
        let a = cache.for_cfg(&manual).unwrap().unwrap();
        let b = cache.for_cfg(&manual).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.for_cfg(&cfg().with_manual_key("other")).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_seal_and_open_across_ciphers() {
        let key = EncryptionKey::generate().to_base64();
        let writer = CipherCache::new(KdfParams::insecure_fast());
        let reader = CipherCache::new(KdfParams::insecure_fast());
        let auto = cfg().with_auto_key(key);

        let sealed = encrypt_op(&op(), writer.for_cfg(&auto).unwrap().as_deref()).unwrap();
        assert!(sealed.is_payload_encrypted);
        assert!(!sealed.payload.to_string().contains("secret plans"));

        let opened = decrypt_op(&sealed, reader.for_cfg(&auto).unwrap().as_deref()).unwrap();
        assert_eq!(opened, op());
    }

    #[test]
    fn test_encrypted_without_key_fails() {
        let cache = CipherCache::new(KdfParams::insecure_fast());
        let sealed = encrypt_op(
            &op(),
            cache.for_cfg(&cfg().with_manual_key("pw")).unwrap().as_deref(),
        )
        .unwrap();
        assert!(matches!(decrypt_op(&sealed, None), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_open_separates_damage_from_wrong_secret() {
        let cache = CipherCache::new(KdfParams::insecure_fast());
        let cipher = cache.for_cfg(&cfg().with_manual_key("pw")).unwrap();
        let sealed = encrypt_op(&op(), cipher.as_deref()).unwrap();
        assert_eq!(open_op(&sealed, cipher.as_deref()).unwrap(), op());

        let mut damaged = sealed.clone();
        damaged.payload = json!("bm90IGEgcmVhbCBjaXBoZXJ0ZXh0");
        assert!(matches!(
            open_op(&damaged, cipher.as_deref()),
            Err(OpenFailure::Corrupt(_))
        ));

        let other = CipherCache::new(KdfParams::insecure_fast());
        let wrong = other.for_cfg(&cfg().with_manual_key("other")).unwrap();
        assert!(matches!(
            open_op(&sealed, wrong.as_deref()),
            Err(OpenFailure::Locked(_))
        ));
        assert!(matches!(open_op(&sealed, None), Err(OpenFailure::Locked(_))));
    }
}
