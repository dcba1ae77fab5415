//! Per-provider private configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

use tasksync_common::{Error, Result};

/// Credentials and encryption settings for one sync provider.
///
/// `encrypt_key` (a user passphrase) and `auto_encryption_key` (a
/// server-derived base64 key) are mutually exclusive, and each enabled flag
/// agrees with the presence of its key. Build modified copies through
/// [`with_manual_key`](Self::with_manual_key),
/// [`with_auto_key`](Self::with_auto_key) and
/// [`without_encryption`](Self::without_encryption) so every write keeps
/// that shape.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProviderPrivateCfg {
    pub base_url: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub is_encryption_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key: Option<String>,
    #[serde(default)]
    pub is_auto_encryption_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_encryption_key: Option<String>,
}

impl SyncProviderPrivateCfg {
    /// Unencrypted configuration for a remote.
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: access_token.into(),
            refresh_token: None,
            is_encryption_enabled: false,
            encrypt_key: None,
            is_auto_encryption_enabled: false,
            auto_encryption_key: None,
        }
    }

    /// Check the structural invariants.
    ///
    /// # Errors
    /// - empty base URL
    /// - both key kinds present
    /// - an enabled flag disagreeing with its key
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("baseUrl must not be empty".to_string()));
        }
        if self.encrypt_key.is_some() && self.auto_encryption_key.is_some() {
            return Err(Error::Config(
                "encryptKey and autoEncryptionKey are mutually exclusive".to_string(),
            ));
        }
        if self.is_encryption_enabled != self.encrypt_key.is_some() {
            return Err(Error::Config(
                "isEncryptionEnabled must match presence of encryptKey".to_string(),
            ));
        }
        if self.is_auto_encryption_enabled != self.auto_encryption_key.is_some() {
            return Err(Error::Config(
                "isAutoEncryptionEnabled must match presence of autoEncryptionKey".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy switched to manual (passphrase) encryption.
    pub fn with_manual_key(&self, passphrase: impl Into<String>) -> Self {
        Self {
            is_encryption_enabled: true,
            encrypt_key: Some(passphrase.into()),
            is_auto_encryption_enabled: false,
            auto_encryption_key: None,
            ..self.clone()
        }
    }

    /// Copy switched to server-derived encryption.
    pub fn with_auto_key(&self, key_base64: impl Into<String>) -> Self {
        Self {
            is_encryption_enabled: false,
            encrypt_key: None,
            is_auto_encryption_enabled: true,
            auto_encryption_key: Some(key_base64.into()),
            ..self.clone()
        }
    }

    /// Copy with encryption off.
    pub fn without_encryption(&self) -> Self {
        Self {
            is_encryption_enabled: false,
            encrypt_key: None,
            is_auto_encryption_enabled: false,
            auto_encryption_key: None,
            ..self.clone()
        }
    }

    /// Whether either encryption mode is on.
    pub fn is_encrypted(&self) -> bool {
        self.is_encryption_enabled || self.is_auto_encryption_enabled
    }
}

impl fmt::Debug for SyncProviderPrivateCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncProviderPrivateCfg")
            .field("base_url", &self.base_url)
            .field("access_token", &"[REDACTED]")
            .field("is_encryption_enabled", &self.is_encryption_enabled)
            .field("is_auto_encryption_enabled", &self.is_auto_encryption_enabled)
            .finish()
    }
}
