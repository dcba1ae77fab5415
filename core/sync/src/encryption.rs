//! Switching payload encryption on and off.
//!
//! Encrypted and plaintext ops must never coexist remotely, so every switch
//! wipes the remote and re-uploads the whole local state as one snapshot.
//! The order is fixed: probe the primitive, wipe, write the new config,
//! upload, record the new cursor. Turning encryption off defers the config
//! write until the plaintext upload succeeded.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tasksync_common::{Error, Result, SyncImportReason};
use tasksync_crypto::{EncryptionSecret, PayloadCipher};
use tasksync_provider::{SyncProvider, SyncProviderPrivateCfg};

use crate::cipher::decrypt_op;
use crate::config::Settings;
use crate::engine::SyncEngine;
use crate::observer::Alert;

/// A failed switch, split by whether the remote was already wiped.
enum SwitchFailure {
    RemoteUntouched(Error),
    RemoteWiped(Error),
}

impl SyncEngine {
    /// Encrypt with a user passphrase from now on.
    ///
    /// # Errors
    /// - `CryptoUnavailable` before anything was touched
    /// - `Critical` when the upload failed after the remote was wiped; the
    ///   previous config is restored and local data is intact
    pub async fn enable_encryption(&self, passphrase: &str) -> Result<()> {
        if passphrase.is_empty() {
            return Err(Error::InvalidInput("Passphrase must not be empty".to_string()));
        }
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_crypto()?;

        let previous = self.config_store.load().await?;
        let next_cfg = previous.active()?.1.with_manual_key(passphrase);
        let provider = self.provider().await;
        match self.switch_to(&provider, &previous, next_cfg).await {
            Ok(()) => {
                info!("Encryption enabled");
                Ok(())
            }
            Err(failure) => self.escalate_enable(&previous, failure).await,
        }
    }

    /// Encrypt with the server-derived key from now on.
    pub async fn enable_auto_encryption(&self) -> Result<()> {
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_crypto()?;

        let provider = self.provider().await;
        let key = self
            .remote("encryption key", || provider.fetch_auto_encryption_key())
            .await?;
        let previous = self.config_store.load().await?;
        let next_cfg = previous.active()?.1.with_auto_key(key);
        match self.switch_to(&provider, &previous, next_cfg).await {
            Ok(()) => {
                self.auto_migration_done.store(true, Ordering::SeqCst);
                info!("Auto-encryption enabled");
                Ok(())
            }
            Err(failure) => self.escalate_enable(&previous, failure).await,
        }
    }

    /// Stop encrypting. The remote is wiped and re-uploaded in plaintext;
    /// the config only changes once that upload succeeded.
    pub async fn disable_encryption(&self) -> Result<()> {
        let _cycle = self.cycle_lock.lock().await;
        let previous = self.config_store.load().await?;
        let cfg = previous.active()?.1;
        if !cfg.is_encrypted() {
            debug!("Encryption already disabled");
            return Ok(());
        }
        let next = previous.with_active_cfg(cfg.without_encryption())?;
        next.validate()?;

        let provider = self.provider().await;
        self.remote("delete", || provider.delete_all_data()).await?;

        let uploaded = self.upload_current_state(&provider, None).await;
        if let Err(e) = uploaded {
            let message = format!(
                "Disabling encryption failed after the remote data was deleted: {}. Your local \
                 data is safe and encryption is still enabled. Please use Sync Now to re-upload \
                 your data.",
                e
            );
            error!("{}", message);
            self.observer.on_alert(&Alert::Critical(message.clone()));
            return Err(Error::Critical(message));
        }
        self.config_store.save(&next).await?;
        info!("Encryption disabled");
        Ok(())
    }

    fn ensure_crypto(&self) -> Result<()> {
        if (self.crypto_probe)() {
            Ok(())
        } else {
            Err(Error::CryptoUnavailable(
                "The encryption primitive is not available on this device".to_string(),
            ))
        }
    }

    /// Wipe the remote, write the new config, upload everything sealed with
    /// the new secret.
    async fn switch_to(
        &self,
        provider: &Arc<dyn SyncProvider>,
        previous: &Settings,
        next_cfg: SyncProviderPrivateCfg,
    ) -> std::result::Result<(), SwitchFailure> {
        let next = previous
            .with_active_cfg(next_cfg.clone())
            .and_then(|next| next.validate().map(|_| next))
            .map_err(SwitchFailure::RemoteUntouched)?;
        let cipher = self
            .ciphers
            .for_cfg(&next_cfg)
            .map_err(SwitchFailure::RemoteUntouched)?;

        self.remote("delete", || provider.delete_all_data())
            .await
            .map_err(SwitchFailure::RemoteUntouched)?;
        self.config_store
            .save(&next)
            .await
            .map_err(SwitchFailure::RemoteWiped)?;
        self.upload_current_state(provider, cipher.as_deref())
            .await
            .map_err(SwitchFailure::RemoteWiped)?;
        info!("Remote data re-uploaded with the new encryption settings");
        Ok(())
    }

    async fn upload_current_state(
        &self,
        provider: &Arc<dyn SyncProvider>,
        cipher: Option<&PayloadCipher>,
    ) -> Result<()> {
        let state = self.store.current_state()?;
        let op = self
            .store
            .record_import(&state, SyncImportReason::PasswordChanged)?;
        let seq = self.upload_import(provider, cipher, &op).await?;
        self.store.set_last_server_seq(seq)?;
        self.store.set_sync_target(&provider.account_key())
    }

    /// Put the previous config back after a wipe.
    async fn restore_settings(&self, previous: &Settings) {
        if let Err(e) = self.config_store.save(previous).await {
            error!("Failed to restore previous sync settings: {}", e);
        }
    }

    async fn escalate_enable(&self, previous: &Settings, failure: SwitchFailure) -> Result<()> {
        match failure {
            SwitchFailure::RemoteUntouched(e) => Err(e),
            SwitchFailure::RemoteWiped(e) => {
                self.restore_settings(previous).await;
                let message = format!(
                    "Enabling encryption failed after the remote data was deleted: {}. Your \
                     local data is safe and your previous settings were restored. Please use \
                     Sync Now to re-upload your data.",
                    e
                );
                error!("{}", message);
                self.observer.on_alert(&Alert::Critical(message.clone()));
                Err(Error::Critical(message))
            }
        }
    }

    /// Move an unencrypted account to the server-derived key. Failures are
    /// logged and retried on the next cycle.
    pub(crate) async fn maybe_migrate_to_auto_encryption(&self) {
        if !self.config.auto_encryption_enabled
            || self.auto_migration_done.load(Ordering::SeqCst)
            || self.key_endpoint_unsupported.load(Ordering::SeqCst)
        {
            return;
        }
        let Ok(settings) = self.config_store.load().await else {
            return;
        };
        let Ok((_, cfg)) = settings.active() else {
            return;
        };
        if cfg.is_encrypted() {
            return;
        }
        if !(self.crypto_probe)() {
            debug!("Skipping auto-encryption: primitive unavailable");
            return;
        }

        match self.migrate_to_auto_encryption(&settings).await {
            Ok(true) => {
                self.auto_migration_done.store(true, Ordering::SeqCst);
                info!("Auto-encryption enabled");
            }
            Ok(false) => {}
            Err(Error::NotSupported(msg)) => {
                self.key_endpoint_unsupported.store(true, Ordering::SeqCst);
                info!("Auto-encryption not offered by this server: {}", msg);
            }
            Err(e) => warn!("Auto-encryption migration failed, retrying next cycle: {}", e),
        }
    }

    async fn migrate_to_auto_encryption(&self, previous: &Settings) -> Result<bool> {
        let provider = self.provider().await;
        let key = self
            .remote("encryption key", || provider.fetch_auto_encryption_key())
            .await?;
        let server_cipher =
            PayloadCipher::new(EncryptionSecret::from_base64_key(&key)?, self.config.kdf);
        let next_cfg = previous.active()?.1.with_auto_key(key);

        let first = self
            .remote("download", || provider.download_ops(0, 1))
            .await?;
        if let Some(first) = first.ops.first().filter(|r| r.op.is_payload_encrypted) {
            if let Err(e) = decrypt_op(&first.op, Some(&server_cipher)) {
                return Err(Error::Crypto(format!(
                    "Remote is encrypted with a secret other than the server key: {}",
                    e
                )));
            }
            info!("Remote already uses the server key; adopting it");
            self.config_store
                .save(&previous.with_active_cfg(next_cfg)?)
                .await?;
            return Ok(true);
        }

        let unseen = self.unseen_remote_ops(&provider).await?;
        if unseen > 0 {
            debug!("Deferring auto-encryption until {} remote ops are applied", unseen);
            return Ok(false);
        }

        match self.switch_to(&provider, previous, next_cfg).await {
            Ok(()) => Ok(true),
            Err(SwitchFailure::RemoteUntouched(e)) => Err(e),
            Err(SwitchFailure::RemoteWiped(e)) => {
                self.restore_settings(previous).await;
                Err(e)
            }
        }
    }
}
