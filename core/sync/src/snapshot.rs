//! Full-state snapshot uploads.

use std::sync::Arc;
use tracing::info;

use tasksync_common::{Error, OpId, Operation, Result, SyncImportReason};
use tasksync_crypto::PayloadCipher;
use tasksync_provider::{SnapshotUpload, SyncProvider};

use crate::cipher::encrypt_op;
use crate::engine::SyncEngine;
use crate::status::{SyncOutcome, SyncStatus};

impl SyncEngine {
    /// Upload a recorded SyncImport as a full replace and settle it locally.
    /// Returns the server sequence it was stored at.
    pub(crate) async fn upload_import(
        &self,
        provider: &Arc<dyn SyncProvider>,
        cipher: Option<&PayloadCipher>,
        op: &Operation,
    ) -> Result<u64> {
        let reason = op.sync_import_reason.unwrap_or(SyncImportReason::ForceUpload);
        let sealed = encrypt_op(op, cipher)?;
        let upload = SnapshotUpload::from_operation(&sealed, reason);

        let response = self
            .remote("snapshot upload", || provider.upload_snapshot(&upload))
            .await?;
        if !response.accepted {
            return Err(Error::Network(format!(
                "Snapshot refused by server: {}",
                response.error.as_deref().unwrap_or("no reason given")
            )));
        }

        self.settle_import(op)?;
        info!(
            "Uploaded full state ({}) at server seq {}",
            reason, response.server_seq
        );
        Ok(response.server_seq)
    }

    /// Mark an uploaded import and every older pending op synced; the import
    /// already carries their effect.
    fn settle_import(&self, op: &Operation) -> Result<()> {
        let pending = self.store.pending_ops(usize::MAX)?;
        let ids: Vec<OpId> = match pending.iter().position(|p| p.id == op.id) {
            Some(pos) => pending[..=pos].iter().map(|p| p.id.clone()).collect(),
            None => vec![op.id.clone()],
        };
        self.store.mark_synced(&ids)
    }

    /// Record the current state as a forced import and upload it.
    pub(crate) async fn force_upload_locked(
        &self,
        provider: &Arc<dyn SyncProvider>,
        cipher: Option<&PayloadCipher>,
        outcome: &mut SyncOutcome,
    ) -> Result<u64> {
        let state = self.store.current_state()?;
        let op = self
            .store
            .record_import(&state, SyncImportReason::ForceUpload)?;
        let seq = self.upload_import(provider, cipher, &op).await?;
        outcome.import_uploaded = true;
        Ok(seq)
    }

    /// Replace what other devices see with the local state. Runs with
    /// regular cycles blocked.
    pub async fn force_upload(&self) -> Result<u64> {
        let _cycle = self.cycle_lock.lock().await;
        let settings = self.config_store.load().await?;
        let (_, cfg) = settings.active()?;
        let cipher = self.ciphers.for_cfg(cfg)?;
        let provider = self.provider().await;

        let mut outcome = SyncOutcome::new(SyncStatus::InSync);
        self.force_upload_locked(&provider, cipher.as_deref(), &mut outcome)
            .await
    }
}
