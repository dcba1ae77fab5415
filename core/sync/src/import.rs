//! Deciding between a full-state import and incremental sync.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use tasksync_common::{OpId, Operation, Result, SyncImportReason};
use tasksync_crypto::PayloadCipher;
use tasksync_oplog::{backup_from_state, migrate_legacy_backup, state_from_backup, WriteStamp};
use tasksync_provider::SyncProvider;

use crate::conflict::{ImportConflict, ImportConflictScenario, ImportResolution};
use crate::engine::{Flow, SyncEngine};
use crate::status::SyncOutcome;

impl SyncEngine {
    /// Import local history into a freshly selected, empty remote.
    ///
    /// Runs when the remote target changed since the last successful cycle,
    /// this log has synced before, and the new remote holds no ops. The
    /// remote is checked again right before uploading; if another device
    /// populated it meanwhile, the cycle falls back to incremental sync.
    pub(crate) async fn check_server_migration(
        &self,
        provider: &Arc<dyn SyncProvider>,
        cipher: Option<&PayloadCipher>,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        let target = provider.account_key();
        let previous = self.store.sync_target()?;
        if previous.as_deref() == Some(target.as_str()) {
            return Ok(());
        }
        let Some(previous) = previous else {
            return Ok(());
        };
        info!("Sync target changed from {} to {}", previous, target);
        self.store.set_last_server_seq(0)?;

        if !self.store.has_synced_ops()? || !self.remote_is_empty(provider).await? {
            return Ok(());
        }
        let state = self.store.current_state()?;
        if state.is_empty() {
            debug!("Nothing to migrate to the new remote");
            return Ok(());
        }

        if !self.remote_is_empty(provider).await? {
            info!("New remote was populated meanwhile; using incremental sync");
            return Ok(());
        }
        let op = self
            .store
            .record_import(&state, SyncImportReason::ServerMigration)?;
        self.upload_import(provider, cipher, &op).await?;
        outcome.import_uploaded = true;
        Ok(())
    }

    async fn remote_is_empty(&self, provider: &Arc<dyn SyncProvider>) -> Result<bool> {
        let page = self
            .remote("download", || provider.download_ops(0, 1))
            .await?;
        Ok(page.ops.is_empty())
    }

    /// Remote ops past the cursor written by other devices and not yet
    /// reflected locally.
    pub(crate) async fn unseen_remote_ops(&self, provider: &Arc<dyn SyncProvider>) -> Result<usize> {
        let since = self.store.last_server_seq()?;
        let applied = self.store.applied_clock()?;
        let own = self.store.client_id();
        Ok(self
            .download_since(provider, since)
            .await?
            .iter()
            .filter(|r| r.op.client_id != *own && !r.op.is_duplicate_of(&applied))
            .count())
    }

    /// Upload the newest pending local import, asking first when it would
    /// supersede remote changes this device has not seen.
    pub(crate) async fn upload_pending_import(
        &self,
        provider: &Arc<dyn SyncProvider>,
        cipher: Option<&PayloadCipher>,
        outcome: &mut SyncOutcome,
    ) -> Result<Flow> {
        let pending = self.store.pending_ops(usize::MAX)?;
        let Some(import) = pending.iter().rev().find(|op| op.is_full_state()) else {
            return Ok(Flow::Continue);
        };

        let unseen = self.unseen_remote_ops(provider).await?;
        if unseen > 0 {
            let conflict = ImportConflict {
                scenario: ImportConflictScenario::LocalImportFiltersRemote,
                reason: import
                    .sync_import_reason
                    .unwrap_or(SyncImportReason::ForceUpload),
                affected_ops: unseen,
            };
            match self.conflicts.resolve(&conflict).await {
                ImportResolution::UseLocal => {
                    info!("Uploading local import over {} unseen remote ops", unseen);
                }
                ImportResolution::UseRemote => {
                    info!("Dropping local import; rebuilding from the remote");
                    self.store.reset_for_remote_rebuild()?;
                    return Ok(Flow::Continue);
                }
                ImportResolution::Cancel => {
                    self.disable_sync(conflict);
                    outcome.fail("Sync disabled: import conflict left unresolved");
                    return Ok(Flow::Halt);
                }
            }
        }

        self.upload_import(provider, cipher, import).await?;
        outcome.import_uploaded = true;
        Ok(Flow::Continue)
    }

    /// Replace local state with a backup document and queue it for upload
    /// as a full-state import. Legacy documents are migrated first.
    pub fn import_backup(&self, document: &Value, reason: SyncImportReason) -> Result<Operation> {
        let migrated = migrate_legacy_backup(document)?;
        let stamp = WriteStamp {
            clock_sum: self.store.local_clock()?.sum(),
            timestamp: Utc::now().timestamp_millis(),
            client_id: self.store.client_id().clone(),
            op_id: OpId::generate(),
        };
        let state = state_from_backup(&migrated, &stamp)?;
        info!(
            "Importing backup with {} entities ({})",
            state.visible_count(),
            reason
        );
        self.store.record_import(&state, reason)
    }

    /// Queue a repaired copy of the local data, produced by the embedding
    /// layer after it found the local state inconsistent.
    pub fn queue_repair(&self, repaired: &Value) -> Result<Operation> {
        self.import_backup(repaired, SyncImportReason::Repair)
    }

    /// Current state as a backup document.
    pub fn export_backup(&self) -> Result<Value> {
        Ok(backup_from_state(&self.store.current_state()?))
    }
}
