//! Sync cycle orchestration.
//!
//! One cycle runs: auto-encryption check, server migration check, upload,
//! download, apply, compact, status report. Cycles are single-flight; a
//! trigger arriving mid-cycle is folded into one follow-up cycle.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chrono::Utc;
use tasksync_common::{Error, OpId, OpType, Operation, Result, SyncImportReason};
use tasksync_crypto::PayloadCipher;
use tasksync_oplog::{migrate_operation, AppState, Migrated, OpLogStore, WriteStamp};
use tasksync_provider::{RemoteOp, SyncProvider, UploadRequest};

use crate::cipher::{encrypt_op, open_op, CipherCache, OpenFailure};
use crate::classifier::{
    classify_failure, classify_rejection, failure_reason, FailureAction, RejectionAction,
};
use crate::config::{ConfigStore, SyncConfig};
use crate::conflict::{
    ImportConflict, ImportConflictHandler, ImportConflictScenario, ImportResolution,
    StaticConflictHandler,
};
use crate::observer::{Alert, NoopObserver, SyncObserver};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::status::{StatusReport, SyncOutcome, SyncStatus, TriggerOutcome};
use crate::write_guard::BeingWrittenSet;

/// Whether the rest of the cycle should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Halt,
}

/// Drives sync cycles for one local operation log.
pub struct SyncEngine {
    pub(crate) store: Arc<OpLogStore>,
    provider: RwLock<Arc<dyn SyncProvider>>,
    pub(crate) config_store: Arc<dyn ConfigStore>,
    pub(crate) config: SyncConfig,
    pub(crate) observer: Arc<dyn SyncObserver>,
    pub(crate) conflicts: Arc<dyn ImportConflictHandler>,
    pub(crate) crypto_probe: Arc<dyn Fn() -> bool + Send + Sync>,
    pub(crate) ciphers: CipherCache,
    retry: RetryExecutor,
    /// Held for the whole of a cycle and of every destructive remote flow.
    pub(crate) cycle_lock: tokio::sync::Mutex<()>,
    trigger_pending: AtomicBool,
    status: Mutex<StatusReport>,
    pub(crate) auto_migration_done: AtomicBool,
    pub(crate) key_endpoint_unsupported: AtomicBool,
    sync_disabled: AtomicBool,
    upload_chunk: AtomicUsize,
    shutdown: CancellationToken,
    being_written: BeingWrittenSet,
    /// Applied remote ops whose notification waits for a write guard.
    deferred_notices: Mutex<Vec<Operation>>,
}

impl SyncEngine {
    /// Create an engine over a local log and a remote.
    ///
    /// # Postconditions
    /// - No observer is attached and import conflicts resolve to the
    ///   remote until `with_observer` / `with_conflict_handler` say otherwise
    /// - The upload chunk starts at `config.max_ops_per_upload`
    pub fn new(
        store: Arc<OpLogStore>,
        provider: Arc<dyn SyncProvider>,
        config_store: Arc<dyn ConfigStore>,
        config: SyncConfig,
    ) -> Self {
        let retry = RetryExecutor::new(
            RetryConfig::new(config.max_retries).with_initial_delay(config.retry_initial_delay()),
        );
        Self {
            store,
            provider: RwLock::new(provider),
            config_store,
            ciphers: CipherCache::new(config.kdf),
            upload_chunk: AtomicUsize::new(config.max_ops_per_upload.max(1)),
            config,
            observer: Arc::new(NoopObserver),
            conflicts: Arc::new(StaticConflictHandler::default()),
            crypto_probe: Arc::new(tasksync_crypto::is_available),
            retry,
            cycle_lock: tokio::sync::Mutex::new(()),
            trigger_pending: AtomicBool::new(false),
            status: Mutex::new(StatusReport::default()),
            auto_migration_done: AtomicBool::new(false),
            key_endpoint_unsupported: AtomicBool::new(false),
            sync_disabled: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            being_written: BeingWrittenSet::new(),
            deferred_notices: Mutex::new(Vec::new()),
        }
    }

    /// Attach the receiver of status changes, applied ops and alerts.
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Attach the party that breaks ties between a full-state import and
    /// local or remote changes.
    pub fn with_conflict_handler(mut self, handler: Arc<dyn ImportConflictHandler>) -> Self {
        self.conflicts = handler;
        self
    }

    /// Replace the check run before destructive encryption flows.
    pub fn with_crypto_probe(mut self, probe: Arc<dyn Fn() -> bool + Send + Sync>) -> Self {
        self.crypto_probe = probe;
        self
    }

    /// The local operation log.
    pub fn store(&self) -> &Arc<OpLogStore> {
        &self.store
    }

    /// Ids the embedding layer is currently writing. Remote changes to a
    /// held id are applied at once but reported only after its release.
    pub fn being_written(&self) -> &BeingWrittenSet {
        &self.being_written
    }

    pub(crate) async fn provider(&self) -> Arc<dyn SyncProvider> {
        Arc::clone(&*self.provider.read().await)
    }

    /// Switch remote. Waits for a running cycle to finish; the next cycle
    /// detects the new target.
    pub async fn set_provider(&self, provider: Arc<dyn SyncProvider>) {
        let _cycle = self.cycle_lock.lock().await;
        info!("Switching sync provider to {}", provider.account_key());
        *self.provider.write().await = provider;
    }

    /// Record a local mutation.
    ///
    /// When the caller already holds the id in [`Self::being_written`] the
    /// write goes ahead under the caller's guard; the log serializes appends.
    pub fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        op_type: OpType,
        payload: Value,
    ) -> Result<Operation> {
        let guard = self.being_written.begin(entity_id);
        if guard.is_none() {
            debug!("Recording {} under an existing write guard", entity_id);
        }
        let op = self.store.record(entity_type, entity_id, op_type, payload)?;
        drop(guard);
        Ok(op)
    }

    /// Current materialized state.
    pub fn state(&self) -> Result<AppState> {
        self.store.current_state()
    }

    /// Status of the last or running cycle.
    pub fn status(&self) -> StatusReport {
        let mut report = self
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        report.sync_disabled = self.is_sync_disabled();
        report
    }

    /// Current upload chunk size. Shrinks after a payload-too-large answer
    /// and grows back after clean cycles.
    pub fn upload_chunk_size(&self) -> usize {
        self.upload_chunk.load(Ordering::SeqCst)
    }

    /// Whether the last finished cycle ended in `Error`.
    pub fn has_sync_error(&self) -> bool {
        self.status().has_sync_error()
    }

    /// Whether a cancelled import conflict switched sync off.
    pub fn is_sync_disabled(&self) -> bool {
        self.sync_disabled.load(Ordering::SeqCst)
    }

    /// Re-enable sync after an import conflict was cancelled.
    pub fn enable_sync(&self) {
        if self.sync_disabled.swap(false, Ordering::SeqCst) {
            info!("Sync re-enabled");
        }
    }

    pub(crate) fn disable_sync(&self, conflict: ImportConflict) {
        self.sync_disabled.store(true, Ordering::SeqCst);
        warn!("Sync disabled until the import conflict is resolved");
        self.observer.on_alert(&Alert::SyncDisabled(conflict));
    }

    /// Abandon any running cycle and refuse new remote calls.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn set_status(&self, status: SyncStatus, reason: Option<&str>) {
        if let Ok(mut report) = self.status.lock() {
            report.status = status;
            report.reason = reason.map(str::to_string);
            if matches!(status, SyncStatus::InSync | SyncStatus::Error) {
                report.last_cycle_at = Some(Utc::now());
            }
        }
        self.observer.on_status(status, reason);
    }

    /// Run one remote call bounded by the request timeout, retrying
    /// transient failures and giving up on shutdown.
    pub(crate) async fn remote<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let bounded = tokio::time::timeout(self.config.request_timeout(), self.retry.execute(call));
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
            result = bounded => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!("Remote {} timed out", what);
                    Err(Error::Timeout(what.to_string()))
                }
            },
        }
    }

    /// Run a cycle, waiting for a running one to finish first.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let guard = self.cycle_lock.lock().await;
        self.run_locked(guard).await
    }

    /// Run a cycle unless one is already running, in which case one more
    /// cycle is scheduled to follow it.
    pub async fn trigger(&self) -> Result<TriggerOutcome> {
        match self.cycle_lock.try_lock() {
            Ok(guard) => self.run_locked(guard).await.map(TriggerOutcome::Ran),
            Err(_) => {
                debug!("Cycle in progress, coalescing trigger");
                self.trigger_pending.store(true, Ordering::SeqCst);
                Ok(TriggerOutcome::Coalesced)
            }
        }
    }

    async fn run_locked(&self, _guard: MutexGuard<'_, ()>) -> Result<SyncOutcome> {
        loop {
            if self.is_sync_disabled() {
                return Err(Error::Config(
                    "Sync is disabled until the import conflict is resolved".to_string(),
                ));
            }
            self.trigger_pending.store(false, Ordering::SeqCst);
            let outcome = self.run_cycle().await;
            if outcome.is_err() || !self.trigger_pending.swap(false, Ordering::SeqCst) {
                return outcome;
            }
            debug!("Running coalesced follow-up cycle");
        }
    }

    async fn run_cycle(&self) -> Result<SyncOutcome> {
        let started = Instant::now();
        let mut outcome = SyncOutcome::new(SyncStatus::InSync);

        self.maybe_migrate_to_auto_encryption().await;

        let result = self.cycle_steps(&mut outcome).await;
        outcome.duration = started.elapsed();

        if let Err(e) = result {
            let reason = failure_reason(&e);
            match classify_failure(&e) {
                FailureAction::Abandon | FailureAction::Fatal => {
                    self.set_status(SyncStatus::Error, Some(&reason));
                    return Err(e);
                }
                FailureAction::Reauthenticate => {
                    self.observer.on_alert(&Alert::AuthenticationRequired);
                }
                FailureAction::ShrinkBatch | FailureAction::RetryNextCycle => {}
            }
            warn!("Sync cycle failed: {}", e);
            outcome.fail(reason);
        }

        self.set_status(outcome.status, outcome.reason.as_deref());
        info!(
            "Sync cycle {:?}: {} up, {} rejected, {} down, {} applied, {} skipped in {:?}",
            outcome.status,
            outcome.uploaded,
            outcome.rejected,
            outcome.downloaded,
            outcome.applied,
            outcome.skipped,
            outcome.duration
        );
        Ok(outcome)
    }

    async fn cycle_steps(&self, outcome: &mut SyncOutcome) -> Result<()> {
        let settings = self.config_store.load().await?;
        let (_, cfg) = settings.active()?;
        let cipher = self.ciphers.for_cfg(cfg)?;
        let cipher = cipher.as_deref();
        let provider = self.provider().await;

        self.check_server_migration(&provider, cipher, outcome).await?;

        self.set_status(SyncStatus::Uploading, None);
        if self.upload_pending(&provider, cipher, outcome).await? == Flow::Halt {
            return Ok(());
        }

        self.set_status(SyncStatus::Downloading, None);
        let since = self.store.last_server_seq()?;
        let remote_ops = self.download_since(&provider, since).await?;
        outcome.downloaded += remote_ops.len();

        self.set_status(SyncStatus::Applying, None);
        if self.apply_remote(&provider, cipher, remote_ops, true, outcome).await? == Flow::Halt {
            return Ok(());
        }

        self.store.compact()?;
        self.store.set_sync_target(&provider.account_key())?;
        Ok(())
    }

    /// Upload pending local ops: a pending import first, then the rest in
    /// chunks. Each op is attempted at most once per cycle.
    async fn upload_pending(
        &self,
        provider: &Arc<dyn SyncProvider>,
        cipher: Option<&PayloadCipher>,
        outcome: &mut SyncOutcome,
    ) -> Result<Flow> {
        if self.upload_pending_import(provider, cipher, outcome).await? == Flow::Halt {
            return Ok(Flow::Halt);
        }

        let mut attempted: HashSet<OpId> = HashSet::new();
        loop {
            let chunk = self.upload_chunk.load(Ordering::SeqCst).max(1);
            let batch = self.next_batch(&attempted, chunk, cipher)?;
            if batch.is_empty() {
                self.grow_upload_chunk(chunk);
                return Ok(Flow::Continue);
            }
            attempted.extend(batch.iter().map(|op| op.id.clone()));

            let request = UploadRequest {
                ops: batch,
                client_id: self.store.client_id().clone(),
                last_known_server_seq: self.store.last_server_seq()?,
            };
            let response = match self.remote("upload", || provider.upload_ops(&request)).await {
                Ok(response) => response,
                Err(e) => {
                    if classify_failure(&e) == FailureAction::ShrinkBatch {
                        let smaller = (request.ops.len() / 2).max(1);
                        self.upload_chunk.store(smaller, Ordering::SeqCst);
                        let pending_ops = self.store.pending_count()?;
                        warn!(
                            "Upload of {} ops too large; retrying in chunks of {}",
                            request.ops.len(),
                            smaller
                        );
                        self.observer.on_alert(&Alert::PayloadTooLarge { pending_ops });
                    }
                    return Err(e);
                }
            };

            let mut rejected: HashMap<&OpId, RejectionAction> = HashMap::new();
            for rejection in &response.rejected_ops {
                let action = classify_rejection(rejection);
                if action == RejectionAction::RejectPermanently {
                    self.store.mark_rejected(&rejection.op_id, &rejection.error)?;
                    outcome.rejected += 1;
                    outcome.fail(format!("Operation rejected by server: {}", rejection.error));
                }
                rejected.insert(&rejection.op_id, action);
            }
            let synced: Vec<OpId> = request
                .ops
                .iter()
                .filter(|op| {
                    rejected
                        .get(&op.id)
                        .map_or(true, |a| *a == RejectionAction::MarkSynced)
                })
                .map(|op| op.id.clone())
                .collect();
            self.store.mark_synced(&synced)?;
            outcome.uploaded += synced.len();
            debug!(
                "Uploaded {} ops, {} rejected, server at seq {}",
                synced.len(),
                response.rejected_ops.len(),
                response.latest_seq
            );

            if !response.piggybacked.is_empty() {
                debug!("Applying {} piggybacked ops", response.piggybacked.len());
                let flow = self
                    .apply_remote(provider, cipher, response.piggybacked, false, outcome)
                    .await?;
                if flow == Flow::Halt {
                    return Ok(Flow::Halt);
                }
            }
        }
    }

    /// Double the chunk after a cycle that uploaded everything, up to the
    /// configured maximum.
    fn grow_upload_chunk(&self, chunk: usize) {
        let max = self.config.max_ops_per_upload.max(1);
        if chunk < max {
            let grown = chunk.saturating_mul(2).min(max);
            debug!("Upload chunk back to {} ops", grown);
            self.upload_chunk.store(grown, Ordering::SeqCst);
        }
    }

    /// Next upload batch, bounded by op count and serialized size, sealed
    /// for the wire. Always holds at least one op when any is pending.
    fn next_batch(
        &self,
        attempted: &HashSet<OpId>,
        chunk: usize,
        cipher: Option<&PayloadCipher>,
    ) -> Result<Vec<Operation>> {
        let candidates = self.store.pending_ops(attempted.len() + chunk)?;
        let mut batch = Vec::new();
        let mut bytes = 0;
        for op in candidates {
            if op.is_full_state() || attempted.contains(&op.id) {
                continue;
            }
            let sealed = encrypt_op(&op, cipher)?;
            let size = serde_json::to_vec(&sealed)?.len();
            if !batch.is_empty() && bytes + size > self.config.max_upload_bytes {
                break;
            }
            bytes += size;
            batch.push(sealed);
            if batch.len() >= chunk {
                break;
            }
        }
        Ok(batch)
    }

    /// Every remote op past `since`, all pages.
    pub(crate) async fn download_since(
        &self,
        provider: &Arc<dyn SyncProvider>,
        since: u64,
    ) -> Result<Vec<RemoteOp>> {
        let limit = self.config.download_page_limit.max(1);
        let mut cursor = since;
        let mut all = Vec::new();
        loop {
            let page = self
                .remote("download", || provider.download_ops(cursor, limit))
                .await?;
            let more = page.has_more && !page.ops.is_empty();
            if let Some(last) = page.ops.last() {
                cursor = last.server_seq;
            }
            all.extend(page.ops);
            if !more {
                return Ok(all);
            }
        }
    }

    /// Validate a batch of remote ops in full, then apply it.
    ///
    /// Damaged payloads, ops written by a newer client and unmigrateable
    /// ones are skipped individually; their sequence numbers are still
    /// consumed. Sealed payloads this device cannot open fail the whole
    /// batch before anything is applied, unless other sealed ops in the
    /// same batch did open, in which case only those few are skipped.
    pub(crate) async fn apply_remote(
        &self,
        provider: &Arc<dyn SyncProvider>,
        cipher: Option<&PayloadCipher>,
        remote_ops: Vec<RemoteOp>,
        advance_cursor: bool,
        outcome: &mut SyncOutcome,
    ) -> Result<Flow> {
        let max_seq = remote_ops.iter().map(|r| r.server_seq).max();

        let mut ready = Vec::new();
        let mut sealed_opened = 0;
        let mut locked = Vec::new();
        for remote in remote_ops {
            let plain = match open_op(&remote.op, cipher) {
                Ok(op) => {
                    if remote.op.is_payload_encrypted {
                        sealed_opened += 1;
                    }
                    op
                }
                Err(OpenFailure::Corrupt(e)) => {
                    warn!("Skipping damaged remote op {}: {}", remote.op.id, e);
                    outcome.skipped += 1;
                    continue;
                }
                Err(OpenFailure::Locked(e)) => {
                    locked.push((remote.op.id.clone(), e));
                    continue;
                }
            };
            match migrate_operation(plain) {
                Ok(Migrated::Ready(op)) => ready.push(op),
                Ok(Migrated::TooNew { .. }) => outcome.skipped += 1,
                Err(e) => {
                    warn!("Skipping unreadable remote op {}: {}", remote.op.id, e);
                    outcome.skipped += 1;
                }
            }
        }

        if !locked.is_empty() {
            if sealed_opened == 0 {
                let (_, e) = locked.swap_remove(0);
                return Err(e);
            }
            for (id, e) in locked {
                warn!("Skipping remote op {} that does not open: {}", id, e);
                outcome.skipped += 1;
            }
        }

        let applied_clock = self.store.applied_clock()?;
        let incoming_import = ready
            .iter()
            .rev()
            .find(|op| op.is_full_state() && !op.is_duplicate_of(&applied_clock))
            .cloned();
        let mut keep_local = None;
        if let Some(import) = incoming_import {
            let superseded = self.superseded_local_ops(&import)?;
            if superseded > 0 {
                let conflict = ImportConflict {
                    scenario: ImportConflictScenario::IncomingImport,
                    reason: import.sync_import_reason.unwrap_or(SyncImportReason::ForceUpload),
                    affected_ops: superseded,
                };
                match self.conflicts.resolve(&conflict).await {
                    ImportResolution::UseRemote => {
                        self.store.discard_pending()?;
                    }
                    ImportResolution::UseLocal => {
                        info!("Keeping local data over remote import {}", import.id);
                        ready.retain(|op| !op.is_full_state());
                        keep_local = Some(import);
                    }
                    ImportResolution::Cancel => {
                        self.disable_sync(conflict);
                        outcome.fail("Sync disabled: import conflict left unresolved");
                        return Ok(Flow::Halt);
                    }
                }
            }
        }

        let mut applied = Vec::new();
        for op in ready {
            if self.store.append_remote(&op)?.is_some() {
                applied.push(op);
            }
        }
        outcome.applied += applied.len();
        if advance_cursor {
            if let Some(seq) = max_seq {
                let cursor = self.store.last_server_seq()?;
                self.store.set_last_server_seq(cursor.max(seq))?;
            }
        }

        self.notify_applied(applied);

        if let Some(import) = keep_local {
            // Our next import must supersede the one we declined.
            self.store.observe_clock(&import.vector_clock)?;
            self.force_upload_locked(provider, cipher, outcome).await?;
        }
        Ok(Flow::Continue)
    }

    /// Report applied remote ops, holding back those whose record is being
    /// written until a later pass finds it released.
    fn notify_applied(&self, applied: Vec<Operation>) {
        let mut waiting = match self.deferred_notices.lock() {
            Ok(waiting) => waiting,
            Err(poisoned) => poisoned.into_inner(),
        };
        waiting.extend(applied);
        let (held, visible): (Vec<Operation>, Vec<Operation>) = waiting
            .drain(..)
            .partition(|op| self.being_written.contains(&op.entity_id));
        *waiting = held;
        if !waiting.is_empty() {
            debug!("Deferring notice of {} ops being written", waiting.len());
        }
        drop(waiting);
        if !visible.is_empty() {
            self.observer.on_remote_applied(&visible);
        }
    }

    /// Local ops, pending or not yet compacted, that `import` would discard:
    /// written concurrently with it and ordered below it.
    fn superseded_local_ops(&self, import: &Operation) -> Result<usize> {
        let floor = WriteStamp::of(import);
        Ok(self
            .store
            .unfolded_local_ops()?
            .iter()
            .filter(|op| !op.is_duplicate_of(&import.vector_clock) && WriteStamp::of(op) <= floor)
            .count())
    }
}
